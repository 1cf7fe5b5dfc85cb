//! Rig configuration snapshots.
//!
//! Settings travel as small `Copy` value structs: a writer validates the
//! update here, then the firmware registry pushes the whole snapshot to its
//! observers. Run loops read their cached copy without locking and refresh
//! when the registry signals a change.
//!
//! Every mutator range-checks before touching the struct; a rejected write
//! returns [`SettingsError::OutOfRange`] and leaves the snapshot unchanged.

use crate::types::TestMode;

/// Limits for a plausible UPS under test.
pub const UPS_MIN_VA: u16 = 100;
pub const UPS_MAX_VA: u16 = 4000;
pub const UPS_MIN_INPUT_VOLT: u16 = 180;
pub const UPS_MAX_INPUT_VOLT: u16 = 250;
pub const UPS_MAX_SWITCHING_TIME_MS: u32 = 10_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SettingsError {
    OutOfRange,
}

/// Nameplate figures for the UPS under test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpecSetup {
    pub rating_va: u16,
    pub rated_voltage_v: u16,
    pub rated_current_a: u16,
    pub min_input_voltage_v: u16,
    pub max_input_voltage_v: u16,
    pub avg_switch_time_ms: u32,
    pub avg_backup_time_ms: u32,
    pub last_update_ms: u64,
}

impl Default for SpecSetup {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecSetup {
    pub const fn new() -> Self {
        Self {
            rating_va: 2000,
            rated_voltage_v: 230,
            rated_current_a: 6,
            min_input_voltage_v: 180,
            max_input_voltage_v: 230,
            avg_switch_time_ms: 50,
            avg_backup_time_ms: 300_000,
            last_update_ms: 0,
        }
    }

    pub fn set_rating_va(&mut self, value: u16, now_ms: u64) -> Result<(), SettingsError> {
        if !(UPS_MIN_VA..=UPS_MAX_VA).contains(&value) {
            return Err(SettingsError::OutOfRange);
        }
        self.rating_va = value;
        self.last_update_ms = now_ms;
        Ok(())
    }

    pub fn set_rated_voltage(&mut self, value: u16, now_ms: u64) -> Result<(), SettingsError> {
        if !(UPS_MIN_INPUT_VOLT..=UPS_MAX_INPUT_VOLT).contains(&value) {
            return Err(SettingsError::OutOfRange);
        }
        self.rated_voltage_v = value;
        self.last_update_ms = now_ms;
        Ok(())
    }
}

/// Acceptance window for a measured interval, bounds inclusive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ToleranceWindow {
    pub min_ms: u32,
    pub max_ms: u32,
}

impl ToleranceWindow {
    /// A window must have a non-zero lower bound and not be inverted.
    pub fn new(min_ms: u32, max_ms: u32) -> Result<Self, SettingsError> {
        if min_ms == 0 || max_ms < min_ms {
            return Err(SettingsError::OutOfRange);
        }
        Ok(Self { min_ms, max_ms })
    }

    pub const fn contains(self, elapsed_ms: u32) -> bool {
        elapsed_ms >= self.min_ms && elapsed_ms <= self.max_ms
    }
}

/// Per-campaign test parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TestSetup {
    pub mode: TestMode,
    pub test_va_rating: u16,
    pub input_voltage_v: u16,
    pub test_duration_ms: u32,
    pub switch_window: ToleranceWindow,
    pub backup_window: ToleranceWindow,
    pub max_retest: u8,
    pub last_update_ms: u64,
}

impl Default for TestSetup {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSetup {
    pub const fn new() -> Self {
        Self {
            mode: TestMode::Auto,
            test_va_rating: 3000,
            input_voltage_v: 220,
            test_duration_ms: 600_000,
            switch_window: ToleranceWindow {
                min_ms: 1,
                max_ms: 3000,
            },
            backup_window: ToleranceWindow {
                min_ms: 1,
                max_ms: 300_000,
            },
            max_retest: 3,
            last_update_ms: 0,
        }
    }

    pub fn set_test_va_rating(&mut self, value: u16, now_ms: u64) -> Result<(), SettingsError> {
        if !(UPS_MIN_VA..=UPS_MAX_VA).contains(&value) {
            return Err(SettingsError::OutOfRange);
        }
        self.test_va_rating = value;
        self.last_update_ms = now_ms;
        Ok(())
    }

    pub fn set_test_duration(&mut self, value_ms: u32, now_ms: u64) -> Result<(), SettingsError> {
        if value_ms == 0 {
            return Err(SettingsError::OutOfRange);
        }
        self.test_duration_ms = value_ms;
        self.last_update_ms = now_ms;
        Ok(())
    }

    pub fn set_switch_window(
        &mut self,
        min_ms: u32,
        max_ms: u32,
        now_ms: u64,
    ) -> Result<(), SettingsError> {
        if max_ms > UPS_MAX_SWITCHING_TIME_MS {
            return Err(SettingsError::OutOfRange);
        }
        self.switch_window = ToleranceWindow::new(min_ms, max_ms)?;
        self.last_update_ms = now_ms;
        Ok(())
    }

    pub fn set_backup_window(
        &mut self,
        min_ms: u32,
        max_ms: u32,
        now_ms: u64,
    ) -> Result<(), SettingsError> {
        self.backup_window = ToleranceWindow::new(min_ms, max_ms)?;
        self.last_update_ms = now_ms;
        Ok(())
    }
}

/// PWM channel parameters for the load-bank drive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HardwareSetup {
    pub pwm_channel: u8,
    pub pwm_resolution_bits: u8,
    pub pwm_frequency_hz: u32,
    pub last_update_ms: u64,
}

impl Default for HardwareSetup {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareSetup {
    pub const fn new() -> Self {
        Self {
            pwm_channel: 0,
            pwm_resolution_bits: 8,
            pwm_frequency_hz: 3000,
            last_update_ms: 0,
        }
    }
}

/// Per-tier PWM duty trim, applied after the linear VA-to-duty map to
/// correct for load-bank element tolerances.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TuningSetup {
    pub adjust_pwm_25: i16,
    pub adjust_pwm_50: i16,
    pub adjust_pwm_75: i16,
    pub adjust_pwm_100: i16,
    pub last_update_ms: u64,
}

impl TuningSetup {
    pub const fn new() -> Self {
        Self {
            adjust_pwm_25: 0,
            adjust_pwm_50: 0,
            adjust_pwm_75: 0,
            adjust_pwm_100: 0,
            last_update_ms: 0,
        }
    }

    pub const fn trim_for_tier(self, tier: u8) -> i16 {
        match tier {
            1 => self.adjust_pwm_25,
            2 => self.adjust_pwm_50,
            3 => self.adjust_pwm_75,
            _ => self.adjust_pwm_100,
        }
    }
}
