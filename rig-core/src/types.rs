//! Shared identifiers for the rig: test kinds, load levels and the
//! auto/manual operating mode.
//!
//! Everything here is `Copy` and representable in a handful of bits so the
//! same values can ride in event-group words, status-word slots and queue
//! payloads without translation tables.

/// Kinds of conformance test the rig can schedule.
///
/// Switch and backup timing tests have run loops today; the remaining kinds
/// are addressable over the wire protocol but not yet executable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TestType {
    SwitchTime,
    BackupTime,
    Efficiency,
    InputVoltage,
    Waveform,
    TunePwm,
}

impl TestType {
    /// One-hot mask bit used on the test-control event channel.
    pub const fn mask_bit(self) -> u32 {
        1 << self.index()
    }

    /// Deterministic index for table lookups.
    pub const fn index(self) -> usize {
        match self {
            TestType::SwitchTime => 0,
            TestType::BackupTime => 1,
            TestType::Efficiency => 2,
            TestType::InputVoltage => 3,
            TestType::Waveform => 4,
            TestType::TunePwm => 5,
        }
    }

    /// Non-zero code stored in a status-word slot. Zero is reserved for
    /// "slot empty".
    pub const fn code(self) -> u8 {
        self.index() as u8 + 1
    }

    /// Attempts to construct a [`TestType`] from a slot code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TestType::SwitchTime),
            2 => Some(TestType::BackupTime),
            3 => Some(TestType::Efficiency),
            4 => Some(TestType::InputVoltage),
            5 => Some(TestType::Waveform),
            6 => Some(TestType::TunePwm),
            _ => None,
        }
    }

    pub const COUNT: usize = 6;
}

/// Load applied to the UPS during a test, as a fraction of its VA rating.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadLevel {
    L0,
    L25,
    L50,
    L75,
    L100,
}

impl LoadLevel {
    pub const fn percent(self) -> u8 {
        match self {
            LoadLevel::L0 => 0,
            LoadLevel::L25 => 25,
            LoadLevel::L50 => 50,
            LoadLevel::L75 => 75,
            LoadLevel::L100 => 100,
        }
    }

    pub const fn index(self) -> usize {
        match self {
            LoadLevel::L0 => 0,
            LoadLevel::L25 => 1,
            LoadLevel::L50 => 2,
            LoadLevel::L75 => 3,
            LoadLevel::L100 => 4,
        }
    }

    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(LoadLevel::L0),
            1 => Some(LoadLevel::L25),
            2 => Some(LoadLevel::L50),
            3 => Some(LoadLevel::L75),
            4 => Some(LoadLevel::L100),
            _ => None,
        }
    }

    /// The VA this level draws from a rated supply, rounded down.
    pub const fn apply_to(self, rated_va: u16) -> u16 {
        (rated_va as u32 * self.percent() as u32 / 100) as u16
    }

    pub const COUNT: usize = 5;
}

/// Operating mode for test sequencing.
///
/// Auto chains pending tests without operator input; Manual parks between
/// tests until the operator issues a start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TestMode {
    Auto,
    Manual,
}
