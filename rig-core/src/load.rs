//! Load-bank planning.
//!
//! The rig drives four resistive banks, each sized for a quarter of the UPS
//! rating, trimmed by a PWM channel. Planning is pure arithmetic over the
//! settings snapshots; the firmware applies the result to pins.

use crate::settings::{SpecSetup, TuningSetup};

/// Resolution of the load PWM channel.
pub const PWM_FULL_SCALE: u16 = 255;

/// Banks engaged plus the trimmed PWM value to program.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LoadPlan {
    /// Number of banks to switch in, 1 through 4. Zero VA still engages
    /// one bank so the PWM path stays calibrated.
    pub banks: u8,
    /// Duty value for the PWM channel, clamped to full scale.
    pub pwm_value: u16,
}

/// Computes the bank selection and PWM duty for a requested VA draw.
///
/// A request exactly on a tier boundary stays in the lower tier; a request
/// beyond the rated VA saturates at all four banks, full duty plus trim.
#[must_use]
pub fn load_plan(test_va: u16, spec: &SpecSetup, tuning: &TuningSetup) -> LoadPlan {
    let single_bank_va = spec.rating_va / 4;

    let mut banks = 4u8;
    for tier in 1..=3u8 {
        if test_va <= single_bank_va * u16::from(tier) {
            banks = tier;
            break;
        }
    }

    let tier_va = single_bank_va * u16::from(banks);
    let pwm = if tier_va == 0 {
        0
    } else {
        // Linear map of the request into the engaged tier's range.
        let scaled = u32::from(test_va.min(tier_va)) * u32::from(PWM_FULL_SCALE)
            / u32::from(tier_va);
        scaled as u16
    };

    let trim = tuning.trim_for_tier(banks);
    let trimmed = i32::from(pwm) + i32::from(trim);
    let pwm_value = trimmed.clamp(0, i32::from(PWM_FULL_SCALE)) as u16;

    LoadPlan {
        banks: banks.max(1),
        pwm_value,
    }
}
