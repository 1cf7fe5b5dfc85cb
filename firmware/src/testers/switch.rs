//! Switch-time test.
//!
//! Measures the interval between mains loss and inverter pickup against
//! the configured switch window.

use rig_core::lifecycle::TestIo;
use rig_core::types::TestType;

use crate::events;
use crate::settings;
use crate::sync::SWITCH_VERDICTS;
use crate::testers::{capture::SWITCH_CAPTURE, offer_verdict, run_one};

/// Handles one activation of the switch-time control bit.
pub async fn service(io: &mut impl TestIo) {
    let bit = TestType::SwitchTime.mask_bit();
    let tolerance = settings::test().switch_window;
    if let Some(verdict) = run_one(TestType::SwitchTime, tolerance, &SWITCH_CAPTURE, io).await {
        // Verdict first, then the bit: the observer treats a clear
        // control channel as "safe to dispatch the next test".
        offer_verdict(&SWITCH_VERDICTS, verdict).await;
    }
    events::TEST_CONTROL.clear_bits(bit);
}
