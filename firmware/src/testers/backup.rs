//! Backup-time test.
//!
//! Measures how long the UPS carries the load on battery, from mains
//! loss to inverter shutdown, against the configured backup window.

use rig_core::lifecycle::TestIo;
use rig_core::types::TestType;

use crate::events;
use crate::settings;
use crate::sync::BACKUP_VERDICTS;
use crate::testers::{capture::BACKUP_CAPTURE, offer_verdict, run_one};

/// Handles one activation of the backup-time control bit.
pub async fn service(io: &mut impl TestIo) {
    let bit = TestType::BackupTime.mask_bit();
    let tolerance = settings::test().backup_window;
    if let Some(verdict) = run_one(TestType::BackupTime, tolerance, &BACKUP_CAPTURE, io).await {
        offer_verdict(&BACKUP_VERDICTS, verdict).await;
    }
    events::TEST_CONTROL.clear_bits(bit);
}
