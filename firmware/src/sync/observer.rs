//! Scheduler observer.
//!
//! The observer is the sequencing authority: it folds verdicts back into
//! the scheduler, then dispatches the next pending test when the rig is
//! idle and in auto mode. Manual mode leaves dispatch to the operator's
//! START; the observer still consumes verdicts so bookkeeping never
//! stalls.
//!
//! The loop runs between a start and a stop flag on the sync channel and
//! reports its side of the handshake through the manager flags.

use embassy_time::{Duration, Timer};

use rig_core::types::{TestMode, TestType};

use crate::events::{self, phase, sync_flag};
use crate::log::{log_info, log_warn};
use crate::settings;
use crate::status;
use crate::sync::{BACKUP_VERDICTS, SCHEDULER, SWITCH_VERDICTS};

const OBSERVER_TICK: Duration = Duration::from_millis(200);

const fn dispatchable(test_type: TestType) -> bool {
    matches!(test_type, TestType::SwitchTime | TestType::BackupTime)
}

/// One observer pass: drain submissions, fold verdicts, dispatch.
/// Verdicts are folded before dispatch so a just-finished test cannot be
/// picked up a second time.
pub fn step() {
    SCHEDULER.drain();

    let max_retest = settings::test().max_retest;
    while let Ok(verdict) = SWITCH_VERDICTS.try_receive() {
        SCHEDULER.on_verdict(verdict, max_retest);
    }
    while let Ok(verdict) = BACKUP_VERDICTS.try_receive() {
        SCHEDULER.on_verdict(verdict, max_retest);
    }

    if status::test_mode() != TestMode::Auto {
        return;
    }
    if events::TEST_CONTROL.get() & events::all_test_bits() != 0 {
        // Something is still running; one test at a time.
        return;
    }
    if let Some(pending) = status::pending_test() {
        if dispatchable(pending.test_type) {
            events::TEST_PHASE.set_bits(phase::PENDING_TEST_FOUND);
            events::TEST_CONTROL.set_bits(pending.test_type.mask_bit());
        } else {
            // Addressable over the wire but without a run loop yet.
            log_warn("test kind has no run loop, skipping");
            events::raise_sync_flag(sync_flag::SKIP_TEST);
            SCHEDULER.delete(rig_core::sched::RequiredTest {
                test_type: pending.test_type,
                load: pending.load,
            });
        }
    }
}

pub async fn run_loop() -> ! {
    loop {
        events::SYNC_CONTROL
            .wait_bits(sync_flag::START_OBSERVER, true, false, None)
            .await;
        events::raise_sync_flag(sync_flag::MANAGER_ACTIVE);
        log_info("observer active");
        loop {
            if events::SYNC_CONTROL.take(sync_flag::STOP_OBSERVER) != 0 {
                events::raise_sync_flag(sync_flag::MANAGER_WAIT);
                log_info("observer parked");
                break;
            }
            step();
            Timer::after(OBSERVER_TICK).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::TestVerdict;
    use rig_core::lifecycle::TestOutcome;
    use rig_core::sched::RequiredTest;
    use rig_core::status::SchedulerStatus;
    use rig_core::types::LoadLevel;

    fn reset() {
        status::reset_status_word();
        events::TEST_CONTROL.reset();
        events::SYNC_CONTROL.reset();
        status::publish_test_mode(TestMode::Auto);
    }

    #[test]
    fn auto_step_dispatches_the_lowest_pending_test() {
        let _guard = crate::testutil::global_lock();
        reset();
        SCHEDULER
            .submit(RequiredTest {
                test_type: TestType::BackupTime,
                load: LoadLevel::L75,
            })
            .unwrap();

        step();
        assert_ne!(
            events::TEST_CONTROL.get() & TestType::BackupTime.mask_bit(),
            0
        );
        // A second pass while the test runs dispatches nothing new.
        step();
        assert_eq!(
            events::TEST_CONTROL.get() & !TestType::BackupTime.mask_bit() & events::all_test_bits(),
            0
        );

        SCHEDULER.delete(RequiredTest {
            test_type: TestType::BackupTime,
            load: LoadLevel::L75,
        });
        reset();
    }

    #[test]
    fn manual_mode_never_auto_dispatches() {
        let _guard = crate::testutil::global_lock();
        reset();
        status::publish_test_mode(TestMode::Manual);
        SCHEDULER
            .submit(RequiredTest {
                test_type: TestType::SwitchTime,
                load: LoadLevel::L25,
            })
            .unwrap();

        step();
        assert_eq!(events::TEST_CONTROL.get() & events::all_test_bits(), 0);

        SCHEDULER.delete(RequiredTest {
            test_type: TestType::SwitchTime,
            load: LoadLevel::L25,
        });
        reset();
    }

    #[test]
    fn verdict_is_folded_before_the_next_dispatch() {
        let _guard = crate::testutil::global_lock();
        reset();
        let request = RequiredTest {
            test_type: TestType::SwitchTime,
            load: LoadLevel::L50,
        };
        SCHEDULER.submit(request).unwrap();
        step();

        // The run loop finished: verdict queued, control bit lowered.
        events::TEST_CONTROL.clear_bits(TestType::SwitchTime.mask_bit());
        SWITCH_VERDICTS
            .try_send(TestVerdict {
                test_type: request.test_type,
                load: request.load,
                outcome: TestOutcome::Successful,
                elapsed_ms: 80,
            })
            .unwrap();

        step();
        // Retired, not re-dispatched.
        assert_eq!(events::TEST_CONTROL.get() & events::all_test_bits(), 0);
        assert_eq!(
            status::slot_status(0).unwrap().scheduler,
            SchedulerStatus::Done
        );
        reset();
    }

    #[test]
    fn kind_without_a_run_loop_is_skipped() {
        let _guard = crate::testutil::global_lock();
        reset();
        let request = RequiredTest {
            test_type: TestType::Waveform,
            load: LoadLevel::L100,
        };
        SCHEDULER.submit(request).unwrap();
        step();

        assert_eq!(events::TEST_CONTROL.get() & events::all_test_bits(), 0);
        assert_ne!(events::SYNC_CONTROL.get() & sync_flag::SKIP_TEST, 0);
        assert!(!SCHEDULER.has_active_tests());
        reset();
    }
}
