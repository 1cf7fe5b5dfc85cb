//! Test run loops.
//!
//! One loop per executable test kind. A loop sleeps on its bit of the
//! test-control channel, runs a single lifecycle cycle when raised, ships
//! the verdict to the scheduler and lowers its own bit. Lowering the bit
//! mid-run from anywhere else aborts the cycle with power restored.

pub mod backup;
pub mod capture;
pub mod switch;

use embassy_time::{Duration, Instant, Timer};

use rig_core::lifecycle::{CycleConfig, CycleNotice, TestCycle, TestIo};
use rig_core::load::load_plan;
use rig_core::settings::ToleranceWindow;
use rig_core::status::TesterStatus;
use rig_core::types::TestType;

use crate::events::{self, phase};
use crate::log::{log_info, log_warn};
use crate::settings;
use crate::status;
use crate::sync::{SCHEDULER, TestVerdict, VerdictChannel};
use capture::CaptureCell;

/// Clock granularity of the run loops.
pub const POLL_QUANTUM: Duration = Duration::from_millis(100);

/// Attempts before a verdict that cannot be queued is dropped.
const VERDICT_SEND_RETRIES: u8 = 3;

/// The tester worker: one task owns the bench I/O and multiplexes the
/// executable test kinds over it. One test runs at a time; the observer
/// enforces that by never raising a second control bit.
pub async fn run_loop(io: &mut impl TestIo) -> ! {
    let mask = TestType::SwitchTime.mask_bit() | TestType::BackupTime.mask_bit();
    loop {
        let bits = events::TEST_CONTROL.wait_bits(mask, false, false, None).await;
        if bits & TestType::SwitchTime.mask_bit() != 0 {
            switch::service(io).await;
        } else if bits & TestType::BackupTime.mask_bit() != 0 {
            backup::service(io).await;
        }
    }
}

/// Queues a verdict with a bounded retry. The observer drains the channel
/// every pass, so a full channel is transient; past the retry budget the
/// verdict is dropped with a log rather than wedging the tester task with
/// its control bit still raised.
pub(crate) async fn offer_verdict(channel: &VerdictChannel, verdict: TestVerdict) {
    for _ in 0..VERDICT_SEND_RETRIES {
        if channel.try_send(verdict).is_ok() {
            return;
        }
        Timer::after(POLL_QUANTUM).await;
    }
    log_warn("verdict channel full, verdict dropped");
}

fn publish_notice(notice: CycleNotice) {
    let bit = match notice {
        CycleNotice::TestOngoing => phase::TEST_ONGOING,
        CycleNotice::TestTimeEnd => phase::TEST_TIME_END,
        CycleNotice::DataCaptured => phase::DATA_CAPTURED,
        CycleNotice::ValidData => phase::VALID_DATA,
        CycleNotice::TestFailed => phase::TEST_FAILED,
    };
    events::TEST_PHASE.set_bits(bit);
}

/// Runs one cycle of `test_type` to its verdict.
///
/// Returns `None` when there is no matching table entry or the control
/// bit was lowered mid-run; either way the hardware is left safe.
pub(crate) async fn run_one(
    test_type: TestType,
    tolerance: ToleranceWindow,
    cell: &CaptureCell,
    io: &mut impl TestIo,
) -> Option<TestVerdict> {
    let Some((slot, request)) = SCHEDULER.active_slot(test_type) else {
        log_warn("run requested with no matching table entry");
        events::TEST_CONTROL.clear_bits(test_type.mask_bit());
        return None;
    };

    let spec = settings::spec();
    let test = settings::test();
    let tuning = settings::tuning();
    let config = CycleConfig {
        test_no: slot as u8 + 1,
        load: request.load,
        plan: load_plan(
            request.load.apply_to(test.test_va_rating),
            &spec,
            &tuning,
        ),
        duration_ms: test.test_duration_ms,
        tolerance,
    };

    status::publish_tester_status(slot, TesterStatus::Running);
    cell.arm();
    let mut cycle = TestCycle::new(config);
    let bit = test_type.mask_bit();

    while !cycle.is_terminal() {
        if events::TEST_CONTROL.get() & bit == 0 {
            io.restore_power();
            cell.disarm();
            status::publish_tester_status(slot, TesterStatus::NotStarted);
            log_info("run stopped before the verdict");
            return None;
        }
        let now_ms = Instant::now().as_millis();
        let window = cell.snapshot();
        for notice in cycle.advance(now_ms, &window, io) {
            publish_notice(notice);
        }
        Timer::after(POLL_QUANTUM).await;
    }
    cell.disarm();

    let outcome = cycle.outcome()?;
    let elapsed_ms = cycle
        .record()
        .map(|record| record.elapsed_ms)
        .or_else(|| cell.snapshot().elapsed_ms())
        .unwrap_or(0);
    Some(TestVerdict {
        test_type,
        load: request.load,
        outcome,
        elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::SWITCH_CAPTURE;
    use embassy_futures::block_on;
    use rig_core::lifecycle::TestOutcome;
    use rig_core::load::LoadPlan;
    use rig_core::sched::RequiredTest;
    use rig_core::types::LoadLevel;

    /// Inverter that picks up 50 ms after mains drops.
    struct InstantUps {
        restores: u8,
    }

    impl TestIo for InstantUps {
        fn apply_load(&mut self, _plan: LoadPlan) {}
        fn cut_power(&mut self) {
            let now = Instant::now().as_millis();
            SWITCH_CAPTURE.stamp_start(now);
            SWITCH_CAPTURE.stamp_end(now.max(1) + 50);
        }
        fn restore_power(&mut self) {
            self.restores += 1;
        }
        fn pulse_end_signal(&mut self) {}
    }

    #[test]
    fn run_produces_a_passing_verdict_end_to_end() {
        let _guard = crate::testutil::global_lock();
        status::reset_status_word();
        events::TEST_CONTROL.reset();
        settings::update_test(|setup| setup.set_test_duration(200, 0)).unwrap();

        SCHEDULER
            .submit(RequiredTest {
                test_type: TestType::SwitchTime,
                load: LoadLevel::L50,
            })
            .unwrap();
        SCHEDULER.drain();
        events::TEST_CONTROL.set_bits(TestType::SwitchTime.mask_bit());

        let tolerance = settings::test().switch_window;
        let mut io = InstantUps { restores: 0 };
        let verdict = block_on(run_one(
            TestType::SwitchTime,
            tolerance,
            &SWITCH_CAPTURE,
            &mut io,
        ))
        .unwrap();

        assert_eq!(verdict.outcome, TestOutcome::Successful);
        assert_eq!(verdict.elapsed_ms, 50);
        assert_eq!(verdict.load, LoadLevel::L50);
        assert!(io.restores >= 1);

        SCHEDULER.on_verdict(verdict, settings::test().max_retest);
        events::TEST_CONTROL.reset();
        status::reset_status_word();
        settings::update_test(|setup| setup.set_test_duration(600_000, 0)).unwrap();
    }

    #[test]
    fn lowered_control_bit_aborts_with_power_restored() {
        let _guard = crate::testutil::global_lock();
        status::reset_status_word();
        events::TEST_CONTROL.reset();

        SCHEDULER
            .submit(RequiredTest {
                test_type: TestType::BackupTime,
                load: LoadLevel::L25,
            })
            .unwrap();
        SCHEDULER.drain();
        // Control bit never raised: the loop aborts on its first check.
        let tolerance = settings::test().backup_window;
        let mut io = InstantUps { restores: 0 };
        let verdict = block_on(run_one(
            TestType::BackupTime,
            tolerance,
            &capture::BACKUP_CAPTURE,
            &mut io,
        ));
        assert!(verdict.is_none());
        assert_eq!(io.restores, 1);
        assert!(!capture::BACKUP_CAPTURE.is_armed());

        SCHEDULER.delete(RequiredTest {
            test_type: TestType::BackupTime,
            load: LoadLevel::L25,
        });
        status::reset_status_word();
    }

    #[test]
    fn full_verdict_channel_drops_after_bounded_retries() {
        use crate::sync::BACKUP_VERDICTS;

        let _guard = crate::testutil::global_lock();
        let verdict = TestVerdict {
            test_type: TestType::BackupTime,
            load: LoadLevel::L50,
            outcome: TestOutcome::Failed,
            elapsed_ms: 0,
        };
        while BACKUP_VERDICTS.try_send(verdict).is_ok() {}

        // Nobody drains: the send gives up instead of parking forever.
        block_on(offer_verdict(&BACKUP_VERDICTS, verdict));

        let mut queued = 0;
        while BACKUP_VERDICTS.try_receive().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);
    }

    #[test]
    fn verdict_send_succeeds_once_the_observer_drains() {
        use crate::sync::BACKUP_VERDICTS;

        let _guard = crate::testutil::global_lock();
        while BACKUP_VERDICTS.try_receive().is_ok() {}
        let verdict = TestVerdict {
            test_type: TestType::BackupTime,
            load: LoadLevel::L25,
            outcome: TestOutcome::Successful,
            elapsed_ms: 90,
        };
        block_on(offer_verdict(&BACKUP_VERDICTS, verdict));
        assert_eq!(BACKUP_VERDICTS.try_receive(), Ok(verdict));
    }

    #[test]
    fn run_without_a_table_entry_clears_the_bit() {
        let _guard = crate::testutil::global_lock();
        events::TEST_CONTROL.set_bits(TestType::Waveform.mask_bit());
        let tolerance = settings::test().switch_window;
        let mut io = InstantUps { restores: 0 };
        let verdict = block_on(run_one(
            TestType::Waveform,
            tolerance,
            &SWITCH_CAPTURE,
            &mut io,
        ));
        assert!(verdict.is_none());
        assert_eq!(
            events::TEST_CONTROL.get() & TestType::Waveform.mask_bit(),
            0
        );
    }
}
