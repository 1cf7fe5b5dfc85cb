//! Test lifecycle engine.
//!
//! [`TestCycle`] is a synchronous phase machine: the owning task calls
//! [`advance`](TestCycle::advance) on its poll quantum with the current
//! millisecond clock, a snapshot of the capture cell and its I/O driver.
//! The engine performs load/power actions through the [`TestIo`] seam and
//! hands lifecycle notices back as values; mapping notices onto the event
//! bus and the state machine is the caller's business. Keeping the engine
//! free of executor types is what lets the emulator and the unit tests
//! drive it with a plain counter for a clock.
//!
//! Phases run strictly forward:
//! Setup -> Ongoing -> Restore -> CaptureCheck -> Terminal.
//! Each report fires at most once per run; the latches only reset when a
//! new cycle is constructed.

use heapless::{HistoryBuf, Vec};

use crate::load::LoadPlan;
use crate::settings::ToleranceWindow;
use crate::types::LoadLevel;

/// Most notices a single `advance` call can produce
/// (`TestTimeEnd` never coincides with the capture-check trio).
pub const MAX_NOTICES: usize = 4;

/// Hardware actions the engine needs during a run.
pub trait TestIo {
    fn apply_load(&mut self, plan: LoadPlan);
    fn cut_power(&mut self);
    fn restore_power(&mut self);
    /// Short pulse telling the bench recorder the run is over.
    fn pulse_end_signal(&mut self);
}

/// Driver that discards every action; useful for dry runs and tests.
#[derive(Default)]
pub struct NoopTestIo;

impl TestIo for NoopTestIo {
    fn apply_load(&mut self, _plan: LoadPlan) {}
    fn cut_power(&mut self) {}
    fn restore_power(&mut self) {}
    fn pulse_end_signal(&mut self) {}
}

/// Boolean latch that reports the first firing only.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OneShot {
    fired: bool,
}

impl OneShot {
    pub const fn new() -> Self {
        Self { fired: false }
    }

    /// Returns `true` exactly once until [`reset`](Self::reset).
    pub fn fire(&mut self) -> bool {
        !core::mem::replace(&mut self.fired, true)
    }

    pub fn reset(&mut self) {
        self.fired = false;
    }

    pub const fn has_fired(self) -> bool {
        self.fired
    }
}

/// Snapshot of the interrupt-driven capture cell, read once per poll.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CaptureWindow {
    /// Millisecond stamp of the opening edge; zero means never stamped.
    pub start_ms: u64,
    /// Millisecond stamp of the closing edge; zero means never stamped.
    pub end_ms: u64,
    /// Set by the capture worker once both edges landed.
    pub capture_ok: bool,
}

impl CaptureWindow {
    /// The measured interval, if both stamps are present and ordered.
    pub fn elapsed_ms(&self) -> Option<u32> {
        if self.start_ms == 0 || self.end_ms == 0 || self.end_ms < self.start_ms {
            return None;
        }
        Some((self.end_ms - self.start_ms) as u32)
    }
}

/// Lifecycle notices surfaced to the caller, mirroring the rig's
/// event-bus vocabulary.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleNotice {
    TestOngoing,
    TestTimeEnd,
    DataCaptured,
    ValidData,
    TestFailed,
}

/// Where a run ended up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TestOutcome {
    Successful,
    Failed,
}

/// Phases of a run, strictly forward.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Setup,
    Ongoing,
    Restore,
    CaptureCheck,
    Terminal,
}

/// Stamped result of one completed run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TestRecord {
    pub test_no: u8,
    pub timestamp_ms: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub elapsed_ms: u32,
    pub load_percent: u8,
    pub valid: bool,
}

/// Rolling bank of the most recent run records.
pub struct RecordBank {
    entries: HistoryBuf<TestRecord, 5>,
}

impl RecordBank {
    pub const fn new() -> Self {
        Self {
            entries: HistoryBuf::new(),
        }
    }

    pub fn record(&mut self, record: TestRecord) {
        self.entries.write(record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in chronological order.
    pub fn oldest_first(&self) -> impl Iterator<Item = &TestRecord> {
        self.entries.oldest_ordered()
    }

    /// The most recently stamped record, if any.
    pub fn latest(&self) -> Option<&TestRecord> {
        self.entries.recent()
    }
}

impl Default for RecordBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters fixed for the duration of one run.
#[derive(Copy, Clone, Debug)]
pub struct CycleConfig {
    pub test_no: u8,
    pub load: LoadLevel,
    pub plan: LoadPlan,
    pub duration_ms: u32,
    pub tolerance: ToleranceWindow,
}

/// One run of one test, from load application to verdict.
pub struct TestCycle {
    config: CycleConfig,
    phase: Phase,
    started_at_ms: u64,
    ongoing_notice: OneShot,
    power_cut: OneShot,
    time_end_notice: OneShot,
    captured_notice: OneShot,
    verdict_notice: OneShot,
    outcome: Option<TestOutcome>,
    record: Option<TestRecord>,
}

impl TestCycle {
    pub fn new(config: CycleConfig) -> Self {
        Self {
            config,
            phase: Phase::Setup,
            started_at_ms: 0,
            ongoing_notice: OneShot::new(),
            power_cut: OneShot::new(),
            time_end_notice: OneShot::new(),
            captured_notice: OneShot::new(),
            verdict_notice: OneShot::new(),
            outcome: None,
            record: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn outcome(&self) -> Option<TestOutcome> {
        self.outcome
    }

    /// The record stamped at a successful or failed capture check.
    pub fn record(&self) -> Option<&TestRecord> {
        self.record.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Terminal
    }

    /// Drives the run one poll forward.
    ///
    /// `capture` is the caller's snapshot of the capture cell; it is only
    /// consulted during the capture check, after power has been restored.
    pub fn advance(
        &mut self,
        now_ms: u64,
        capture: &CaptureWindow,
        io: &mut impl TestIo,
    ) -> Vec<CycleNotice, MAX_NOTICES> {
        let mut notices = Vec::new();
        match self.phase {
            Phase::Setup => {
                io.apply_load(self.config.plan);
                self.started_at_ms = now_ms;
                self.phase = Phase::Ongoing;
            }
            Phase::Ongoing => {
                if self.ongoing_notice.fire() {
                    let _ = notices.push(CycleNotice::TestOngoing);
                }
                let elapsed = now_ms.saturating_sub(self.started_at_ms);
                // The fault lands halfway through the run, once the load
                // has been carried for a while.
                if elapsed >= u64::from(self.config.duration_ms / 2) && self.power_cut.fire() {
                    io.cut_power();
                }
                if elapsed >= u64::from(self.config.duration_ms) {
                    self.phase = Phase::Restore;
                }
            }
            Phase::Restore => {
                io.restore_power();
                if self.time_end_notice.fire() {
                    let _ = notices.push(CycleNotice::TestTimeEnd);
                }
                self.phase = Phase::CaptureCheck;
            }
            Phase::CaptureCheck => {
                self.check_capture(capture, io, now_ms, &mut notices);
                self.phase = Phase::Terminal;
            }
            Phase::Terminal => {}
        }
        notices
    }

    fn check_capture(
        &mut self,
        capture: &CaptureWindow,
        io: &mut impl TestIo,
        now_ms: u64,
        notices: &mut Vec<CycleNotice, MAX_NOTICES>,
    ) {
        if !capture.capture_ok {
            self.fail(notices);
            return;
        }
        if self.captured_notice.fire() {
            let _ = notices.push(CycleNotice::DataCaptured);
        }
        match capture.elapsed_ms() {
            Some(elapsed) if self.config.tolerance.contains(elapsed) => {
                self.record = Some(TestRecord {
                    test_no: self.config.test_no,
                    timestamp_ms: now_ms,
                    start_ms: capture.start_ms,
                    end_ms: capture.end_ms,
                    elapsed_ms: elapsed,
                    load_percent: self.config.load.percent(),
                    valid: true,
                });
                if self.verdict_notice.fire() {
                    let _ = notices.push(CycleNotice::ValidData);
                }
                io.pulse_end_signal();
                self.outcome = Some(TestOutcome::Successful);
            }
            _ => self.fail(notices),
        }
    }

    fn fail(&mut self, notices: &mut Vec<CycleNotice, MAX_NOTICES>) {
        if self.verdict_notice.fire() {
            let _ = notices.push(CycleNotice::TestFailed);
        }
        self.outcome = Some(TestOutcome::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingIo {
        loads: u8,
        cuts: u8,
        restores: u8,
        pulses: u8,
        last_plan: Option<LoadPlan>,
    }

    impl TestIo for RecordingIo {
        fn apply_load(&mut self, plan: LoadPlan) {
            self.loads += 1;
            self.last_plan = Some(plan);
        }
        fn cut_power(&mut self) {
            self.cuts += 1;
        }
        fn restore_power(&mut self) {
            self.restores += 1;
        }
        fn pulse_end_signal(&mut self) {
            self.pulses += 1;
        }
    }

    fn config(duration_ms: u32) -> CycleConfig {
        CycleConfig {
            test_no: 1,
            load: LoadLevel::L50,
            plan: LoadPlan {
                banks: 2,
                pwm_value: 200,
            },
            duration_ms,
            tolerance: ToleranceWindow {
                min_ms: 10,
                max_ms: 500,
            },
        }
    }

    fn capture(start_ms: u64, end_ms: u64, capture_ok: bool) -> CaptureWindow {
        CaptureWindow {
            start_ms,
            end_ms,
            capture_ok,
        }
    }

    /// Drives the cycle at a fixed quantum until terminal, feeding the
    /// capture window from `poll_capture`.
    fn run_to_terminal(
        cycle: &mut TestCycle,
        io: &mut RecordingIo,
        window: CaptureWindow,
    ) -> Vec<CycleNotice, 16> {
        let mut all = Vec::new();
        let mut now = 0;
        while !cycle.is_terminal() {
            for notice in cycle.advance(now, &window, io) {
                all.push(notice).unwrap();
            }
            now += 100;
            assert!(now < 10_000, "cycle failed to terminate");
        }
        all
    }

    #[test]
    fn successful_run_emits_each_notice_once_in_order() {
        let mut cycle = TestCycle::new(config(300));
        let mut io = RecordingIo::default();
        let notices = run_to_terminal(&mut cycle, &mut io, capture(1000, 1120, true));
        assert_eq!(
            notices.as_slice(),
            &[
                CycleNotice::TestOngoing,
                CycleNotice::TestTimeEnd,
                CycleNotice::DataCaptured,
                CycleNotice::ValidData,
            ]
        );
        assert_eq!(cycle.outcome(), Some(TestOutcome::Successful));
        assert_eq!(io.loads, 1);
        assert_eq!(io.cuts, 1);
        assert_eq!(io.pulses, 1);
        assert!(io.restores >= 1);
    }

    #[test]
    fn successful_run_stamps_a_valid_record() {
        let mut cycle = TestCycle::new(config(200));
        let mut io = RecordingIo::default();
        run_to_terminal(&mut cycle, &mut io, capture(1000, 1050, true));
        let record = cycle.record().unwrap();
        assert_eq!(record.elapsed_ms, 50);
        assert_eq!(record.start_ms, 1000);
        assert_eq!(record.end_ms, 1050);
        assert_eq!(record.load_percent, 50);
        assert!(record.valid);
    }

    #[test]
    fn power_cut_is_injected_exactly_once() {
        let mut cycle = TestCycle::new(config(1000));
        let mut io = RecordingIo::default();
        let window = capture(0, 0, false);
        for now in (0..1200).step_by(100) {
            cycle.advance(now, &window, &mut io);
        }
        assert_eq!(io.cuts, 1);
    }

    #[test]
    fn power_cut_waits_for_half_the_duration() {
        let mut cycle = TestCycle::new(config(1000));
        let mut io = RecordingIo::default();
        let window = capture(0, 0, false);
        for now in (0..500).step_by(100) {
            cycle.advance(now, &window, &mut io);
        }
        assert_eq!(io.cuts, 0);
        cycle.advance(500, &window, &mut io);
        assert_eq!(io.cuts, 1);
    }

    #[test]
    fn missing_capture_fails_without_data_captured_notice() {
        let mut cycle = TestCycle::new(config(100));
        let mut io = RecordingIo::default();
        let notices = run_to_terminal(&mut cycle, &mut io, capture(0, 0, false));
        assert!(notices.contains(&CycleNotice::TestFailed));
        assert!(!notices.contains(&CycleNotice::DataCaptured));
        assert!(!notices.contains(&CycleNotice::ValidData));
        assert_eq!(cycle.outcome(), Some(TestOutcome::Failed));
        assert_eq!(io.pulses, 0);
    }

    #[test]
    fn out_of_tolerance_interval_fails_after_data_captured() {
        let mut cycle = TestCycle::new(config(100));
        let mut io = RecordingIo::default();
        // 600 ms measured against a 10..=500 window.
        let notices = run_to_terminal(&mut cycle, &mut io, capture(1000, 1600, true));
        assert!(notices.contains(&CycleNotice::DataCaptured));
        assert!(notices.contains(&CycleNotice::TestFailed));
        assert_eq!(cycle.outcome(), Some(TestOutcome::Failed));
    }

    #[test]
    fn tolerance_bounds_are_inclusive() {
        for (elapsed, expect) in [
            (10u64, TestOutcome::Successful),
            (500, TestOutcome::Successful),
            (9, TestOutcome::Failed),
            (501, TestOutcome::Failed),
        ] {
            let mut cycle = TestCycle::new(config(100));
            let mut io = RecordingIo::default();
            run_to_terminal(&mut cycle, &mut io, capture(1000, 1000 + elapsed, true));
            assert_eq!(cycle.outcome(), Some(expect), "elapsed {elapsed}");
        }
    }

    #[test]
    fn capture_with_missing_stamp_fails_validation() {
        // capture_ok claimed but the start stamp never landed.
        let mut cycle = TestCycle::new(config(100));
        let mut io = RecordingIo::default();
        let notices = run_to_terminal(&mut cycle, &mut io, capture(0, 1600, true));
        assert!(notices.contains(&CycleNotice::DataCaptured));
        assert!(notices.contains(&CycleNotice::TestFailed));
        assert_eq!(cycle.outcome(), Some(TestOutcome::Failed));
    }

    #[test]
    fn zero_duration_run_still_restores_power() {
        let mut cycle = TestCycle::new(config(0));
        let mut io = RecordingIo::default();
        let notices = run_to_terminal(&mut cycle, &mut io, capture(1000, 1100, true));
        assert!(notices.contains(&CycleNotice::TestTimeEnd));
        assert!(io.restores >= 1);
        assert_eq!(cycle.outcome(), Some(TestOutcome::Successful));
    }

    #[test]
    fn terminal_cycle_ignores_further_polls() {
        let mut cycle = TestCycle::new(config(100));
        let mut io = RecordingIo::default();
        let window = capture(1000, 1050, true);
        run_to_terminal(&mut cycle, &mut io, window);
        let (cuts, pulses) = (io.cuts, io.pulses);
        for now in 5000..5005 {
            assert!(cycle.advance(now, &window, &mut io).is_empty());
        }
        assert_eq!(io.cuts, cuts);
        assert_eq!(io.pulses, pulses);
    }

    #[test]
    fn one_shot_fires_once_until_reset() {
        let mut latch = OneShot::new();
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(!latch.fire());
        latch.reset();
        assert!(latch.fire());
        assert!(!latch.fire());
    }

    #[test]
    fn capture_window_elapsed_requires_ordered_stamps() {
        assert_eq!(capture(0, 100, true).elapsed_ms(), None);
        assert_eq!(capture(100, 0, true).elapsed_ms(), None);
        assert_eq!(capture(200, 100, true).elapsed_ms(), None);
        assert_eq!(capture(100, 250, true).elapsed_ms(), Some(150));
    }

    #[test]
    fn record_bank_keeps_the_most_recent_five() {
        let mut bank = RecordBank::new();
        for test_no in 1..=7u8 {
            bank.record(TestRecord {
                test_no,
                timestamp_ms: u64::from(test_no) * 100,
                start_ms: 0,
                end_ms: 0,
                elapsed_ms: 0,
                load_percent: 50,
                valid: true,
            });
        }
        assert_eq!(bank.len(), 5);
        let ordered: Vec<u8, 8> = bank.oldest_first().map(|record| record.test_no).collect();
        assert_eq!(ordered.as_slice(), &[3, 4, 5, 6, 7]);
        assert_eq!(bank.latest().unwrap().test_no, 7);
    }
}
