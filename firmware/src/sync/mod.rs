//! Test scheduler.
//!
//! Submissions from any context funnel through a claim mask and a bounded
//! queue; one drain worker is the only writer to the active-test table, so
//! the table itself never needs to be shared mutably. Results come back
//! from the run loops over per-tester channels and are folded into the
//! packed status word here.
//!
//! A (type, load) combination holds its claim bit from submission until
//! the verdict is final, so a duplicate submitted while the first is
//! queued or running is rejected without touching the table.

pub mod observer;

use core::cell::RefCell;

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use portable_atomic::{AtomicU8, AtomicU32, Ordering};

use rig_core::lifecycle::TestOutcome;
use rig_core::sched::{ActiveTestTable, MAX_TEST, RequiredTest, SlotError};
use rig_core::status::{SchedulerStatus, SlotStatus, TesterStatus};
use rig_core::types::{LoadLevel, TestMode, TestType};

use crate::events::{self, phase, sync_flag};
use crate::log::{log_error, log_info, log_warn};
use crate::status;

// The channels and the scheduler live in statics, so the host alias must
// be `Sync`; the test harness hits them from multiple threads.
#[cfg(target_os = "none")]
type SchedMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type SchedMutex = CriticalSectionRawMutex;

/// Depth of the submission queue. Submissions burst when an operator
/// loads a stored campaign; the drain worker empties it every pass.
const SUBMIT_DEPTH: usize = 4;
/// Depth of each verdict channel. A run loop produces at most one
/// verdict per cycle and the observer consumes between cycles.
const VERDICT_DEPTH: usize = 2;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// The combination is already queued or running.
    Duplicate,
    /// The submission queue is full.
    QueueFull,
}

/// Outcome of one completed cycle, as reported by a run loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TestVerdict {
    pub test_type: TestType,
    pub load: LoadLevel,
    pub outcome: TestOutcome,
    pub elapsed_ms: u32,
}

pub type VerdictChannel = Channel<SchedMutex, TestVerdict, VERDICT_DEPTH>;

pub static SWITCH_VERDICTS: VerdictChannel = Channel::new();
pub static BACKUP_VERDICTS: VerdictChannel = Channel::new();

pub static SCHEDULER: TestScheduler = TestScheduler::new();

pub struct TestScheduler {
    queue: Channel<SchedMutex, RequiredTest, SUBMIT_DEPTH>,
    /// One bit per (type, load) combination with a submission in flight.
    claimed: AtomicU32,
    table: Mutex<SchedMutex, RefCell<ActiveTestTable>>,
    attempts: [AtomicU8; MAX_TEST],
}

const fn claim_bit(request: RequiredTest) -> u32 {
    1 << (request.test_type.index() * LoadLevel::COUNT + request.load.index())
}

impl TestScheduler {
    pub const fn new() -> Self {
        Self {
            queue: Channel::new(),
            claimed: AtomicU32::new(0),
            table: Mutex::new(RefCell::new(ActiveTestTable::new())),
            attempts: [const { AtomicU8::new(0) }; MAX_TEST],
        }
    }

    /// Queues a test for the drain worker. Callable from any context.
    pub fn submit(&self, request: RequiredTest) -> Result<(), SubmitError> {
        let bit = claim_bit(request);
        if self.claimed.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Err(SubmitError::Duplicate);
        }
        if self.queue.try_send(request).is_err() {
            // Give the claim back or the combination is lost until reboot.
            self.claimed.fetch_and(!bit, Ordering::AcqRel);
            return Err(SubmitError::QueueFull);
        }
        Ok(())
    }

    /// Moves queued submissions into the table. Returns how many slots
    /// were filled. Only the drain worker calls this.
    pub fn drain(&self) -> usize {
        let mut inserted = 0;
        while let Ok(request) = self.queue.try_receive() {
            match self.table.lock(|table| table.borrow_mut().insert(request)) {
                Ok(slot) => {
                    self.attempts[slot].store(0, Ordering::Release);
                    status::publish_slot(
                        slot,
                        SlotStatus {
                            test_type: request.test_type,
                            load: request.load,
                            scheduler: SchedulerStatus::Pending,
                            tester: TesterStatus::NotStarted,
                        },
                    );
                    inserted += 1;
                }
                Err(SlotError::Duplicate) => {
                    // The claim mask should have caught this; the queue
                    // entry is stale. Drop it and release the claim.
                    self.release_claim(request);
                    log_warn("drain: stale duplicate dropped");
                }
                Err(SlotError::TableFull) => {
                    self.release_claim(request);
                    log_error("drain: table full, submission dropped");
                }
            }
        }
        if inserted > 0 {
            events::TEST_PHASE.set_bits(phase::PENDING_TEST_FOUND);
        }
        inserted
    }

    fn release_claim(&self, request: RequiredTest) {
        self.claimed.fetch_and(!claim_bit(request), Ordering::AcqRel);
    }

    /// Removes the active entry matching `request`, if any. Used for
    /// operator deletions; a running test is stopped first.
    pub fn delete(&self, request: RequiredTest) -> bool {
        let removed = self.table.lock(|table| {
            let mut table = table.borrow_mut();
            match table.find(request.test_type, request.load) {
                Some(slot) => {
                    table.deactivate(slot);
                    table.sweep();
                    status::release_slot(slot);
                    true
                }
                None => false,
            }
        });
        if removed {
            events::TEST_CONTROL.clear_bits(request.test_type.mask_bit());
            self.release_claim(request);
        }
        removed
    }

    /// Folds a verdict into the table and status word. Returns whether
    /// the test will run again.
    pub fn on_verdict(&self, verdict: TestVerdict, max_retest: u8) -> bool {
        let request = RequiredTest {
            test_type: verdict.test_type,
            load: verdict.load,
        };
        let Some(slot) = self
            .table
            .lock(|table| table.borrow().find(verdict.test_type, verdict.load))
        else {
            log_warn("verdict for unknown test dropped");
            return false;
        };

        events::TEST_CONTROL.clear_bits(verdict.test_type.mask_bit());

        match verdict.outcome {
            TestOutcome::Successful => {
                status::publish_tester_status(slot, TesterStatus::Success);
                status::publish_scheduler_status(slot, SchedulerStatus::Done);
                self.retire(slot, request);
                events::raise_sync_flag(sync_flag::SAVE);
                false
            }
            TestOutcome::Failed => {
                status::publish_tester_status(slot, TesterStatus::Failed);
                let attempts = self.attempts[slot].fetch_add(1, Ordering::AcqRel) + 1;
                if attempts <= max_retest {
                    status::publish_scheduler_status(slot, SchedulerStatus::Retest);
                    // Back to pending so the next scan picks it up again.
                    status::publish_scheduler_status(slot, SchedulerStatus::Pending);
                    events::raise_sync_flag(sync_flag::RE_TEST);
                    events::TEST_PHASE.set_bits(phase::RETEST);
                    log_info("test failed, retest scheduled");
                    true
                } else {
                    status::publish_scheduler_status(slot, SchedulerStatus::Done);
                    self.retire(slot, request);
                    log_error("test failed, retest budget exhausted");
                    false
                }
            }
        }
    }

    fn retire(&self, slot: usize, request: RequiredTest) {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            table.deactivate(slot);
            table.sweep();
        });
        self.release_claim(request);
        if !self.has_active_tests() {
            events::TEST_PHASE.set_bits(phase::TEST_LIST_EMPTY);
        }
    }

    pub fn has_active_tests(&self) -> bool {
        self.table.lock(|table| !table.borrow().is_empty())
    }

    /// The slot and request of the active entry for `test_type`, if one
    /// exists. Run loops use this to learn their load level.
    pub fn active_slot(&self, test_type: TestType) -> Option<(usize, RequiredTest)> {
        self.table.lock(|table| {
            table
                .borrow()
                .iter_active()
                .find(|(_, entry)| entry.request.test_type == test_type)
                .map(|(slot, entry)| (slot, entry.request))
        })
    }

    /// The first active entry in slot order, the one a manual START runs.
    pub fn first_active(&self) -> Option<(usize, RequiredTest)> {
        self.table.lock(|table| {
            table
                .borrow()
                .iter_active()
                .map(|(slot, entry)| (slot, entry.request))
                .next()
        })
    }

    fn slot_matches(&self, test_type: TestType, slot: usize) -> bool {
        self.table.lock(|table| {
            table
                .borrow()
                .get(slot)
                .is_some_and(|entry| entry.is_active && entry.request.test_type == test_type)
        })
    }

    /// Raises the control bit for the test in `slot`, after checking that
    /// the slot really holds an active entry of `test_type`. A stale or
    /// mismatched index logs and changes nothing.
    pub fn request_start(&self, test_type: TestType, slot: usize) -> bool {
        if !self.slot_matches(test_type, slot) {
            log_error("start request does not match its slot");
            return false;
        }
        events::TEST_CONTROL.set_bits(test_type.mask_bit());
        true
    }

    /// Lowers the control bit for the test in `slot`, with the same slot
    /// check as [`request_start`](Self::request_start).
    pub fn request_stop(&self, test_type: TestType, slot: usize) -> bool {
        if !self.slot_matches(test_type, slot) {
            log_error("stop request does not match its slot");
            return false;
        }
        events::TEST_CONTROL.clear_bits(test_type.mask_bit());
        true
    }

    #[cfg(test)]
    fn clear(&self) {
        while self.queue.try_receive().is_ok() {}
        self.claimed.store(0, Ordering::Release);
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            for slot in 0..MAX_TEST {
                table.deactivate(slot);
            }
            table.sweep();
        });
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies one operator command bit. The caller consumed the bit from the
/// command channel already; acting and acknowledging are this function.
pub fn apply_user_command(bit: u32, scheduler: &TestScheduler) {
    use crate::events::command;

    match bit {
        command::AUTO => {
            status::publish_test_mode(TestMode::Auto);
            events::raise_sync_flag(sync_flag::START_OBSERVER);
        }
        command::MANUAL => {
            status::publish_test_mode(TestMode::Manual);
            events::raise_sync_flag(sync_flag::START_OBSERVER);
        }
        command::START => {
            events::raise_sync_flag(sync_flag::MANAGER_ACTIVE);
            if status::test_mode() == TestMode::Manual {
                if let Some((slot, request)) = scheduler.first_active() {
                    scheduler.request_start(request.test_type, slot);
                } else {
                    log_warn("start: no test queued");
                }
            }
        }
        command::STOP => {
            if status::test_mode() == TestMode::Manual {
                if let Some((slot, request)) = scheduler.first_active() {
                    scheduler.request_stop(request.test_type, slot);
                }
            } else {
                events::stop_all_tests();
                events::raise_sync_flag(sync_flag::MANAGER_WAIT);
            }
            events::raise_sync_flag(sync_flag::STOP_OBSERVER);
        }
        command::PAUSE => {
            events::stop_all_tests();
            events::raise_sync_flag(sync_flag::STOP_OBSERVER);
            events::raise_sync_flag(sync_flag::MANAGER_WAIT);
        }
        command::RESUME => {
            events::raise_sync_flag(sync_flag::START_OBSERVER);
            events::raise_sync_flag(sync_flag::MANAGER_ACTIVE);
        }
        _ => log_warn("unknown user command bit"),
    }
    events::USER_COMMAND.clear_bits(bit);
}
