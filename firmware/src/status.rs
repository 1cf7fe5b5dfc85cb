//! Shared status cells.
//!
//! Lock-free snapshot state published by the workers and read from
//! anywhere, including interrupt context. The packed test-status word
//! lives in a single [`AtomicU64`]; per-slot updates go through
//! read-modify-write loops so concurrent updates to different slots
//! never clobber each other.

use portable_atomic::{AtomicU8, AtomicU64, Ordering};

use rig_core::fsm::DeviceState;
use rig_core::status::{
    PendingTest, SchedulerStatus, SlotStatus, TesterStatus, clear_slot, decode_slot, encode_slot,
    next_pending_test, update_scheduler_status, update_tester_status,
};
use rig_core::types::TestMode;

static DEVICE_STATE: AtomicU8 = AtomicU8::new(DeviceState::DeviceOn as u8);
static TEST_MODE: AtomicU8 = AtomicU8::new(TestMode::Auto as u8);
static STATUS_WORD: AtomicU64 = AtomicU64::new(0);

pub fn publish_device_state(state: DeviceState) {
    DEVICE_STATE.store(state as u8, Ordering::Release);
}

pub fn device_state() -> DeviceState {
    DeviceState::from_u8(DEVICE_STATE.load(Ordering::Acquire)).unwrap_or(DeviceState::Fault)
}

pub fn publish_test_mode(mode: TestMode) {
    TEST_MODE.store(mode as u8, Ordering::Release);
}

pub fn test_mode() -> TestMode {
    if TEST_MODE.load(Ordering::Acquire) == TestMode::Manual as u8 {
        TestMode::Manual
    } else {
        TestMode::Auto
    }
}

/// Current packed status word.
pub fn status_word() -> u64 {
    STATUS_WORD.load(Ordering::Acquire)
}

pub fn slot_status(slot: usize) -> Option<SlotStatus> {
    decode_slot(status_word(), slot)
}

/// Lowest-index slot still waiting to run.
pub fn pending_test() -> Option<PendingTest> {
    next_pending_test(status_word())
}

fn rmw(update: impl Fn(u64) -> u64) {
    // fetch_update never fails here; the closure always returns Some.
    let _ = STATUS_WORD.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
        Some(update(word))
    });
}

pub fn publish_slot(slot: usize, status: SlotStatus) {
    rmw(|word| encode_slot(word, slot, status));
}

pub fn publish_scheduler_status(slot: usize, status: SchedulerStatus) {
    rmw(|word| update_scheduler_status(word, slot, status));
}

pub fn publish_tester_status(slot: usize, status: TesterStatus) {
    rmw(|word| update_tester_status(word, slot, status));
}

pub fn release_slot(slot: usize) {
    rmw(|word| clear_slot(word, slot));
}

pub fn reset_status_word() {
    STATUS_WORD.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::types::{LoadLevel, TestType};

    #[test]
    fn slot_updates_compose_on_the_shared_word() {
        let _guard = crate::testutil::global_lock();
        reset_status_word();
        publish_slot(
            2,
            SlotStatus {
                test_type: TestType::SwitchTime,
                load: LoadLevel::L50,
                scheduler: SchedulerStatus::Pending,
                tester: TesterStatus::NotStarted,
            },
        );
        publish_tester_status(2, TesterStatus::Running);
        publish_scheduler_status(2, SchedulerStatus::Done);

        let status = slot_status(2).unwrap();
        assert_eq!(status.tester, TesterStatus::Running);
        assert_eq!(status.scheduler, SchedulerStatus::Done);

        release_slot(2);
        assert_eq!(slot_status(2), None);
        reset_status_word();
    }

    #[test]
    fn device_state_round_trips_through_the_cell() {
        let _guard = crate::testutil::global_lock();
        publish_device_state(DeviceState::TestStart);
        assert_eq!(device_state(), DeviceState::TestStart);
        publish_device_state(DeviceState::DeviceOn);
    }

    #[test]
    fn mode_cell_defaults_to_auto() {
        let _guard = crate::testutil::global_lock();
        publish_test_mode(TestMode::Manual);
        assert_eq!(test_mode(), TestMode::Manual);
        publish_test_mode(TestMode::Auto);
        assert_eq!(test_mode(), TestMode::Auto);
    }
}
