//! Bit-packed status word shared between the scheduler and the
//! presentation layer.
//!
//! One `u64` carries the progress of every scheduled test. Each slot packs
//! the test type, load level, scheduler status and tester status into
//! [`SLOT_WIDTH`] bits; a slot with a zero type code is empty. Readers take
//! the whole word in a single load, so a snapshot is always internally
//! consistent. Writers must serialize read-modify-write on the word (the
//! firmware funnels every update through one atomic cell).

use crate::types::{LoadLevel, TestType};

/// Number of addressable test slots.
pub const SLOT_COUNT: usize = 6;

/// Bits per slot: 3 type, 3 load, 2 scheduler, 2 tester.
pub const SLOT_WIDTH: usize = 10;

const TYPE_SHIFT: usize = 0;
const LOAD_SHIFT: usize = 3;
const SCHED_SHIFT: usize = 6;
const TESTER_SHIFT: usize = 8;

const TYPE_MASK: u64 = 0b111;
const LOAD_MASK: u64 = 0b111;
const STATUS_MASK: u64 = 0b11;
const SLOT_MASK: u64 = (1 << SLOT_WIDTH) - 1;

// The packed slots must fit the word.
const _: () = assert!(SLOT_COUNT * SLOT_WIDTH <= u64::BITS as usize);

/// Queueing state of a slot, owned by the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedulerStatus {
    NotQueued,
    Pending,
    Retest,
    Done,
}

impl SchedulerStatus {
    const fn bits(self) -> u64 {
        match self {
            SchedulerStatus::NotQueued => 0,
            SchedulerStatus::Pending => 1,
            SchedulerStatus::Retest => 2,
            SchedulerStatus::Done => 3,
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & STATUS_MASK {
            0 => SchedulerStatus::NotQueued,
            1 => SchedulerStatus::Pending,
            2 => SchedulerStatus::Retest,
            _ => SchedulerStatus::Done,
        }
    }
}

/// Execution state of a slot, owned by the test run loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TesterStatus {
    NotStarted,
    Running,
    Success,
    Failed,
}

impl TesterStatus {
    const fn bits(self) -> u64 {
        match self {
            TesterStatus::NotStarted => 0,
            TesterStatus::Running => 1,
            TesterStatus::Success => 2,
            TesterStatus::Failed => 3,
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & STATUS_MASK {
            0 => TesterStatus::NotStarted,
            1 => TesterStatus::Running,
            2 => TesterStatus::Success,
            _ => TesterStatus::Failed,
        }
    }
}

/// Decoded view of one occupied slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotStatus {
    pub test_type: TestType,
    pub load: LoadLevel,
    pub scheduler: SchedulerStatus,
    pub tester: TesterStatus,
}

/// A pending entry located by [`next_pending_test`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PendingTest {
    pub slot: usize,
    pub test_type: TestType,
    pub load: LoadLevel,
}

/// Writes a fully-specified slot, replacing whatever was there.
///
/// # Panics
///
/// Panics if `slot >= SLOT_COUNT`; slot indices come from the fixed-size
/// active-test table, so an out-of-range index is a programming error.
#[must_use]
pub fn encode_slot(word: u64, slot: usize, status: SlotStatus) -> u64 {
    assert!(slot < SLOT_COUNT);
    let shift = slot * SLOT_WIDTH;
    let packed = (u64::from(status.test_type.code()) << TYPE_SHIFT)
        | ((status.load.index() as u64) << LOAD_SHIFT)
        | (status.scheduler.bits() << SCHED_SHIFT)
        | (status.tester.bits() << TESTER_SHIFT);
    (word & !(SLOT_MASK << shift)) | (packed << shift)
}

/// Reads one slot back out. Returns `None` for an empty slot or a type
/// code the protocol does not define.
#[must_use]
pub fn decode_slot(word: u64, slot: usize) -> Option<SlotStatus> {
    assert!(slot < SLOT_COUNT);
    let raw = (word >> (slot * SLOT_WIDTH)) & SLOT_MASK;
    let test_type = TestType::from_code(((raw >> TYPE_SHIFT) & TYPE_MASK) as u8)?;
    let load = LoadLevel::from_index(((raw >> LOAD_SHIFT) & LOAD_MASK) as usize)?;
    Some(SlotStatus {
        test_type,
        load,
        scheduler: SchedulerStatus::from_bits(raw >> SCHED_SHIFT),
        tester: TesterStatus::from_bits(raw >> TESTER_SHIFT),
    })
}

/// Clears a slot back to empty.
#[must_use]
pub fn clear_slot(word: u64, slot: usize) -> u64 {
    assert!(slot < SLOT_COUNT);
    word & !(SLOT_MASK << (slot * SLOT_WIDTH))
}

/// Replaces only the scheduler field of an occupied slot; every other
/// field is re-encoded from the decoded value and therefore preserved.
///
/// Updating an empty slot is a no-op and returns the word unchanged.
#[must_use]
pub fn update_scheduler_status(word: u64, slot: usize, scheduler: SchedulerStatus) -> u64 {
    match decode_slot(word, slot) {
        Some(mut status) => {
            status.scheduler = scheduler;
            encode_slot(word, slot, status)
        }
        None => word,
    }
}

/// Replaces only the tester field of an occupied slot.
#[must_use]
pub fn update_tester_status(word: u64, slot: usize, tester: TesterStatus) -> u64 {
    match decode_slot(word, slot) {
        Some(mut status) => {
            status.tester = tester;
            encode_slot(word, slot, status)
        }
        None => word,
    }
}

/// Scans slots in index order for the first entry the scheduler marked
/// pending. `None` means nothing is waiting; there is no sentinel value.
#[must_use]
pub fn next_pending_test(word: u64) -> Option<PendingTest> {
    for slot in 0..SLOT_COUNT {
        if let Some(status) = decode_slot(word, slot)
            && status.scheduler == SchedulerStatus::Pending
        {
            return Some(PendingTest {
                slot,
                test_type: status.test_type,
                load: status.load,
            });
        }
    }
    None
}
