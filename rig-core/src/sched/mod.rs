//! Active-test table.
//!
//! Fixed-capacity bookkeeping for the tests an operator has queued. One
//! worker owns the table and is the only writer; everyone else observes
//! progress through the packed status word. Slots are allocated first-free
//! and keep their 1-based `test_id` for the life of the entry, so a test's
//! identity is stable across status updates and retests.

use crate::status::SLOT_COUNT;
use crate::types::{LoadLevel, TestType};

/// Maximum number of simultaneously tracked tests. Matches the status-word
/// slot count so every entry has a place to publish progress.
pub const MAX_TEST: usize = SLOT_COUNT;

/// A test as requested by the operator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RequiredTest {
    pub test_type: TestType,
    pub load: LoadLevel,
}

/// A table entry: the request plus its stable identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ActiveTest {
    pub test_id: u8,
    pub request: RequiredTest,
    pub is_active: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotError {
    /// An active entry with the same type and load already exists.
    Duplicate,
    /// All slots are occupied by active entries.
    TableFull,
}

/// The scheduler's test list.
pub struct ActiveTestTable {
    slots: [Option<ActiveTest>; MAX_TEST],
}

impl ActiveTestTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_TEST],
        }
    }

    /// Inserts a request into the first free slot and returns that slot's
    /// index. The entry's `test_id` is the slot index plus one.
    pub fn insert(&mut self, request: RequiredTest) -> Result<usize, SlotError> {
        if self.find(request.test_type, request.load).is_some() {
            return Err(SlotError::Duplicate);
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ActiveTest {
                    test_id: index as u8 + 1,
                    request,
                    is_active: true,
                });
                return Ok(index);
            }
        }
        Err(SlotError::TableFull)
    }

    /// Marks the entry in `slot` inactive. Inactive entries keep their
    /// identity until the next [`sweep`](Self::sweep).
    pub fn deactivate(&mut self, slot: usize) -> bool {
        match self.slots.get_mut(slot) {
            Some(Some(entry)) if entry.is_active => {
                entry.is_active = false;
                true
            }
            _ => false,
        }
    }

    /// Frees every inactive slot and reports how many were removed.
    pub fn sweep(&mut self) -> usize {
        let mut removed = 0;
        for slot in &mut self.slots {
            if matches!(slot, Some(entry) if !entry.is_active) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Finds the slot of the active entry matching `(test_type, load)`.
    pub fn find(&self, test_type: TestType, load: LoadLevel) -> Option<usize> {
        self.slots.iter().position(|slot| {
            matches!(slot, Some(entry)
                if entry.is_active
                    && entry.request.test_type == test_type
                    && entry.request.load == load)
        })
    }

    pub fn get(&self, slot: usize) -> Option<&ActiveTest> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Some(entry) if entry.is_active))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates `(slot, entry)` over active entries in slot order.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &ActiveTest)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (index, entry)))
            .filter(|(_, entry)| entry.is_active)
    }
}

impl Default for ActiveTestTable {
    fn default() -> Self {
        Self::new()
    }
}
