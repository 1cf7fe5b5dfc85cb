//! Key-value persistence seam.
//!
//! The state machine records every transition through [`StateStore`] so a
//! power cycle can resume where the rig left off. On the MCU the backing
//! store is flash; [`MemoryStore`] serves host builds and doubles as the
//! RAM fallback when flash init fails.

use portable_atomic::{AtomicU32, Ordering};

/// Well-known keys. A closed set keeps the trait object-safe and spares the
/// `no_std` side string handling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreKey {
    DeviceState,
    TestMode,
    LastTestNumber,
}

impl StoreKey {
    pub const fn index(self) -> usize {
        match self {
            StoreKey::DeviceState => 0,
            StoreKey::TestMode => 1,
            StoreKey::LastTestNumber => 2,
        }
    }

    pub const COUNT: usize = 3;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    /// The backing medium rejected the write.
    WriteFailed,
}

/// Minimal persistent unsigned-integer store.
pub trait StateStore {
    /// Returns the stored value, or `None` if the key was never written.
    fn get_uint(&self, key: StoreKey) -> Option<u32>;

    fn put_uint(&self, key: StoreKey, value: u32) -> Result<(), StoreError>;
}

/// In-memory store. Values survive as long as the instance does; a
/// presence mask distinguishes "never written" from "written zero".
pub struct MemoryStore {
    values: [AtomicU32; StoreKey::COUNT],
    present: AtomicU32,
}

impl MemoryStore {
    pub const fn new() -> Self {
        Self {
            values: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            present: AtomicU32::new(0),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn get_uint(&self, key: StoreKey) -> Option<u32> {
        let bit = 1u32 << key.index();
        if self.present.load(Ordering::Acquire) & bit == 0 {
            return None;
        }
        Some(self.values[key.index()].load(Ordering::Acquire))
    }

    fn put_uint(&self, key: StoreKey, value: u32) -> Result<(), StoreError> {
        self.values[key.index()].store(value, Ordering::Release);
        self.present.fetch_or(1 << key.index(), Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_keys_read_as_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get_uint(StoreKey::DeviceState), None);
        assert_eq!(store.get_uint(StoreKey::LastTestNumber), None);
    }

    #[test]
    fn written_zero_is_distinct_from_missing() {
        let store = MemoryStore::new();
        store.put_uint(StoreKey::TestMode, 0).unwrap();
        assert_eq!(store.get_uint(StoreKey::TestMode), Some(0));
        assert_eq!(store.get_uint(StoreKey::DeviceState), None);
    }

    #[test]
    fn latest_write_wins() {
        let store = MemoryStore::new();
        store.put_uint(StoreKey::DeviceState, 7).unwrap();
        store.put_uint(StoreKey::DeviceState, 12).unwrap();
        assert_eq!(store.get_uint(StoreKey::DeviceState), Some(12));
    }
}
