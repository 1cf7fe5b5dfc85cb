//! Flash-backed state store.
//!
//! The device state must survive a power cycle, so the store keeps a RAM
//! shadow in atomics and mirrors every accepted write into the last flash
//! page as a single magic-tagged record. The flash peripheral is handed
//! over once at boot with [`FlashStore::attach`]; until then, or after a
//! failed handover, the store runs RAM-only and the machine simply boots
//! from `DeviceOn` on the next power cycle.

use core::cell::RefCell;

use embassy_stm32::flash::{Blocking, Flash};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use portable_atomic::{AtomicU32, Ordering};

use rig_core::store::{StateStore, StoreError, StoreKey};

use crate::log::{log_error, log_warn};

/// Last 2 KiB page of the 512 KiB part, offsets relative to flash base.
const STORE_OFFSET: u32 = 0x7F800;
const PAGE_SIZE: u32 = 2 * 1024;
/// Tag of a valid record; anything else reads as an empty store.
const MAGIC: u32 = 0x5550_5331;
/// magic + presence mask + one word per key, padded to the 8-byte write
/// granularity.
const RECORD_LEN: usize = 24;

pub struct FlashStore {
    flash: Mutex<ThreadModeRawMutex, RefCell<Option<Flash<'static, Blocking>>>>,
    values: [AtomicU32; StoreKey::COUNT],
    present: AtomicU32,
}

impl FlashStore {
    pub const fn new() -> Self {
        Self {
            flash: Mutex::new(RefCell::new(None)),
            values: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            present: AtomicU32::new(0),
        }
    }

    /// Takes ownership of the flash peripheral and loads the persisted
    /// record into the RAM shadow. A failed read logs and starts empty.
    pub fn attach(&self, mut flash: Flash<'static, Blocking>) {
        let mut record = [0u8; RECORD_LEN];
        match flash.blocking_read(STORE_OFFSET, &mut record) {
            Ok(()) if word_at(&record, 0) == MAGIC => {
                self.present.store(word_at(&record, 1), Ordering::Release);
                for (index, value) in self.values.iter().enumerate() {
                    value.store(word_at(&record, 2 + index), Ordering::Release);
                }
            }
            Ok(()) => {}
            Err(_) => log_warn("state store: flash read failed, starting empty"),
        }
        self.flash.lock(|cell| *cell.borrow_mut() = Some(flash));
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut record = [0u8; RECORD_LEN];
        put_word(&mut record, 0, MAGIC);
        put_word(&mut record, 1, self.present.load(Ordering::Acquire));
        for (index, value) in self.values.iter().enumerate() {
            put_word(&mut record, 2 + index, value.load(Ordering::Acquire));
        }
        self.flash.lock(|cell| {
            let mut flash = cell.borrow_mut();
            let Some(flash) = flash.as_mut() else {
                // RAM-only until the runtime attaches the peripheral.
                return Ok(());
            };
            flash
                .blocking_erase(STORE_OFFSET, STORE_OFFSET + PAGE_SIZE)
                .and_then(|()| flash.blocking_write(STORE_OFFSET, &record))
                .map_err(|_| StoreError::WriteFailed)
        })
    }
}

impl Default for FlashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for FlashStore {
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
        if let Err(error) = self.persist() {
            log_error("state store: flash write failed");
            return Err(error);
        }
        Ok(())
    }
}

fn word_at(record: &[u8; RECORD_LEN], index: usize) -> u32 {
    let offset = index * 4;
    u32::from_le_bytes([
        record[offset],
        record[offset + 1],
        record[offset + 2],
        record[offset + 3],
    ])
}

fn put_word(record: &mut [u8; RECORD_LEN], index: usize, value: u32) {
    record[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}
