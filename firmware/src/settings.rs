//! Settings registry.
//!
//! One cell per settings group, guarded by a blocking mutex so updates
//! from the command worker and reads from the run loops never observe a
//! half-written struct. Every successful update bumps a generation
//! counter; long-running loops compare generations to decide whether to
//! re-read their working copy.

use core::cell::RefCell;

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use portable_atomic::{AtomicU32, Ordering};

use rig_core::settings::{HardwareSetup, SettingsError, SpecSetup, TestSetup, TuningSetup};

// The cells are statics; the host alias must be `Sync`.
#[cfg(target_os = "none")]
type SettingsMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type SettingsMutex = CriticalSectionRawMutex;

struct Cell<T: 'static> {
    value: Mutex<SettingsMutex, RefCell<T>>,
    generation: AtomicU32,
}

impl<T: Copy> Cell<T> {
    const fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(RefCell::new(initial)),
            generation: AtomicU32::new(0),
        }
    }

    fn get(&self) -> T {
        self.value.lock(|cell| *cell.borrow())
    }

    fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    fn update<E>(&self, apply: impl FnOnce(&mut T) -> Result<(), E>) -> Result<(), E> {
        self.value.lock(|cell| apply(&mut cell.borrow_mut()))?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

static SPEC: Cell<SpecSetup> = Cell::new(SpecSetup::new());
static TEST: Cell<TestSetup> = Cell::new(TestSetup::new());
static HARDWARE: Cell<HardwareSetup> = Cell::new(HardwareSetup::new());
static TUNING: Cell<TuningSetup> = Cell::new(TuningSetup::new());

pub fn spec() -> SpecSetup {
    SPEC.get()
}

pub fn test() -> TestSetup {
    TEST.get()
}

pub fn hardware() -> HardwareSetup {
    HARDWARE.get()
}

pub fn tuning() -> TuningSetup {
    TUNING.get()
}

pub fn update_spec(
    apply: impl FnOnce(&mut SpecSetup) -> Result<(), SettingsError>,
) -> Result<(), SettingsError> {
    SPEC.update(apply)
}

pub fn update_test(
    apply: impl FnOnce(&mut TestSetup) -> Result<(), SettingsError>,
) -> Result<(), SettingsError> {
    TEST.update(apply)
}

pub fn update_tuning(apply: impl FnOnce(&mut TuningSetup)) {
    let _ = TUNING.update(|tuning| {
        apply(tuning);
        Ok::<(), SettingsError>(())
    });
}

/// Combined generation of every group. A loop that caches settings
/// re-reads when this number moves.
pub fn generation() -> u32 {
    SPEC.generation()
        .wrapping_add(TEST.generation())
        .wrapping_add(HARDWARE.generation())
        .wrapping_add(TUNING.generation())
}
