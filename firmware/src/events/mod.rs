//! Event channel bus.
//!
//! Named bitmask channels coordinate the rig's workers: one atomic word per
//! channel, OR to raise, AND-NOT to lower, with async level-triggered
//! waits. Bits are visible immediately on store; waiters observe them on
//! the next tick of a short poll interval. A bit set and cleared between
//! two calls is one atomic step per call, never a transaction across calls,
//! so consumers re-check the word after every wake.
//!
//! Timeouts are ordinary control flow: `wait_bits` returns the current
//! word either way and the caller inspects it.

use embassy_time::{Duration, Timer, with_timeout};
use portable_atomic::{AtomicU32, Ordering};

use rig_core::types::TestType;

/// Poll interval for level-triggered waits.
const WAIT_TICK: Duration = Duration::from_millis(10);

/// One bitmask channel.
pub struct EventGroup {
    bits: AtomicU32,
}

impl EventGroup {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Raises `mask`. The new bits are visible to every reader at once.
    pub fn set_bits(&self, mask: u32) {
        self.bits.fetch_or(mask, Ordering::AcqRel);
    }

    /// Lowers `mask` without waking anyone.
    pub fn clear_bits(&self, mask: u32) {
        self.bits.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Snapshot of the word.
    pub fn get(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Clears the whole channel.
    pub fn reset(&self) {
        self.bits.store(0, Ordering::Release);
    }

    /// Returns whether `mask` is satisfied under `wait_for_all`.
    fn satisfied(bits: u32, mask: u32, wait_for_all: bool) -> bool {
        if wait_for_all {
            bits & mask == mask
        } else {
            bits & mask != 0
        }
    }

    /// One atomic attempt to observe (and optionally consume) `mask`.
    /// Returns the word as it was when the condition held.
    fn try_take(&self, mask: u32, clear_on_exit: bool, wait_for_all: bool) -> Option<u32> {
        if clear_on_exit {
            // Check and clear must be one step or a concurrent setter's
            // bits could be lost between them.
            self.bits
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                    Self::satisfied(bits, mask, wait_for_all).then_some(bits & !mask)
                })
                .ok()
        } else {
            let bits = self.bits.load(Ordering::Acquire);
            Self::satisfied(bits, mask, wait_for_all).then_some(bits)
        }
    }

    /// Consumes and returns whichever bits of `mask` are currently up,
    /// or zero. The check and the clear are one atomic step.
    pub fn take(&self, mask: u32) -> u32 {
        self.try_take(mask, true, false).map_or(0, |bits| bits & mask)
    }

    async fn wait_inner(&self, mask: u32, clear_on_exit: bool, wait_for_all: bool) -> u32 {
        loop {
            if let Some(bits) = self.try_take(mask, clear_on_exit, wait_for_all) {
                return bits;
            }
            Timer::after(WAIT_TICK).await;
        }
    }

    /// Waits until `mask` is satisfied or `timeout` elapses.
    ///
    /// On satisfaction the returned word is the one that met the
    /// condition (before any `clear_on_exit`). On timeout the current
    /// word is returned unchanged; expiry is a normal outcome.
    pub async fn wait_bits(
        &self,
        mask: u32,
        clear_on_exit: bool,
        wait_for_all: bool,
        timeout: Option<Duration>,
    ) -> u32 {
        match timeout {
            Some(limit) => {
                match with_timeout(limit, self.wait_inner(mask, clear_on_exit, wait_for_all)).await
                {
                    Ok(bits) => bits,
                    Err(_) => self.get(),
                }
            }
            None => self.wait_inner(mask, clear_on_exit, wait_for_all).await,
        }
    }
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

// The named channels. Statics so interrupt-adjacent code and every worker
// share them without plumbing.

/// Faults, fault-clear, restart, network loss.
pub static SYSTEM_EVENTS: EventGroup = EventGroup::new();
/// One bit per test type; set means "run", clear means "stop".
pub static TEST_CONTROL: EventGroup = EventGroup::new();
/// Lifecycle notices from the run loops.
pub static TEST_PHASE: EventGroup = EventGroup::new();
/// Operator commands; each bit doubles as its own acknowledgment flag.
pub static USER_COMMAND: EventGroup = EventGroup::new();
/// Operator data updates (new test, delete, entry, tune).
pub static USER_UPDATE: EventGroup = EventGroup::new();
/// Scheduler-internal coordination flags.
pub static SYNC_CONTROL: EventGroup = EventGroup::new();
/// Presentation-client lifecycle.
pub static CLIENT_EVENTS: EventGroup = EventGroup::new();

/// Bits on [`SYSTEM_EVENTS`].
pub mod system {
    pub const ERROR: u32 = 1 << 1;
    pub const SYSTEM_FAULT: u32 = 1 << 2;
    pub const FAULT_CLEARED: u32 = 1 << 3;
    pub const NETWORK_DISCONNECTED: u32 = 1 << 4;
    pub const RESTART: u32 = 1 << 5;
    // Boot progress.
    pub const SELF_CHECK_OK: u32 = 1 << 6;
    pub const SETTING_LOADED: u32 = 1 << 7;
    pub const LOAD_BANK_CHECKED: u32 = 1 << 8;
}

/// Bits on [`TEST_PHASE`].
pub mod phase {
    pub const TEST_ONGOING: u32 = 1 << 0;
    pub const TEST_TIME_END: u32 = 1 << 1;
    pub const DATA_CAPTURED: u32 = 1 << 2;
    pub const VALID_DATA: u32 = 1 << 3;
    pub const TEST_FAILED: u32 = 1 << 4;
    pub const RETEST: u32 = 1 << 5;
    pub const TEST_LIST_EMPTY: u32 = 1 << 6;
    pub const PENDING_TEST_FOUND: u32 = 1 << 7;
}

/// Bits on [`USER_COMMAND`].
pub mod command {
    pub const PAUSE: u32 = 1 << 2;
    pub const RESUME: u32 = 1 << 3;
    pub const AUTO: u32 = 1 << 4;
    pub const MANUAL: u32 = 1 << 5;
    pub const START: u32 = 1 << 6;
    pub const STOP: u32 = 1 << 7;

    pub const ALL: u32 = PAUSE | RESUME | AUTO | MANUAL | START | STOP;
}

/// Bits on [`USER_UPDATE`].
pub mod update {
    pub const NEW_TEST: u32 = 1 << 0;
    pub const DELETE_TEST: u32 = 1 << 1;
    pub const DATA_ENTRY: u32 = 1 << 2;
    pub const USER_TUNE: u32 = 1 << 3;
}

/// Bits on [`SYNC_CONTROL`]. Opposing pairs: raising one lowers the other.
pub mod sync_flag {
    pub const MANAGER_WAIT: u32 = 1 << 0;
    pub const MANAGER_ACTIVE: u32 = 1 << 1;
    pub const RE_TEST: u32 = 1 << 2;
    pub const SKIP_TEST: u32 = 1 << 3;
    pub const SAVE: u32 = 1 << 4;
    pub const START_OBSERVER: u32 = 1 << 6;
    pub const STOP_OBSERVER: u32 = 1 << 7;
}

/// Bits on [`CLIENT_EVENTS`].
pub mod client {
    pub const CONNECTED: u32 = 1 << 0;
    pub const DISCONNECTED: u32 = 1 << 1;
    /// A transition asked for a fresh report to the presentation layer.
    pub const REPORT_DUE: u32 = 1 << 2;
}

/// Raises a sync flag, lowering its opposing partner first so the pair
/// can never be observed raised together.
pub fn raise_sync_flag(flag: u32) {
    let opposing = match flag {
        sync_flag::MANAGER_WAIT => sync_flag::MANAGER_ACTIVE,
        sync_flag::MANAGER_ACTIVE => sync_flag::MANAGER_WAIT,
        sync_flag::RE_TEST => sync_flag::SKIP_TEST,
        sync_flag::SKIP_TEST => sync_flag::RE_TEST,
        sync_flag::START_OBSERVER => sync_flag::STOP_OBSERVER,
        sync_flag::STOP_OBSERVER => sync_flag::START_OBSERVER,
        _ => 0,
    };
    if opposing != 0 {
        SYNC_CONTROL.clear_bits(opposing);
    }
    SYNC_CONTROL.set_bits(flag);
}

/// Stops every test by lowering the whole control mask.
pub fn stop_all_tests() {
    TEST_CONTROL.clear_bits(all_test_bits());
}

pub const fn all_test_bits() -> u32 {
    (1 << TestType::COUNT) - 1
}
