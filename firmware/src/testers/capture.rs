//! Capture cells.
//!
//! Each timing test owns a cell that the edge interrupts stamp: the
//! opening edge when mains drops, the closing edge when the measured
//! transition lands. The first accepted edge latches; later edges on the
//! same line are ignored until the run loop re-arms the cell, which is
//! what keeps relay chatter out of the measurement.
//!
//! A disarmed cell ignores every edge, so stray transitions between runs
//! cannot pollute the next measurement.

use portable_atomic::{AtomicBool, AtomicU64, Ordering};

use rig_core::lifecycle::CaptureWindow;

pub struct CaptureCell {
    armed: AtomicBool,
    start_ms: AtomicU64,
    end_ms: AtomicU64,
    capture_ok: AtomicBool,
}

impl CaptureCell {
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            start_ms: AtomicU64::new(0),
            end_ms: AtomicU64::new(0),
            capture_ok: AtomicBool::new(false),
        }
    }

    /// Clears the stamps and accepts edges again. Called by the run loop
    /// right before it applies the load.
    pub fn arm(&self) {
        self.start_ms.store(0, Ordering::Release);
        self.end_ms.store(0, Ordering::Release);
        self.capture_ok.store(false, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Stamps the opening edge. A zero clock is nudged to one so "never
    /// stamped" stays distinguishable.
    pub fn stamp_start(&self, now_ms: u64) {
        if !self.is_armed() {
            return;
        }
        let stamp = now_ms.max(1);
        let _ = self
            .start_ms
            .compare_exchange(0, stamp, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Stamps the closing edge and marks the capture complete. Ignored
    /// until the opening edge has landed; an edge that would produce a
    /// negative interval is dropped.
    pub fn stamp_end(&self, now_ms: u64) {
        if !self.is_armed() {
            return;
        }
        let start = self.start_ms.load(Ordering::Acquire);
        if start == 0 || now_ms < start {
            return;
        }
        if self
            .end_ms
            .compare_exchange(0, now_ms.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.capture_ok.store(true, Ordering::Release);
        }
    }

    /// Consistent snapshot for the lifecycle engine. `capture_ok` is read
    /// last so a window claiming completeness always carries both stamps.
    pub fn snapshot(&self) -> CaptureWindow {
        let start_ms = self.start_ms.load(Ordering::Acquire);
        let end_ms = self.end_ms.load(Ordering::Acquire);
        let capture_ok = self.capture_ok.load(Ordering::Acquire);
        CaptureWindow {
            start_ms,
            end_ms,
            capture_ok,
        }
    }
}

impl Default for CaptureCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Mains-loss to inverter-pickup window for the switch-time test.
pub static SWITCH_CAPTURE: CaptureCell = CaptureCell::new();
/// Mains-loss to UPS-shutdown window for the backup-time test.
pub static BACKUP_CAPTURE: CaptureCell = CaptureCell::new();

/// Per-line chatter filter for the edge task. An edge inside the window
/// of the last accepted edge on the same line is rejected; the filter
/// never sleeps, so an edge on the other line lands no matter how close
/// it follows.
pub struct EdgeFilter {
    window_ms: u64,
    last_accepted_ms: Option<u64>,
}

impl EdgeFilter {
    pub const fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_accepted_ms: None,
        }
    }

    pub fn accept(&mut self, now_ms: u64) -> bool {
        if self
            .last_accepted_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.window_ms)
        {
            return false;
        }
        self.last_accepted_ms = Some(now_ms);
        true
    }
}
