//! Decompilation statistics.
//!
//! Counters are updated from whichever thread performs the operation and
//! read as a consistent-enough snapshot for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

use super::reason::DecompReason;

const REASON_BITS: usize = 8;

/// Engine-wide counters.
#[derive(Debug)]
pub struct DecompStats {
    /// Records created, by reason bit.
    created_by_reason: [AtomicU64; REASON_BITS],
    records_created: AtomicU64,
    records_merged: AtomicU64,
    records_cancelled: AtomicU64,
    records_consumed: AtomicU64,
    osr_captures: AtomicU64,
    forced_decompiles: AtomicU64,
    frames_rebuilt: AtomicU64,
    global_buffer_uses: AtomicU64,
    capture_failures: AtomicU64,
}

impl Default for DecompStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DecompStats {
    /// Zeroed counters.
    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            created_by_reason: [ZERO; REASON_BITS],
            records_created: AtomicU64::new(0),
            records_merged: AtomicU64::new(0),
            records_cancelled: AtomicU64::new(0),
            records_consumed: AtomicU64::new(0),
            osr_captures: AtomicU64::new(0),
            forced_decompiles: AtomicU64::new(0),
            frames_rebuilt: AtomicU64::new(0),
            global_buffer_uses: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
        }
    }

    /// A new record was inserted.
    #[inline]
    pub fn record_created(&self, reason: DecompReason) {
        self.records_created.fetch_add(1, Ordering::Relaxed);
        for bit in 0..REASON_BITS {
            if reason.bits() & (1 << bit) != 0 {
                self.created_by_reason[bit].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// A request merged into an existing record.
    #[inline]
    pub fn record_merged(&self) {
        self.records_merged.fetch_add(1, Ordering::Relaxed);
    }

    /// A record was withdrawn before being consumed.
    #[inline]
    pub fn record_cancelled(&self) {
        self.records_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// A record was consumed by a rebuild.
    #[inline]
    pub fn record_consumed(&self) {
        self.records_consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// A capture went through the OSR trampoline.
    #[inline]
    pub fn osr_captured(&self) {
        self.osr_captures.fetch_add(1, Ordering::Relaxed);
    }

    /// A trampoline fill invalidated the compiled frame.
    #[inline]
    pub fn forced_decompile(&self) {
        self.forced_decompiles.fetch_add(1, Ordering::Relaxed);
    }

    /// Interpreter frames were written by a rebuild.
    #[inline]
    pub fn frames_rebuilt(&self, count: usize) {
        self.frames_rebuilt.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// A capture fell back to the global buffer.
    #[inline]
    pub fn global_buffer_used(&self) {
        self.global_buffer_uses.fetch_add(1, Ordering::Relaxed);
    }

    /// A capture failed.
    #[inline]
    pub fn capture_failed(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records created whose reasons included `reason`.
    pub fn created_with(&self, reason: DecompReason) -> u64 {
        (0..REASON_BITS)
            .filter(|&bit| reason.bits() & (1 << bit) != 0)
            .map(|bit| self.created_by_reason[bit].load(Ordering::Relaxed))
            .sum()
    }

    /// Current values.
    pub fn snapshot(&self) -> DecompStatsSnapshot {
        DecompStatsSnapshot {
            records_created: self.records_created.load(Ordering::Relaxed),
            records_merged: self.records_merged.load(Ordering::Relaxed),
            records_cancelled: self.records_cancelled.load(Ordering::Relaxed),
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            osr_captures: self.osr_captures.load(Ordering::Relaxed),
            forced_decompiles: self.forced_decompiles.load(Ordering::Relaxed),
            frames_rebuilt: self.frames_rebuilt.load(Ordering::Relaxed),
            global_buffer_uses: self.global_buffer_uses.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DecompStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecompStatsSnapshot {
    /// Records inserted.
    pub records_created: u64,
    /// Requests merged into existing records.
    pub records_merged: u64,
    /// Records withdrawn.
    pub records_cancelled: u64,
    /// Records consumed by a rebuild.
    pub records_consumed: u64,
    /// Captures that used the OSR trampoline.
    pub osr_captures: u64,
    /// Captures whose trampoline fill forced the decompilation.
    pub forced_decompiles: u64,
    /// Interpreter frames written.
    pub frames_rebuilt: u64,
    /// Captures that used the global buffer.
    pub global_buffer_uses: u64,
    /// Captures that failed.
    pub capture_failures: u64,
}
