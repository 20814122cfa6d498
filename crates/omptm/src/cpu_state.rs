// SPDX-License-Identifier: Apache-2.0

//! Atomic per-CPU state word of the adapter.
//!
//! Each CPU carries a small bitfield describing what it is being used
//! for. Decisions are taken with single-word atomic updates
//! (compare-and-set of one bit for another, test-and-set with a
//! simultaneous clear) so concurrent OpenMP callbacks never need a
//! lock.

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// What a CPU is currently being used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u32 {
        /// Usable but running nothing of interest.
        const IDLE = 1 << 0;
        /// Handed to the resource pool.
        const LENT = 1 << 1;
        /// The owner demanded it back; do not reuse.
        const RECLAIMED = 1 << 2;
        /// Running an implicit task of a parallel region.
        const IN_PARALLEL = 1 << 3;
        /// A free agent thread is active on it.
        const FREE_AGENT_ENABLED = 1 << 4;
    }
}

/// Lock-free per-CPU state word.
#[derive(Debug, Default)]
pub struct AtomicCpuState(AtomicU32);

impl AtomicCpuState {
    /// A state word holding `flags`.
    #[must_use]
    pub fn new(flags: CpuFlags) -> Self {
        AtomicCpuState(AtomicU32::new(flags.bits()))
    }

    /// Current flags.
    #[must_use]
    pub fn load(&self) -> CpuFlags {
        CpuFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Replaces the whole word.
    pub fn store(&self, flags: CpuFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }

    /// Sets `flags` in the word.
    pub fn set(&self, flags: CpuFlags) {
        let _ = self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags`; returns whether any of them was set.
    pub fn clear(&self, flags: CpuFlags) -> bool {
        let previous = self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
        previous & flags.bits() != 0
    }

    /// If `old` is set, atomically replaces it with `new` and returns
    /// true.
    pub fn swap_flag(&self, old: CpuFlags, new: CpuFlags) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if bits & old.bits() != 0 {
                    Some((bits & !old.bits()) | new.bits())
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// If `set` is not yet set, atomically sets it while clearing
    /// `clear`, and returns true.
    pub fn test_set_clear(&self, set: CpuFlags, clear: CpuFlags) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if bits & set.bits() == 0 {
                    Some((bits | set.bits()) & !clear.bits())
                } else {
                    None
                }
            })
            .is_ok()
    }
}
