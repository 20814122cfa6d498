// SPDX-License-Identifier: Apache-2.0

//! Monotonic time source shared by all processes on the node.
//!
//! Statistics timestamps stored in the segments must be comparable
//! across processes, so they all come from `CLOCK_MONOTONIC`, which on
//! Linux counts from boot and is common to every process on the node.

use nix::time::{clock_gettime, ClockId};

/// Nanoseconds since an arbitrary (boot-time) epoch common to all
/// processes on the node.
#[must_use]
pub fn monotonic_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec() as u64),
        // A failing monotonic clock read has no sane fallback; statistics
        // degrade but state transitions keep working.
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::monotonic_ns;

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
