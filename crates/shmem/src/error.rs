// SPDX-License-Identifier: Apache-2.0

//! Status and error taxonomy of the shared-memory tables.
//!
//! Operations distinguish three non-error completions ([`Outcome`]) from
//! genuine failures ([`ResourceError`]). Segment plumbing failures
//! ([`ShmemError`]) are kept separate: they indicate an unusable mapping,
//! not a state-machine refusal.

use crate::ProcessId;

/// Non-error completion of a table operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Outcome {
    /// State changed as requested.
    Success,
    /// The request was recorded or signalled; completion is deferred to
    /// another process (queued acquire, reclaim with an active guest).
    Noted,
    /// The request was already satisfied; nothing changed.
    #[default]
    NoUpdate,
}

impl Outcome {
    /// Combines the outcome of one CPU with the accumulated outcome of a
    /// mask variant: any deferral dominates, any change beats a no-op.
    #[must_use]
    pub fn merge(self, other: Outcome) -> Outcome {
        use Outcome::{NoUpdate, Noted, Success};
        match (self, other) {
            (Noted, _) | (_, Noted) => Noted,
            (Success, _) | (_, Success) => Success,
            (NoUpdate, NoUpdate) => NoUpdate,
        }
    }
}

/// Refusals of the ownership state machine.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// The operation requires ownership of the CPU.
    #[error("operation on CPU {0} requires ownership")]
    NotOwner(usize),

    /// The CPU is registered to another process and stealing was not
    /// requested.
    #[error("CPU {0} is registered to another process")]
    OwnedElsewhere(usize),

    /// The CPU has no owner.
    #[error("CPU {0} has no owner")]
    Disabled(usize),

    /// The request queue of the CPU is full.
    #[error("request queue of CPU {0} is full")]
    QueueFull(usize),

    /// The process id is already registered.
    #[error("process {0} is already registered")]
    AlreadyRegistered(ProcessId),

    /// The process id is not registered.
    #[error("process {0} is not registered")]
    NotRegistered(ProcessId),

    /// The process table has no free slot.
    #[error("process table is full")]
    TooManyProcesses,

    /// The CPU id is outside the managed range.
    #[error("CPU id {cpuid} out of range (system size {system_size})")]
    InvalidCpu {
        /// Offending CPU id.
        cpuid: usize,
        /// CPUs managed by the segment.
        system_size: u32,
    },
}

/// Failure of a table operation: either the state machine refused the
/// request or the segment plumbing itself failed.
#[derive(thiserror::Error, Debug)]
pub enum OpError {
    /// The state machine refused the request.
    #[error(transparent)]
    Refused(#[from] ResourceError),

    /// The segment could not be locked or is unusable.
    #[error(transparent)]
    Shmem(#[from] ShmemError),
}

/// Failures of the shared-memory plumbing itself.
#[derive(thiserror::Error, Debug)]
pub enum ShmemError {
    /// The segment does not exist and attach-only was requested.
    #[error("shared memory segment `{0}` does not exist")]
    SegmentMissing(String),

    /// The segment exists but carries an incompatible version tag. The
    /// caller must pick a different key; this instance cannot be shared.
    #[error("segment `{name}` version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Segment name.
        name: String,
        /// Version found in the mapped header.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// The segment exists but its geometry does not match this process
    /// (system size or process capacity differ).
    #[error("segment `{name}` layout mismatch: {detail}")]
    LayoutMismatch {
        /// Segment name.
        name: String,
        /// Human-readable description of the difference.
        detail: String,
    },

    /// The segment never became ready or its header is damaged.
    #[error("segment `{0}` is corrupted or its creator died during setup")]
    SegmentCorrupted(String),

    /// Robust mutex initialization or lock failure.
    #[error("segment mutex failure: {0}")]
    Mutex(nix::errno::Errno),

    /// Any other OS-level failure.
    #[error("shared memory syscall failed: {0}")]
    Os(#[from] nix::errno::Errno),
}

#[cfg(test)]
mod tests {
    use super::Outcome;

    #[test]
    fn merge_prefers_deferred_work() {
        assert_eq!(Outcome::Noted.merge(Outcome::Success), Outcome::Noted);
        assert_eq!(Outcome::NoUpdate.merge(Outcome::Noted), Outcome::Noted);
        assert_eq!(Outcome::Success.merge(Outcome::NoUpdate), Outcome::Success);
        assert_eq!(Outcome::NoUpdate.merge(Outcome::NoUpdate), Outcome::NoUpdate);
    }
}
