// SPDX-License-Identifier: Apache-2.0

//! Shared-memory tables and the CPU ownership state machine.
//!
//! Two named segments hold the node-wide view of CPU state:
//!
//! - [`cpuinfo`]: one record per CPU (owner, current guest, lifecycle
//!   state, a bounded queue of pending requests, per-state time
//!   statistics).
//! - [`procinfo`]: one record per registered process (registered mask,
//!   pending future mask, stolen-CPU bookkeeping, usage counters).
//!
//! Every mutating operation runs under the segment's robust
//! process-shared mutex and returns an [`action::ActionList`] describing
//! the callbacks the caller must run *after* the lock is released.
//! Nothing inside a segment is a pointer; all cross-references are plain
//! process ids and CPU indices, so segments may be mapped at different
//! addresses in different processes.

pub mod action;
pub mod clock;
pub mod cpuinfo;
pub mod cpuset;
pub mod error;
pub mod procinfo;
pub mod requests;
pub mod segment;

mod mutex;

pub use action::{Action, ActionList};
pub use cpuset::{CpuSet, MAX_CPUS};
pub use error::{OpError, Outcome, ResourceError, ShmemError};

/// Identifier of a registered process. Conventionally the OS pid, but any
/// positive integer unique on the node works (sub-process descriptors in
/// the same address space use synthesized ids).
pub type ProcessId = i32;

/// Sentinel for "no process" in shared records.
pub const NO_PROCESS: ProcessId = 0;

/// Probe deciding whether a process id is still alive, used when
/// recovering from a holder that died inside a critical section.
pub type LivenessProbe = fn(ProcessId) -> bool;

/// Default liveness probe: signal 0 delivery to the OS pid.
#[must_use]
pub fn process_alive(pid: ProcessId) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
