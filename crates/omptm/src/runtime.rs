// SPDX-License-Identifier: Apache-2.0

//! Interface to the OpenMP runtime's free-agent extension.
//!
//! The adapter drives the runtime through this trait instead of the
//! raw entry points, which keeps the decision logic testable without an
//! OpenMP runtime in the process.

/// Handle to the OpenMP runtime's free-agent thread control.
pub trait OpenMpRuntime: Send + Sync {
    /// Total free agent threads the runtime was started with.
    fn num_free_agents(&self) -> usize;

    /// Activates or deactivates one free agent thread.
    fn set_free_agent_active(&self, agent_id: usize, active: bool);

    /// Pins the calling thread to one CPU.
    fn bind_current_thread(&self, cpuid: usize);
}

/// Descriptor of a parallel region event, as reported by the OMPT
/// callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelRegion {
    /// Nesting level; the adapter acts on level 1 only.
    pub level: u32,
    /// Requested team size.
    pub requested_parallelism: usize,
}
