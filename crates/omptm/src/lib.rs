// SPDX-License-Identifier: Apache-2.0

//! OpenMP thread-manager adapter, free-agent flavor.
//!
//! Translates the action lists of the resource manager into OpenMP
//! thread activation: worker threads run parallel regions on the CPUs
//! of the process mask, while *free agents* (independently activatable
//! task threads, each pinned to one CPU) soak up extra CPUs granted at
//! runtime and surrender them when the owner wants them back.
//!
//! The adapter keeps one atomic state word per CPU and makes all of its
//! decisions with atomic bit operations, so OpenMP callbacks arriving
//! on different threads never take the manager's locks.

pub mod cpu_state;
pub mod free_agents;
pub mod runtime;

pub use free_agents::FreeAgentManager;
pub use runtime::OpenMpRuntime;
