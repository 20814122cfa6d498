// SPDX-License-Identifier: Apache-2.0

//! Read-only statistics surface.
//!
//! Attaches to existing segments as an observer; never registers a pid
//! and never mutates ownership. Used by monitoring tools and the shmem
//! inspection CLI.

use crate::error::Error;
use dynres_config::Options;
use dynres_shmem::cpuinfo::{Cpuinfo, CpuSnapshot, CpuState};
use dynres_shmem::procinfo::{ProcSnapshot, Procinfo};
use dynres_shmem::ProcessId;

/// Read-only handle over both tables.
pub struct StatsReader {
    cpuinfo: Cpuinfo,
    procinfo: Procinfo,
}

impl StatsReader {
    /// Attaches to the instance named by the options' segment key.
    pub fn attach(options: &Options) -> Result<Self, Error> {
        let key = options.segment_key();
        Ok(StatsReader {
            cpuinfo: Cpuinfo::attach_existing(&key)?,
            procinfo: Procinfo::attach_existing(&key)?,
        })
    }

    /// Detaches from both tables.
    pub fn detach(self) -> Result<(), Error> {
        self.cpuinfo.detach()?;
        self.procinfo.detach()?;
        Ok(())
    }

    /// Number of CPUs managed by the instance.
    pub fn num_cpus(&self) -> Result<u32, Error> {
        Ok(self.cpuinfo.system_size()?)
    }

    /// Every registered pid.
    pub fn pid_list(&self) -> Result<Vec<ProcessId>, Error> {
        Ok(self.procinfo.pid_list()?)
    }

    /// Fraction of observed lifetime `cpuid` spent in `state`.
    pub fn cpu_state_fraction(&self, cpuid: usize, state: CpuState) -> Result<f64, Error> {
        Ok(self.cpuinfo.state_fraction(cpuid, state)?)
    }

    /// Accumulated CPU time of a process, nanoseconds.
    pub fn cpu_usage(&self, pid: ProcessId) -> Result<u64, Error> {
        Ok(self.procinfo.cpu_usage(pid)?)
    }

    /// Average CPU consumption rate of a process, ns of CPU per second
    /// of lifetime.
    pub fn cpu_avg_usage(&self, pid: ProcessId) -> Result<u64, Error> {
        Ok(self.procinfo.cpu_avg_usage(pid)?)
    }

    /// `(pid, usage_ns)` for every registered process.
    pub fn cpu_usage_list(&self) -> Result<Vec<(ProcessId, u64)>, Error> {
        let pids = self.procinfo.pid_list()?;
        let mut out = Vec::with_capacity(pids.len());
        for pid in pids {
            out.push((pid, self.procinfo.cpu_usage(pid)?));
        }
        Ok(out)
    }

    /// Sum of accumulated CPU time over all registered processes.
    pub fn node_usage(&self) -> Result<u64, Error> {
        Ok(self.procinfo.node_usage()?)
    }

    /// Load averages of a process over the 1/5/15-minute windows.
    pub fn load_avg(&self, pid: ProcessId) -> Result<[f64; 3], Error> {
        Ok(self.procinfo.load_avg(pid)?)
    }

    /// Number of CPUs currently registered to a process.
    pub fn active_cpus(&self, pid: ProcessId) -> Result<usize, Error> {
        Ok(self.procinfo.active_cpus(pid)?)
    }

    /// Full snapshot of the ownership table.
    pub fn cpu_snapshot(&self) -> Result<Vec<CpuSnapshot>, Error> {
        Ok(self.cpuinfo.snapshot()?)
    }

    /// Full snapshot of the process table.
    pub fn process_snapshot(&self) -> Result<Vec<ProcSnapshot>, Error> {
        Ok(self.procinfo.snapshot()?)
    }
}
