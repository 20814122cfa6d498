// SPDX-License-Identifier: Apache-2.0

//! Administrative mask controller.
//!
//! A controller attaches to existing segments without registering a pid
//! and rewrites process masks at runtime: shrink a process, grow it, or
//! move CPUs between processes. The target adopts the change on its
//! next poll; the controller can optionally wait for that to happen.
//!
//! The controller also carries the launcher flow: pre-registering a
//! process that will initialize later, and cleaning up after a process
//! that never did (or died).

use crate::error::Error;
use dynres_config::Options;
use dynres_shmem::cpuinfo::Cpuinfo;
use dynres_shmem::procinfo::Procinfo;
use dynres_shmem::{CpuSet, Outcome, ProcessId};
use std::time::{Duration, Instant};

/// How long a synchronous mask update waits for the target's poll.
const SYNC_POLL_TIMEOUT: Duration = Duration::from_secs(5);

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Whether a mask update call waits for the target to adopt it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMaskMode {
    /// Return as soon as the pending mask is written.
    Async,
    /// Block until the target polls and adopts the mask.
    Sync,
}

/// Handle of the administrative mask controller.
pub struct DromController {
    cpuinfo: Cpuinfo,
    procinfo: Procinfo,
}

impl DromController {
    /// Attaches to the instance named by the options' segment key.
    /// Fails with a missing-segment error when no process created the
    /// tables yet.
    pub fn attach(options: &Options) -> Result<Self, Error> {
        let key = options.segment_key();
        Ok(DromController {
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

    /// Every registered pid.
    pub fn pid_list(&self) -> Result<Vec<ProcessId>, Error> {
        Ok(self.procinfo.pid_list()?)
    }

    /// The mask currently registered to `pid`.
    pub fn process_mask(&self, pid: ProcessId) -> Result<CpuSet, Error> {
        Ok(self.procinfo.process_mask(pid)?)
    }

    /// Rewrites the mask of `pid`. CPUs taken from other processes move
    /// to their stolen masks and are released in the ownership table
    /// immediately (their guests receive disables through their own
    /// observation path). With [`SetMaskMode::Sync`] the call waits
    /// until the target polls and adopts the new mask.
    pub fn set_process_mask(
        &self,
        pid: ProcessId,
        mask: &CpuSet,
        mode: SetMaskMode,
    ) -> Result<Outcome, Error> {
        let update = self.procinfo.set_process_mask(pid, mask)?;
        if update.outcome == Outcome::NoUpdate {
            return Ok(Outcome::NoUpdate);
        }

        // Stolen CPUs stop being owned right now; the thieves' victims
        // observe the disables remotely. The target claims the CPUs on
        // its own poll.
        let mut stolen_cpus = CpuSet::new();
        for (victim, cpus) in &update.stolen {
            tracing::info!(victim = *victim, cpus = %cpus, target = pid, "moving CPUs between processes");
            stolen_cpus |= *cpus;
        }
        if !stolen_cpus.is_empty() {
            let _ = self.cpuinfo.release_mask(&stolen_cpus)?;
        }

        match mode {
            SetMaskMode::Async => Ok(Outcome::Noted),
            SetMaskMode::Sync => {
                let deadline = Instant::now() + SYNC_POLL_TIMEOUT;
                while self.procinfo.is_dirty(pid)? {
                    if Instant::now() >= deadline {
                        return Err(Error::PollTimeout(pid));
                    }
                    std::thread::sleep(SYNC_POLL_INTERVAL);
                }
                Ok(Outcome::Success)
            }
        }
    }

    /// Pre-registers a process a launcher knows will initialize later,
    /// claiming its CPUs in both tables. With `steal`, CPUs registered
    /// to other processes are taken over.
    pub fn preregister(&self, pid: ProcessId, mask: &CpuSet, steal: bool) -> Result<(), Error> {
        self.procinfo.preregister(pid, mask, steal)?;
        if let Err(e) = self.cpuinfo.register(pid, mask, steal) {
            let _ = self.procinfo.deregister(pid, false);
            return Err(e.into());
        }
        Ok(())
    }

    /// Removes a process that never initialized or is known to be gone.
    /// With `return_stolen`, CPUs it stole go back to their previous
    /// owners (adopted on their next poll).
    pub fn post_finalize(&self, pid: ProcessId, return_stolen: bool) -> Result<(), Error> {
        let _ = self.cpuinfo.deregister(pid)?;
        self.procinfo.deregister(pid, return_stolen)?;
        Ok(())
    }
}

/// Creates both tables for a launcher that pre-registers before any
/// process initialized. Geometry comes from the options.
pub fn create_tables(options: &Options, system_size: u32) -> Result<DromController, Error> {
    let key = options.segment_key();
    Ok(DromController {
        cpuinfo: Cpuinfo::create_or_attach(&key, system_size)?,
        procinfo: Procinfo::create_or_attach(&key, system_size, options.shm_size_multiplier)?,
    })
}
