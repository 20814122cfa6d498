// SPDX-License-Identifier: Apache-2.0

//! Per-CPU ownership table and the lend/reclaim/acquire/borrow/return
//! state machine.
//!
//! Each CPU record tracks its registered owner, the process currently
//! allowed to run on it (the guest), a lifecycle state derived from the
//! two, a bounded queue of pending requests, and per-state time
//! statistics. All mutations happen under the segment mutex and emit
//! [`ActionList`] items that the caller executes after unlocking.
//!
//! State is always a function of `(owner, guest)`:
//! no owner is `Disabled`; owner running on its own CPU is `Busy`; any
//! other combination (no guest, or a foreign guest) is `Lent`.

use crate::action::ActionList;
use crate::clock::monotonic_ns;
use crate::cpuset::CpuSet;
use crate::error::{OpError, Outcome, ResourceError, ShmemError};
use crate::requests::{PushResult, RequestQueue};
use crate::segment::{Segment, SegmentGuard, ShmBody};
use crate::{process_alive, LivenessProbe, ProcessId, MAX_CPUS, NO_PROCESS};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Lifecycle state of a CPU.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum CpuState {
    /// No owner is registered.
    Disabled = 0,
    /// Owned, but the owner is not running on it (free or guested).
    Lent = 1,
    /// The owner is running on its own CPU.
    Busy = 2,
}

/// Number of [`CpuState`] variants, sizing the statistics buckets.
pub const NUM_CPU_STATES: usize = 3;

#[repr(C)]
#[derive(Clone, Copy)]
struct CpuRecord {
    owner: ProcessId,
    guest: ProcessId,
    state: u8,
    _pad: [u8; 3],
    stats_accum: [u64; NUM_CPU_STATES],
    stats_last_ts: u64,
    requests: RequestQueue,
}

impl CpuRecord {
    fn state(&self) -> CpuState {
        CpuState::try_from(self.state).unwrap_or(CpuState::Disabled)
    }

    /// Transitions to `next`, charging the elapsed interval to the state
    /// being left.
    fn set_state(&mut self, next: CpuState, now: u64) {
        let current = self.state();
        self.stats_accum[current as usize] =
            self.stats_accum[current as usize].saturating_add(now.saturating_sub(self.stats_last_ts));
        self.stats_last_ts = now;
        self.state = next.into();
    }

    /// Derives the state from `(owner, guest)` and applies it.
    fn sync_state(&mut self, now: u64) {
        let next = if self.owner == NO_PROCESS {
            CpuState::Disabled
        } else if self.owner == self.guest {
            CpuState::Busy
        } else {
            CpuState::Lent
        };
        self.set_state(next, now);
    }

    /// Hands a free guest slot to the next waiter, if any. The owner's
    /// own request wins over FIFO order. Returns the served pid.
    fn serve_next_waiter(&mut self, now: u64, actions: &mut ActionList, cpuid: usize) -> Option<ProcessId> {
        debug_assert_eq!(self.guest, NO_PROCESS);
        let waiter = self.requests.pop_next(self.owner)?;
        self.guest = waiter;
        self.sync_state(now);
        actions.enable(waiter, cpuid);
        Some(waiter)
    }
}

/// Point-in-time view of one CPU record, for queries and inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSnapshot {
    /// CPU id.
    pub cpuid: usize,
    /// Registered owner, [`NO_PROCESS`] if none.
    pub owner: ProcessId,
    /// Current guest, [`NO_PROCESS`] if none.
    pub guest: ProcessId,
    /// Lifecycle state.
    pub state: CpuState,
    /// Pids waiting in the request queue, front first.
    pub waiters: Vec<ProcessId>,
}

/// Shared body of the cpuinfo segment.
#[repr(C)]
pub struct CpuinfoBody {
    system_size: u32,
    _pad: u32,
    entries: [CpuRecord; MAX_CPUS],
}

// Plain data: repr(C), no pointers, zero-initialized is an empty table.
#[allow(unsafe_code)]
unsafe impl ShmBody for CpuinfoBody {
    const ROLE: &'static str = "cpuinfo";
    const VERSION: u32 = 1;
}

/// Handle to the per-CPU ownership table of one node-local instance.
pub struct Cpuinfo {
    segment: Segment<CpuinfoBody>,
    liveness: LivenessProbe,
}

impl Cpuinfo {
    /// Creates the table for `system_size` CPUs or attaches to the
    /// existing one, verifying its geometry.
    pub fn create_or_attach(key: &str, system_size: u32) -> Result<Self, ShmemError> {
        if system_size as usize > MAX_CPUS {
            return Err(ShmemError::LayoutMismatch {
                name: format!("cpuinfo-{key}"),
                detail: format!(
                    "system size {system_size} exceeds supported maximum {MAX_CPUS}"
                ),
            });
        }
        let now = monotonic_ns();
        let (segment, created) = Segment::create_or_attach(key, 1, |body: &mut CpuinfoBody| {
            body.system_size = system_size;
            for record in &mut body.entries {
                record.stats_last_ts = now;
            }
        })?;
        let table = Cpuinfo {
            segment,
            liveness: process_alive,
        };
        if !created {
            let guard = table.segment.lock()?;
            if guard.system_size != system_size {
                let detail = format!(
                    "system size {} (segment) != {} (caller)",
                    guard.system_size, system_size
                );
                let name = table.segment.name().to_owned();
                drop(guard);
                return Err(ShmemError::LayoutMismatch { name, detail });
            }
        }
        Ok(table)
    }

    /// Attaches to an existing table without registering anything,
    /// failing with [`ShmemError::SegmentMissing`] when absent. Used by
    /// observers (administration tools, launchers).
    pub fn attach_existing(key: &str) -> Result<Self, ShmemError> {
        Ok(Cpuinfo {
            segment: Segment::attach_existing(key)?,
            liveness: process_alive,
        })
    }

    /// Replaces the liveness probe used during dead-holder recovery.
    #[must_use]
    pub fn with_liveness_probe(mut self, probe: LivenessProbe) -> Self {
        self.liveness = probe;
        self
    }

    /// Detaches, unlinking the segment if this was the last attacher.
    pub fn detach(self) -> Result<(), ShmemError> {
        self.segment.detach()
    }

    /// CPUs managed by this table.
    pub fn system_size(&self) -> Result<u32, ShmemError> {
        Ok(self.lock_repaired()?.0.system_size)
    }

    fn lock_repaired(&self) -> Result<(SegmentGuard<'_, CpuinfoBody>, ActionList), ShmemError> {
        let mut guard = self.segment.lock()?;
        let mut repairs = ActionList::new();
        if guard.recovered() {
            tracing::warn!(segment = %self.segment.name(), "mutex holder died; purging dead processes");
            purge_dead(&mut guard, self.liveness, monotonic_ns(), &mut repairs);
        }
        Ok((guard, repairs))
    }

    fn check_cpuid(body: &CpuinfoBody, cpuid: usize) -> Result<(), ResourceError> {
        if cpuid < body.system_size as usize {
            Ok(())
        } else {
            Err(ResourceError::InvalidCpu {
                cpuid,
                system_size: body.system_size,
            })
        }
    }

    fn check_mask(body: &CpuinfoBody, mask: &CpuSet) -> Result<(), ResourceError> {
        match mask.iter().find(|&c| c >= body.system_size as usize) {
            Some(cpuid) => Err(ResourceError::InvalidCpu {
                cpuid,
                system_size: body.system_size,
            }),
            None => Ok(()),
        }
    }

    /// Registers `pid` as the owner of every CPU in `mask`.
    ///
    /// Without `steal`, any CPU already registered to another process
    /// fails the whole call with no change. With `steal`, foreign CPUs
    /// are re-registered to `pid`; a guest of a stolen CPU keeps running
    /// until evicted by a later reclaim or mask update.
    pub fn register(&self, pid: ProcessId, mask: &CpuSet, steal: bool) -> Result<ActionList, OpError> {
        let (mut guard, mut actions) = self.lock_repaired()?;
        let now = monotonic_ns();
        Self::check_mask(&guard, mask)?;
        for cpuid in mask.iter() {
            let record = &guard.entries[cpuid];
            if record.owner != NO_PROCESS && record.owner != pid && !steal {
                return Err(ResourceError::OwnedElsewhere(cpuid).into());
            }
        }
        for cpuid in mask.iter() {
            let record = &mut guard.entries[cpuid];
            record.owner = pid;
            if record.guest == NO_PROCESS {
                record.guest = pid;
            }
            record.sync_state(now);
        }
        drop(guard);
        Ok(actions_take(&mut actions))
    }

    /// Releases every CPU owned by `pid` and removes its queued
    /// requests everywhere. Emits one disable per CPU a foreign guest
    /// must vacate, and enables for waiters promoted on CPUs `pid` was
    /// guesting.
    pub fn deregister(&self, pid: ProcessId) -> Result<ActionList, OpError> {
        let (mut guard, mut actions) = self.lock_repaired()?;
        let now = monotonic_ns();
        let system_size = guard.system_size as usize;
        for cpuid in 0..system_size {
            let record = &mut guard.entries[cpuid];
            let _ = record.requests.drop_pid(pid);
            if record.owner == pid {
                record.owner = NO_PROCESS;
                if record.guest == pid {
                    record.guest = NO_PROCESS;
                } else if record.guest != NO_PROCESS {
                    // The borrower must stop: the CPU no longer exists
                    // as a managed resource.
                    actions.disable(record.guest, cpuid);
                    record.guest = NO_PROCESS;
                }
                // Nobody can be granted a CPU without an owner.
                let _: Vec<ProcessId> = record.requests.drain().collect();
                record.sync_state(now);
            } else if record.guest == pid {
                record.guest = NO_PROCESS;
                record.sync_state(now);
                let _ = record.serve_next_waiter(now, &mut actions, cpuid);
            }
        }
        drop(guard);
        Ok(actions_take(&mut actions))
    }

    /// Lends one owned CPU to the pool (or directly to a queued waiter).
    pub fn lend_cpu(&self, pid: ProcessId, cpuid: usize) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_cpuid(body, cpuid)?;
            lend_one(&mut body.entries[cpuid], pid, cpuid, now, actions)
        })
    }

    /// Lends every owned CPU in `mask`. Fails atomically if any CPU in
    /// the mask is not owned by `pid`.
    pub fn lend_mask(&self, pid: ProcessId, mask: &CpuSet) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_mask(body, mask)?;
            for cpuid in mask.iter() {
                require_owner(&body.entries[cpuid], pid, cpuid)?;
            }
            let mut outcome = Outcome::NoUpdate;
            for cpuid in mask.iter() {
                outcome = outcome.merge(lend_one(&mut body.entries[cpuid], pid, cpuid, now, actions)?);
            }
            Ok(outcome)
        })
    }

    /// Lends every CPU owned and currently used by `pid`.
    pub fn lend_all(&self, pid: ProcessId) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            let mut outcome = Outcome::NoUpdate;
            for cpuid in 0..body.system_size as usize {
                let record = &mut body.entries[cpuid];
                if record.owner == pid && record.guest == pid {
                    outcome = outcome.merge(lend_one(record, pid, cpuid, now, actions)?);
                }
            }
            Ok(outcome)
        })
    }

    /// Lends up to `ncpus` of `pid`'s in-use CPUs, highest id first so
    /// the low CPUs (primary thread and friends) are surrendered last.
    pub fn lend_cpus(&self, pid: ProcessId, ncpus: usize) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            let mut outcome = Outcome::NoUpdate;
            let mut remaining = ncpus;
            for cpuid in (0..body.system_size as usize).rev() {
                if remaining == 0 {
                    break;
                }
                let record = &mut body.entries[cpuid];
                if record.owner == pid && record.guest == pid {
                    outcome = outcome.merge(lend_one(record, pid, cpuid, now, actions)?);
                    remaining -= 1;
                }
            }
            Ok(outcome)
        })
    }

    /// Reclaims one owned CPU, preempting a foreign guest if present.
    pub fn reclaim_cpu(&self, pid: ProcessId, cpuid: usize) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_cpuid(body, cpuid)?;
            reclaim_one(&mut body.entries[cpuid], pid, cpuid, now, actions)
        })
    }

    /// Reclaims every owned CPU in `mask`. Fails atomically on the first
    /// CPU not owned by `pid`.
    pub fn reclaim_mask(&self, pid: ProcessId, mask: &CpuSet) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_mask(body, mask)?;
            for cpuid in mask.iter() {
                require_owner(&body.entries[cpuid], pid, cpuid)?;
            }
            let mut outcome = Outcome::NoUpdate;
            for cpuid in mask.iter() {
                outcome = outcome.merge(reclaim_one(&mut body.entries[cpuid], pid, cpuid, now, actions)?);
            }
            Ok(outcome)
        })
    }

    /// Reclaims every lent CPU owned by `pid`.
    pub fn reclaim_all(&self, pid: ProcessId) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            let mut outcome = Outcome::NoUpdate;
            for cpuid in 0..body.system_size as usize {
                if body.entries[cpuid].owner == pid {
                    outcome = outcome.merge(reclaim_one(&mut body.entries[cpuid], pid, cpuid, now, actions)?);
                }
            }
            Ok(outcome)
        })
    }

    /// Reclaims up to `ncpus` of `pid`'s lent CPUs, lowest id first.
    pub fn reclaim_cpus(&self, pid: ProcessId, ncpus: usize) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            let mut outcome = Outcome::NoUpdate;
            let mut remaining = ncpus;
            for cpuid in 0..body.system_size as usize {
                if remaining == 0 {
                    break;
                }
                let record = &mut body.entries[cpuid];
                if record.owner == pid && record.guest != pid {
                    outcome = outcome.merge(reclaim_one(record, pid, cpuid, now, actions)?);
                    remaining -= 1;
                }
            }
            Ok(outcome)
        })
    }

    /// Acquires a specific CPU: reclaim semantics when owned, immediate
    /// grant when free, otherwise a queued request.
    pub fn acquire_cpu(&self, pid: ProcessId, cpuid: usize) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_cpuid(body, cpuid)?;
            acquire_one(&mut body.entries[cpuid], pid, cpuid, now, actions)
        })
    }

    /// Acquires every CPU in `mask`. Validates first so a refusal on one
    /// CPU (no owner, or a full queue) leaves the whole mask untouched.
    pub fn acquire_mask(&self, pid: ProcessId, mask: &CpuSet) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_mask(body, mask)?;
            for cpuid in mask.iter() {
                let record = &body.entries[cpuid];
                if record.owner == NO_PROCESS {
                    return Err(ResourceError::Disabled(cpuid));
                }
                let would_queue = record.owner != pid && record.guest != NO_PROCESS && record.guest != pid;
                if would_queue && record.requests.len() == crate::requests::REQUEST_QUEUE_CAPACITY
                    && !record.requests.contains(pid)
                {
                    return Err(ResourceError::QueueFull(cpuid));
                }
            }
            let mut outcome = Outcome::NoUpdate;
            for cpuid in mask.iter() {
                outcome = outcome.merge(acquire_one(&mut body.entries[cpuid], pid, cpuid, now, actions)?);
            }
            Ok(outcome)
        })
    }

    /// Acquires up to `ncpus` CPUs following `priority` order: immediate
    /// grants first, then queued requests on the still-busy candidates
    /// for the remainder. Queue-full candidates are skipped.
    pub fn acquire_cpus(
        &self,
        pid: ProcessId,
        ncpus: usize,
        priority: &[usize],
    ) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            let mut granted = 0usize;
            let mut deferred: Vec<usize> = Vec::new();
            for &cpuid in priority {
                if granted == ncpus {
                    break;
                }
                if Self::check_cpuid(body, cpuid).is_err() {
                    continue;
                }
                let record = &mut body.entries[cpuid];
                match try_grant(record, pid, cpuid, now, actions) {
                    Grant::Granted => granted += 1,
                    Grant::Busy => deferred.push(cpuid),
                    Grant::Unavailable => {}
                }
            }
            let mut queued = false;
            let mut missing = ncpus - granted;
            for cpuid in deferred {
                if missing == 0 {
                    break;
                }
                let record = &mut body.entries[cpuid];
                match record.requests.push(pid, 1) {
                    PushResult::Queued | PushResult::Merged => {
                        queued = true;
                        missing -= 1;
                    }
                    PushResult::Full => {}
                }
            }
            Ok(if queued {
                Outcome::Noted
            } else if granted > 0 {
                Outcome::Success
            } else {
                Outcome::NoUpdate
            })
        })
    }

    /// Borrows a specific CPU if its guest slot is free. Never queues.
    pub fn borrow_cpu(&self, pid: ProcessId, cpuid: usize) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_cpuid(body, cpuid)?;
            Ok(borrow_one(&mut body.entries[cpuid], pid, cpuid, now, actions))
        })
    }

    /// Borrows every currently free CPU in `mask`.
    pub fn borrow_mask(&self, pid: ProcessId, mask: &CpuSet) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_mask(body, mask)?;
            let mut outcome = Outcome::NoUpdate;
            for cpuid in mask.iter() {
                outcome = outcome.merge(borrow_one(&mut body.entries[cpuid], pid, cpuid, now, actions));
            }
            Ok(outcome)
        })
    }

    /// Borrows up to `ncpus` CPUs walking `priority` order (a
    /// pre-computed affinity ordering).
    ///
    /// `last_visit_ts` is an opaque monotonic token from a previous
    /// call (0 for none): candidates whose record changed after the
    /// token are skipped, so two processes hammering the same subset do
    /// not ping-pong a CPU that was just granted or returned.
    pub fn borrow_ncpus_from_subset(
        &self,
        pid: ProcessId,
        ncpus: usize,
        priority: &[usize],
        last_visit_ts: u64,
    ) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            let mut granted = 0usize;
            for &cpuid in priority {
                if granted == ncpus {
                    break;
                }
                if Self::check_cpuid(body, cpuid).is_err() {
                    continue;
                }
                let record = &mut body.entries[cpuid];
                if last_visit_ts != 0 && record.stats_last_ts > last_visit_ts {
                    continue;
                }
                if borrow_one(record, pid, cpuid, now, actions) == Outcome::Success {
                    granted += 1;
                }
            }
            Ok(if granted > 0 { Outcome::Success } else { Outcome::NoUpdate })
        })
    }

    /// Returns a borrowed CPU to its owner (or the next waiter). Called
    /// by the guest; also cancels any pending request of `pid` on the
    /// CPU, which is how a queued acquire is withdrawn.
    pub fn return_cpu(&self, pid: ProcessId, cpuid: usize) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_cpuid(body, cpuid)?;
            Ok(return_one(&mut body.entries[cpuid], pid, cpuid, now, actions))
        })
    }

    /// Returns every CPU of `mask` that `pid` currently guests.
    pub fn return_mask(&self, pid: ProcessId, mask: &CpuSet) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            Self::check_mask(body, mask)?;
            let mut outcome = Outcome::NoUpdate;
            for cpuid in mask.iter() {
                outcome = outcome.merge(return_one(&mut body.entries[cpuid], pid, cpuid, now, actions));
            }
            Ok(outcome)
        })
    }

    /// Returns every foreign CPU `pid` is currently guesting.
    pub fn return_all(&self, pid: ProcessId) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, now, actions| {
            let mut outcome = Outcome::NoUpdate;
            for cpuid in 0..body.system_size as usize {
                let record = &mut body.entries[cpuid];
                if record.guest == pid && record.owner != pid {
                    outcome = outcome.merge(return_one(record, pid, cpuid, now, actions));
                }
            }
            Ok(outcome)
        })
    }

    /// Acknowledges owner reclaims: for every CPU of `borrowed` whose
    /// guest is no longer `pid`, emits the disable that stops the local
    /// threads. `borrowed` is the caller's view of its active loans.
    pub fn return_claimed(&self, pid: ProcessId, borrowed: &CpuSet) -> Result<(Outcome, ActionList), OpError> {
        self.with_locked(|body, _now, actions| {
            Self::check_mask(body, borrowed)?;
            let mut outcome = Outcome::NoUpdate;
            for cpuid in borrowed.iter() {
                let record = &body.entries[cpuid];
                if record.guest != pid && record.owner != pid {
                    actions.disable(pid, cpuid);
                    outcome = outcome.merge(Outcome::Success);
                }
            }
            Ok(outcome)
        })
    }

    /// Whether `pid` may keep running on `cpuid` right now.
    pub fn check_availability(&self, pid: ProcessId, cpuid: usize) -> Result<(), OpError> {
        let (guard, _) = self.lock_repaired()?;
        Self::check_cpuid(&guard, cpuid)?;
        let record = &guard.entries[cpuid];
        if record.guest == pid {
            Ok(())
        } else if record.owner == NO_PROCESS {
            Err(ResourceError::Disabled(cpuid).into())
        } else {
            Err(ResourceError::OwnedElsewhere(cpuid).into())
        }
    }

    /// Whether `pid` is guesting `cpuid` without owning it.
    pub fn is_borrowed(&self, pid: ProcessId, cpuid: usize) -> Result<bool, OpError> {
        let (guard, _) = self.lock_repaired()?;
        Self::check_cpuid(&guard, cpuid)?;
        let record = &guard.entries[cpuid];
        Ok(record.guest == pid && record.owner != pid)
    }

    /// Reconciles ownership with `new_mask` after a mask swap: CPUs
    /// gained become owned by `pid`, CPUs lost are released (with
    /// disables for whoever was running on them).
    pub fn update_ownership(&self, pid: ProcessId, new_mask: &CpuSet) -> Result<ActionList, OpError> {
        let (mut guard, mut actions) = self.lock_repaired()?;
        let now = monotonic_ns();
        Self::check_mask(&guard, new_mask)?;
        let system_size = guard.system_size as usize;
        for cpuid in 0..system_size {
            let record = &mut guard.entries[cpuid];
            if new_mask.contains(cpuid) {
                record.owner = pid;
                if record.guest == NO_PROCESS {
                    record.guest = pid;
                }
                record.sync_state(now);
            } else if record.owner == pid {
                record.owner = NO_PROCESS;
                let _: Vec<ProcessId> = record.requests.drain().collect();
                if record.guest != NO_PROCESS {
                    actions.disable(record.guest, cpuid);
                    record.guest = NO_PROCESS;
                }
                record.sync_state(now);
            }
        }
        drop(guard);
        Ok(actions_take(&mut actions))
    }

    /// Releases ownership of the CPUs in `mask` without touching other
    /// records. Used when a mask update moves CPUs away from a process
    /// before the new owner has claimed them.
    pub fn release_mask(&self, mask: &CpuSet) -> Result<ActionList, OpError> {
        let (mut guard, mut actions) = self.lock_repaired()?;
        let now = monotonic_ns();
        Self::check_mask(&guard, mask)?;
        for cpuid in mask.iter() {
            let record = &mut guard.entries[cpuid];
            record.owner = NO_PROCESS;
            let _: Vec<ProcessId> = record.requests.drain().collect();
            if record.guest != NO_PROCESS {
                actions.disable(record.guest, cpuid);
                record.guest = NO_PROCESS;
            }
            record.sync_state(now);
        }
        drop(guard);
        Ok(actions_take(&mut actions))
    }

    /// The registered owner of `cpuid`, if any.
    pub fn owner_of(&self, cpuid: usize) -> Result<Option<ProcessId>, OpError> {
        let (guard, _) = self.lock_repaired()?;
        Self::check_cpuid(&guard, cpuid)?;
        let owner = guard.entries[cpuid].owner;
        Ok((owner != NO_PROCESS).then_some(owner))
    }

    /// The current guest of `cpuid`, if any.
    pub fn guest_of(&self, cpuid: usize) -> Result<Option<ProcessId>, OpError> {
        let (guard, _) = self.lock_repaired()?;
        Self::check_cpuid(&guard, cpuid)?;
        let guest = guard.entries[cpuid].guest;
        Ok((guest != NO_PROCESS).then_some(guest))
    }

    /// CPUs whose guest slot currently names `pid` (the set the process
    /// may run on right now).
    pub fn guested_cpus(&self, pid: ProcessId) -> Result<CpuSet, OpError> {
        let (guard, _) = self.lock_repaired()?;
        let mut set = CpuSet::new();
        for cpuid in 0..guard.system_size as usize {
            if guard.entries[cpuid].guest == pid {
                set.set(cpuid);
            }
        }
        Ok(set)
    }

    /// CPUs registered to other processes (candidates for free-agent
    /// binding outside the own mask).
    pub fn non_owned_cpus(&self, pid: ProcessId) -> Result<CpuSet, OpError> {
        let (guard, _) = self.lock_repaired()?;
        let mut set = CpuSet::new();
        for cpuid in 0..guard.system_size as usize {
            let owner = guard.entries[cpuid].owner;
            if owner != NO_PROCESS && owner != pid {
                set.set(cpuid);
            }
        }
        Ok(set)
    }

    /// Fraction of the observed lifetime `cpuid` spent in `state`.
    pub fn state_fraction(&self, cpuid: usize, state: CpuState) -> Result<f64, OpError> {
        let (guard, _) = self.lock_repaired()?;
        Self::check_cpuid(&guard, cpuid)?;
        let record = &guard.entries[cpuid];
        let now = monotonic_ns();
        let mut accum = record.stats_accum;
        accum[record.state() as usize] =
            accum[record.state() as usize].saturating_add(now.saturating_sub(record.stats_last_ts));
        let total: u64 = accum.iter().sum();
        if total == 0 {
            return Ok(0.0);
        }
        Ok(accum[state as usize] as f64 / total as f64)
    }

    /// Snapshot of every managed CPU record.
    pub fn snapshot(&self) -> Result<Vec<CpuSnapshot>, OpError> {
        let (guard, _) = self.lock_repaired()?;
        let mut out = Vec::with_capacity(guard.system_size as usize);
        for cpuid in 0..guard.system_size as usize {
            let record = &guard.entries[cpuid];
            out.push(CpuSnapshot {
                cpuid,
                owner: record.owner,
                guest: record.guest,
                state: record.state(),
                waiters: record.requests.iter().map(|r| r.pid).collect(),
            });
        }
        Ok(out)
    }

    fn with_locked<F>(&self, f: F) -> Result<(Outcome, ActionList), OpError>
    where
        F: FnOnce(&mut CpuinfoBody, u64, &mut ActionList) -> Result<Outcome, ResourceError>,
    {
        let (mut guard, mut actions) = self.lock_repaired()?;
        let now = monotonic_ns();
        let outcome = f(&mut guard, now, &mut actions)?;
        drop(guard);
        Ok((outcome, actions_take(&mut actions)))
    }
}

fn actions_take(actions: &mut ActionList) -> ActionList {
    std::mem::take(actions)
}

fn require_owner(record: &CpuRecord, pid: ProcessId, cpuid: usize) -> Result<(), ResourceError> {
    if record.owner == pid {
        Ok(())
    } else if record.owner == NO_PROCESS {
        Err(ResourceError::Disabled(cpuid))
    } else {
        Err(ResourceError::NotOwner(cpuid))
    }
}

fn lend_one(
    record: &mut CpuRecord,
    pid: ProcessId,
    cpuid: usize,
    now: u64,
    actions: &mut ActionList,
) -> Result<Outcome, ResourceError> {
    require_owner(record, pid, cpuid)?;
    if record.guest != pid {
        // Already lent (idle or guested); lending again is a no-op.
        return Ok(Outcome::NoUpdate);
    }
    record.guest = NO_PROCESS;
    record.sync_state(now);
    let _ = record.serve_next_waiter(now, actions, cpuid);
    Ok(Outcome::Success)
}

fn reclaim_one(
    record: &mut CpuRecord,
    pid: ProcessId,
    cpuid: usize,
    now: u64,
    actions: &mut ActionList,
) -> Result<Outcome, ResourceError> {
    require_owner(record, pid, cpuid)?;
    // A pending request of the owner is satisfied by the reclaim itself.
    let _ = record.requests.drop_pid(pid);
    if record.guest == pid {
        return Ok(Outcome::NoUpdate);
    }
    if record.guest == NO_PROCESS {
        record.guest = pid;
        record.sync_state(now);
        actions.enable(pid, cpuid);
        return Ok(Outcome::Success);
    }
    // Preempt the borrower. It keeps running until it observes the
    // disable; the table already names the owner as guest.
    let victim = record.guest;
    record.guest = pid;
    record.sync_state(now);
    actions.disable(victim, cpuid);
    actions.enable(pid, cpuid);
    Ok(Outcome::Noted)
}

fn acquire_one(
    record: &mut CpuRecord,
    pid: ProcessId,
    cpuid: usize,
    now: u64,
    actions: &mut ActionList,
) -> Result<Outcome, ResourceError> {
    if record.owner == pid {
        return reclaim_one(record, pid, cpuid, now, actions);
    }
    if record.owner == NO_PROCESS {
        return Err(ResourceError::Disabled(cpuid));
    }
    if record.guest == pid {
        return Ok(Outcome::NoUpdate);
    }
    if record.guest == NO_PROCESS {
        record.guest = pid;
        record.sync_state(now);
        let _ = record.requests.drop_pid(pid);
        actions.enable(pid, cpuid);
        return Ok(Outcome::Success);
    }
    // Guested by a third party: only the owner may preempt, so queue up.
    match record.requests.push(pid, 1) {
        PushResult::Queued | PushResult::Merged => Ok(Outcome::Noted),
        PushResult::Full => Err(ResourceError::QueueFull(cpuid)),
    }
}

enum Grant {
    Granted,
    Busy,
    Unavailable,
}

/// Immediate-grant part of an acquire: no queueing, reports whether the
/// CPU could be queued on instead.
fn try_grant(
    record: &mut CpuRecord,
    pid: ProcessId,
    cpuid: usize,
    now: u64,
    actions: &mut ActionList,
) -> Grant {
    if record.owner == NO_PROCESS || record.guest == pid {
        return Grant::Unavailable;
    }
    if record.guest == NO_PROCESS {
        record.guest = pid;
        record.sync_state(now);
        let _ = record.requests.drop_pid(pid);
        actions.enable(pid, cpuid);
        return Grant::Granted;
    }
    if record.owner == pid {
        // Owned but guested by someone else: reclaim preempts.
        let victim = record.guest;
        record.guest = pid;
        record.sync_state(now);
        actions.disable(victim, cpuid);
        actions.enable(pid, cpuid);
        return Grant::Granted;
    }
    Grant::Busy
}

fn borrow_one(
    record: &mut CpuRecord,
    pid: ProcessId,
    cpuid: usize,
    now: u64,
    actions: &mut ActionList,
) -> Outcome {
    if record.owner == NO_PROCESS || record.guest != NO_PROCESS {
        return Outcome::NoUpdate;
    }
    record.guest = pid;
    record.sync_state(now);
    let _ = record.requests.drop_pid(pid);
    actions.enable(pid, cpuid);
    Outcome::Success
}

fn return_one(
    record: &mut CpuRecord,
    pid: ProcessId,
    cpuid: usize,
    now: u64,
    actions: &mut ActionList,
) -> Outcome {
    // Withdraw any pending request: returning is also how a queued
    // acquire is cancelled.
    let withdrew = record.requests.drop_pid(pid);
    if record.owner == pid || record.guest != pid {
        return if withdrew { Outcome::Success } else { Outcome::NoUpdate };
    }
    record.guest = NO_PROCESS;
    record.sync_state(now);
    actions.disable(pid, cpuid);
    let _ = record.serve_next_waiter(now, actions, cpuid);
    Outcome::Success
}

/// Removes every trace of dead processes. Runs after the robust mutex
/// reported a dead holder; `alive` decides which pids survive.
fn purge_dead(body: &mut CpuinfoBody, alive: LivenessProbe, now: u64, actions: &mut ActionList) {
    let system_size = body.system_size as usize;
    for cpuid in 0..system_size {
        let record = &mut body.entries[cpuid];

        let dead_waiters: Vec<ProcessId> = record
            .requests
            .iter()
            .map(|r| r.pid)
            .filter(|&p| !alive(p))
            .collect();
        for pid in dead_waiters {
            let _ = record.requests.drop_pid(pid);
        }

        if record.owner != NO_PROCESS && !alive(record.owner) {
            tracing::warn!(cpuid, owner = record.owner, "releasing CPU of dead owner");
            record.owner = NO_PROCESS;
            let _: Vec<ProcessId> = record.requests.drain().collect();
            if record.guest != NO_PROCESS {
                if alive(record.guest) {
                    // The CPU ceased to exist as a managed resource; a
                    // surviving guest must vacate.
                    actions.disable(record.guest, cpuid);
                }
                record.guest = NO_PROCESS;
            }
            record.sync_state(now);
            continue;
        }

        if record.guest != NO_PROCESS && !alive(record.guest) {
            tracing::warn!(cpuid, guest = record.guest, "evicting dead guest");
            record.guest = NO_PROCESS;
            record.sync_state(now);
            let _ = record.serve_next_waiter(now, actions, cpuid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PID_A: ProcessId = 111;
    const PID_B: ProcessId = 222;
    const PID_C: ProcessId = 333;

    static KEY_SEQ: AtomicU32 = AtomicU32::new(0);

    fn table() -> Cpuinfo {
        let key = format!(
            "cpuinfo-ut-{}-{}",
            std::process::id(),
            KEY_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let table = Cpuinfo::create_or_attach(&key, 4).expect("create table");
        let _ = table
            .register(PID_A, &CpuSet::first_n(2), false)
            .expect("register A");
        let _ = table
            .register(PID_B, &"2-3".parse().expect("mask"), false)
            .expect("register B");
        table
    }

    fn state_of(table: &Cpuinfo, cpuid: usize) -> (ProcessId, ProcessId, CpuState) {
        let snap = &table.snapshot().expect("snapshot")[cpuid];
        (snap.owner, snap.guest, snap.state)
    }

    #[test]
    fn register_rejects_foreign_cpus_without_steal() {
        let table = table();
        let err = table
            .register(PID_C, &CpuSet::single(1), false)
            .expect_err("must refuse");
        assert!(matches!(err, OpError::Refused(ResourceError::OwnedElsewhere(1))));
        // Rollback: nothing changed.
        assert_eq!(state_of(&table, 1), (PID_A, PID_A, CpuState::Busy));
    }

    #[test]
    fn register_with_steal_reassigns_ownership() {
        let table = table();
        let actions = table
            .register(PID_C, &CpuSet::single(1), true)
            .expect("steal");
        assert!(actions.is_empty());
        // The previous owner keeps running as a guest until evicted.
        assert_eq!(state_of(&table, 1), (PID_C, PID_A, CpuState::Lent));
    }

    #[test]
    fn lend_then_borrow_no_contention() {
        let table = table();
        let (outcome, actions) = table.lend_cpu(PID_A, 1).expect("lend");
        assert_eq!(outcome, Outcome::Success);
        assert!(actions.is_empty());
        assert_eq!(state_of(&table, 1), (PID_A, NO_PROCESS, CpuState::Lent));

        let (outcome, actions) = table.borrow_cpu(PID_B, 1).expect("borrow");
        assert_eq!(outcome, Outcome::Success);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(items, vec![Action::Enable { pid: PID_B, cpuid: 1 }]);
        assert_eq!(state_of(&table, 1), (PID_A, PID_B, CpuState::Lent));
    }

    #[test]
    fn reclaim_preempts_guest() {
        let table = table();
        let _ = table.lend_cpu(PID_A, 1).expect("lend");
        let _ = table.borrow_cpu(PID_B, 1).expect("borrow");

        let (outcome, actions) = table.reclaim_cpu(PID_A, 1).expect("reclaim");
        assert_eq!(outcome, Outcome::Noted);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(
            items,
            vec![
                Action::Disable { pid: PID_B, cpuid: 1 },
                Action::Enable { pid: PID_A, cpuid: 1 },
            ]
        );
        assert_eq!(state_of(&table, 1), (PID_A, PID_A, CpuState::Busy));
    }

    #[test]
    fn queued_acquire_served_on_lend() {
        let table = table();
        let (outcome, _) = table.reclaim_cpu(PID_A, 1).expect("reclaim own busy");
        assert_eq!(outcome, Outcome::NoUpdate);

        let (outcome, actions) = table.acquire_cpu(PID_B, 1).expect("acquire");
        assert_eq!(outcome, Outcome::Noted);
        assert!(actions.is_empty());
        assert_eq!(table.snapshot().expect("snapshot")[1].waiters, vec![PID_B]);

        let (outcome, actions) = table.lend_cpu(PID_A, 1).expect("lend");
        assert_eq!(outcome, Outcome::Success);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(items, vec![Action::Enable { pid: PID_B, cpuid: 1 }]);
        assert_eq!(state_of(&table, 1), (PID_A, PID_B, CpuState::Lent));
        assert!(table.snapshot().expect("snapshot")[1].waiters.is_empty());
    }

    #[test]
    fn borrow_subset_respects_priority_order() {
        let key = format!(
            "cpuinfo-ut-{}-{}",
            std::process::id(),
            KEY_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let table = Cpuinfo::create_or_attach(&key, 4).expect("create");
        table
            .register(PID_A, &CpuSet::single(0), false)
            .expect("register A");
        table
            .register(PID_B, &"1-3".parse().expect("mask"), false)
            .expect("register B");
        let (outcome, _) = table
            .lend_mask(PID_B, &"1-3".parse().expect("mask"))
            .expect("lend all");
        assert_eq!(outcome, Outcome::Success);

        let (outcome, actions) = table
            .borrow_ncpus_from_subset(PID_A, 2, &[1, 2, 3], 0)
            .expect("borrow subset");
        assert_eq!(outcome, Outcome::Success);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(
            items,
            vec![
                Action::Enable { pid: PID_A, cpuid: 1 },
                Action::Enable { pid: PID_A, cpuid: 2 },
            ]
        );
        assert_eq!(state_of(&table, 3), (PID_B, NO_PROCESS, CpuState::Lent));
    }

    #[test]
    fn lend_reclaim_round_trip_restores_busy() {
        let table = table();
        let (_, _) = table.lend_cpu(PID_A, 0).expect("lend");
        let (outcome, actions) = table.reclaim_cpu(PID_A, 0).expect("reclaim");
        assert_eq!(outcome, Outcome::Success);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(items, vec![Action::Enable { pid: PID_A, cpuid: 0 }]);
        assert_eq!(state_of(&table, 0), (PID_A, PID_A, CpuState::Busy));
    }

    #[test]
    fn acquire_return_round_trip_restores_record() {
        let table = table();
        let _ = table.lend_cpu(PID_A, 1).expect("lend");
        let before = table.snapshot().expect("snapshot")[1].clone();

        let (outcome, _) = table.acquire_cpu(PID_B, 1).expect("acquire");
        assert_eq!(outcome, Outcome::Success);
        let (outcome, actions) = table.return_cpu(PID_B, 1).expect("return");
        assert_eq!(outcome, Outcome::Success);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(items, vec![Action::Disable { pid: PID_B, cpuid: 1 }]);

        let after = table.snapshot().expect("snapshot")[1].clone();
        assert_eq!(before, after);
    }

    #[test]
    fn full_queue_rejects_further_acquires() {
        let key = format!(
            "cpuinfo-ut-{}-{}",
            std::process::id(),
            KEY_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let table = Cpuinfo::create_or_attach(&key, 1).expect("create");
        table
            .register(PID_A, &CpuSet::single(0), false)
            .expect("register");
        // Fill the queue with distinct foreign pids.
        for i in 0..crate::requests::REQUEST_QUEUE_CAPACITY {
            let pid = 1000 + i as ProcessId;
            let (outcome, _) = table.acquire_cpu(pid, 0).expect("queued acquire");
            assert_eq!(outcome, Outcome::Noted);
        }
        let before = table.snapshot().expect("snapshot");
        let err = table.acquire_cpu(9999, 0).expect_err("queue full");
        assert!(matches!(err, OpError::Refused(ResourceError::QueueFull(0))));
        assert_eq!(before, table.snapshot().expect("snapshot"));
    }

    #[test]
    fn deregister_disables_active_guests_and_serves_waiters() {
        let table = table();
        // B borrows A's CPU 1; C queues behind it.
        let _ = table.lend_cpu(PID_A, 1).expect("lend");
        let _ = table.borrow_cpu(PID_B, 1).expect("borrow");

        // A also borrows B's CPU 2 to verify guest release on deregister.
        let _ = table.lend_cpu(PID_B, 2).expect("lend");
        let _ = table.borrow_cpu(PID_A, 2).expect("borrow");
        let (outcome, _) = table.acquire_cpu(PID_C, 2).expect("queue");
        assert_eq!(outcome, Outcome::Noted);

        let actions = table.deregister(PID_A).expect("deregister");
        let items: Vec<_> = actions.into_iter().collect();
        // Exactly one disable for the guest of each owned CPU, and the
        // waiter on the returned borrowed CPU gets enabled.
        assert!(items.contains(&Action::Disable { pid: PID_B, cpuid: 1 }));
        assert!(items.contains(&Action::Enable { pid: PID_C, cpuid: 2 }));
        assert_eq!(
            items
                .iter()
                .filter(|a| matches!(a, Action::Disable { pid, .. } if *pid == PID_B))
                .count(),
            1
        );

        assert_eq!(state_of(&table, 0), (NO_PROCESS, NO_PROCESS, CpuState::Disabled));
        assert_eq!(state_of(&table, 1), (NO_PROCESS, NO_PROCESS, CpuState::Disabled));
        assert_eq!(state_of(&table, 2), (PID_B, PID_C, CpuState::Lent));
    }

    #[test]
    fn owner_request_served_before_fifo() {
        let table = table();
        // CPU 2 belongs to B, lend it to A.
        let _ = table.lend_cpu(PID_B, 2).expect("lend");
        let _ = table.borrow_cpu(PID_A, 2).expect("borrow");
        // C queues, then the owner queues via acquire on its own CPU.
        let (outcome, _) = table.acquire_cpu(PID_C, 2).expect("queue C");
        assert_eq!(outcome, Outcome::Noted);
        let (outcome, actions) = table.acquire_cpu(PID_B, 2).expect("owner acquire");
        // Owner acquire is a reclaim: immediate preemption, not a queue.
        assert_eq!(outcome, Outcome::Noted);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(
            items,
            vec![
                Action::Disable { pid: PID_A, cpuid: 2 },
                Action::Enable { pid: PID_B, cpuid: 2 },
            ]
        );
        // C is still waiting for the next lend.
        assert_eq!(table.snapshot().expect("snapshot")[2].waiters, vec![PID_C]);
    }

    #[test]
    fn return_withdraws_pending_request() {
        let table = table();
        let (outcome, _) = table.acquire_cpu(PID_B, 0).expect("queue");
        assert_eq!(outcome, Outcome::Noted);
        assert_eq!(table.snapshot().expect("snapshot")[0].waiters, vec![PID_B]);
        let (outcome, actions) = table.return_cpu(PID_B, 0).expect("withdraw");
        assert_eq!(outcome, Outcome::Success);
        assert!(actions.is_empty());
        assert!(table.snapshot().expect("snapshot")[0].waiters.is_empty());
    }

    #[test]
    fn check_availability_tracks_reclaim() {
        let table = table();
        let _ = table.lend_cpu(PID_A, 1).expect("lend");
        let _ = table.borrow_cpu(PID_B, 1).expect("borrow");
        assert!(table.check_availability(PID_B, 1).is_ok());

        let _ = table.reclaim_cpu(PID_A, 1).expect("reclaim");
        let err = table.check_availability(PID_B, 1).expect_err("reclaimed");
        assert!(matches!(err, OpError::Refused(ResourceError::OwnedElsewhere(1))));

        let (outcome, actions) = table
            .return_claimed(PID_B, &CpuSet::single(1))
            .expect("return claimed");
        assert_eq!(outcome, Outcome::Success);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(items, vec![Action::Disable { pid: PID_B, cpuid: 1 }]);
    }

    #[test]
    fn update_ownership_moves_cpus() {
        let table = table();
        // A's mask becomes {0, 2}; CPU 2 currently belongs to B.
        let _ = table.release_mask(&CpuSet::single(2)).expect("release");
        let actions = table
            .update_ownership(PID_A, &"0,2".parse().expect("mask"))
            .expect("update");
        let items: Vec<_> = actions.into_iter().collect();
        // CPU 1 is dropped: A itself was the guest there.
        assert!(items.contains(&Action::Disable { pid: PID_A, cpuid: 1 }));
        assert_eq!(state_of(&table, 1), (NO_PROCESS, NO_PROCESS, CpuState::Disabled));
        assert_eq!(state_of(&table, 2), (PID_A, PID_A, CpuState::Busy));
    }

    #[test]
    fn purge_dead_releases_everything_of_a_dead_pid() {
        let table = table();
        let _ = table.lend_cpu(PID_A, 1).expect("lend");
        let _ = table.borrow_cpu(PID_B, 1).expect("borrow");

        // Simulate recovery with B dead: its guest slot and requests go.
        let mut guard = table.segment.lock().expect("lock");
        let mut actions = ActionList::new();
        purge_dead(&mut guard, |pid| pid != PID_B, monotonic_ns(), &mut actions);
        drop(guard);

        assert_eq!(state_of(&table, 1), (PID_A, NO_PROCESS, CpuState::Lent));
        // B's owned CPUs are released and disabled.
        assert_eq!(state_of(&table, 2), (NO_PROCESS, NO_PROCESS, CpuState::Disabled));
        assert_eq!(state_of(&table, 3), (NO_PROCESS, NO_PROCESS, CpuState::Disabled));
    }

    #[test]
    fn oversized_system_size_is_refused() {
        let key = format!(
            "cpuinfo-ut-{}-{}",
            std::process::id(),
            KEY_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let err = Cpuinfo::create_or_attach(&key, MAX_CPUS as u32 + 1);
        assert!(matches!(err, Err(ShmemError::LayoutMismatch { .. })));
        // Nothing was created: attaching afterwards still fails.
        assert!(matches!(
            Cpuinfo::attach_existing(&key),
            Err(ShmemError::SegmentMissing(_))
        ));
    }

    #[test]
    fn acquire_of_an_ownerless_cpu_is_refused() {
        let key = format!(
            "cpuinfo-ut-{}-{}",
            std::process::id(),
            KEY_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let table = Cpuinfo::create_or_attach(&key, 2).expect("create");
        let _ = table
            .register(PID_A, &CpuSet::single(0), false)
            .expect("register");
        let err = table.acquire_cpu(PID_A, 1).expect_err("no owner");
        assert!(matches!(err, OpError::Refused(ResourceError::Disabled(1))));
        // Borrow is the opportunistic form: same situation, quiet no-op.
        let (outcome, _) = table.borrow_cpu(PID_A, 1).expect("borrow");
        assert_eq!(outcome, Outcome::NoUpdate);
    }

    #[test]
    fn deregister_rejects_queued_requests_of_the_owner() {
        let table = table();
        // C waits for one of A's CPUs; A leaves.
        let (outcome, _) = table.acquire_cpu(PID_C, 0).expect("queue");
        assert_eq!(outcome, Outcome::Noted);
        let _ = table.deregister(PID_A).expect("deregister");
        // The CPU is unmanaged and the queue is gone with it.
        assert_eq!(state_of(&table, 0), (NO_PROCESS, NO_PROCESS, CpuState::Disabled));
        assert!(table.snapshot().expect("snapshot")[0].waiters.is_empty());
    }

    #[test]
    fn lend_mask_fails_atomically_on_foreign_cpu() {
        let table = table();
        let before = table.snapshot().expect("snapshot");
        // CPU 2 belongs to B; the whole mask must be refused.
        let err = table
            .lend_mask(PID_A, &"0,2".parse().expect("mask"))
            .expect_err("foreign cpu");
        assert!(matches!(err, OpError::Refused(ResourceError::NotOwner(2))));
        assert_eq!(before, table.snapshot().expect("snapshot"));
    }

    #[test]
    fn acquire_mask_is_atomic_when_a_queue_is_full() {
        let key = format!(
            "cpuinfo-ut-{}-{}",
            std::process::id(),
            KEY_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let table = Cpuinfo::create_or_attach(&key, 2).expect("create");
        let _ = table
            .register(PID_A, &CpuSet::first_n(2), false)
            .expect("register");
        for i in 0..crate::requests::REQUEST_QUEUE_CAPACITY {
            let pid = 1000 + i as ProcessId;
            let (outcome, _) = table.acquire_cpu(pid, 0).expect("queued");
            assert_eq!(outcome, Outcome::Noted);
        }
        let before = table.snapshot().expect("snapshot");
        let err = table
            .acquire_mask(PID_C, &CpuSet::first_n(2))
            .expect_err("queue full on cpu 0");
        assert!(matches!(err, OpError::Refused(ResourceError::QueueFull(0))));
        // Validation failed before any mutation: no entry of C anywhere.
        assert_eq!(before, table.snapshot().expect("snapshot"));
    }

    #[test]
    fn lend_cpus_surrenders_highest_ids_first() {
        let table = table();
        let (outcome, _) = table.lend_cpus(PID_A, 1).expect("lend one");
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(state_of(&table, 1), (PID_A, NO_PROCESS, CpuState::Lent));
        assert_eq!(state_of(&table, 0), (PID_A, PID_A, CpuState::Busy));
    }

    #[test]
    fn reclaim_cpus_takes_back_the_requested_count() {
        let table = table();
        let (_, _) = table.lend_mask(PID_A, &CpuSet::first_n(2)).expect("lend");
        let (outcome, actions) = table.reclaim_cpus(PID_A, 1).expect("reclaim one");
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(actions.len(), 1);
        assert_eq!(state_of(&table, 0), (PID_A, PID_A, CpuState::Busy));
        assert_eq!(state_of(&table, 1), (PID_A, NO_PROCESS, CpuState::Lent));
    }

    #[test]
    fn borrow_token_skips_recently_changed_cpus() {
        let table = table();
        let _ = table.lend_cpu(PID_A, 0).expect("lend");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let token = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        // CPU 1 changes hands after the token was taken.
        let _ = table.lend_cpu(PID_A, 1).expect("lend");

        let (outcome, actions) = table
            .borrow_ncpus_from_subset(PID_B, 2, &[1, 0], token)
            .expect("borrow");
        // Only the candidate untouched since the token is granted.
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(
            actions.into_iter().collect::<Vec<_>>(),
            vec![Action::Enable { pid: PID_B, cpuid: 0 }]
        );
    }

    #[test]
    fn state_fractions_sum_to_one() {
        let table = table();
        let _ = table.lend_cpu(PID_A, 0).expect("lend");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let _ = table.reclaim_cpu(PID_A, 0).expect("reclaim");

        let total: f64 = [CpuState::Disabled, CpuState::Lent, CpuState::Busy]
            .into_iter()
            .map(|s| table.state_fraction(0, s).expect("fraction"))
            .sum();
        assert!((total - 1.0).abs() < 1e-6, "fractions sum to {total}");
        assert!(table.state_fraction(0, CpuState::Lent).expect("fraction") > 0.0);
    }
}
