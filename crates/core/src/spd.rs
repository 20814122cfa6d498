// SPDX-License-Identifier: Apache-2.0

//! Sub-process descriptor: the per-process entry point of the manager.
//!
//! A descriptor ties one pid to the shared tables. All state mutations
//! follow the same shape: take the table handles, run the operation
//! under the segment mutex, release everything, then execute the
//! returned action list, so callbacks always run lock-free and may
//! re-enter the descriptor.
//!
//! Several descriptors may coexist in one address space (each with its
//! own synthesized pid); they interact only through the shared tables.

use crate::callbacks::CallbackRegistry;
use crate::error::Error;
use crate::helper::Helper;
use crate::priority;
use dynres_config::{DebugOpts, InteractionMode, Options};
use dynres_shmem::clock::monotonic_ns;
use dynres_shmem::cpuinfo::Cpuinfo;
use dynres_shmem::procinfo::Procinfo;
use dynres_shmem::{Action, ActionList, CpuSet, Outcome, ProcessId, MAX_CPUS};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Result of adopting a pending mask update via [`SubProcess::poll_drom`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskChange {
    /// CPUs gained.
    pub added: CpuSet,
    /// CPUs lost.
    pub removed: CpuSet,
    /// The full new mask.
    pub new_mask: CpuSet,
}

struct Tables {
    cpuinfo: Cpuinfo,
    procinfo: Procinfo,
}

struct SpdState {
    process_mask: CpuSet,
    active_mask: CpuSet,
    borrowed: CpuSet,
    priority: Vec<usize>,
    last_borrow_ts: u64,
    system_size: usize,
}

/// Per-process descriptor of one node-local manager instance.
pub struct SubProcess {
    pid: ProcessId,
    options: Options,
    tables: Mutex<Option<Tables>>,
    state: RwLock<SpdState>,
    callbacks: RwLock<CallbackRegistry>,
    helper: Mutex<Option<Helper>>,
}

static SPID_SEED: AtomicI32 = AtomicI32::new(0);

/// Synthesizes a unique id for an additional descriptor in this address
/// space. The OS pid stays in the low digits so operators can still map
/// ids to processes.
#[must_use]
pub fn next_subprocess_id() -> ProcessId {
    const STRIDE: i32 = 100_000;
    (SPID_SEED.fetch_add(1, Ordering::Relaxed) + 1) * STRIDE + std::process::id() as i32
}

impl SubProcess {
    /// Initializes a descriptor for `pid`, registering `mask` (or the
    /// current CPU affinity when `None`) in the shared tables.
    ///
    /// If the pid was pre-registered by a launcher, the pre-registered
    /// mask wins over `mask` and is the one returned by
    /// [`process_mask`](SubProcess::process_mask).
    pub fn init(pid: ProcessId, mask: Option<CpuSet>, options: Options) -> Result<Arc<Self>, Error> {
        let requested = match mask {
            Some(m) => m,
            None => current_affinity()?,
        };
        let system_size = resolve_system_size(&options, &requested);
        let key = options.segment_key();

        let cpuinfo = Cpuinfo::create_or_attach(&key, system_size as u32)?;
        let procinfo = Procinfo::create_or_attach(&key, system_size as u32, options.shm_size_multiplier)?;

        let adopted = procinfo.register(pid, &requested, false)?;
        if let Err(e) = cpuinfo.register(pid, &adopted, false) {
            // Keep the tables consistent: a half-registered process must
            // not survive.
            let _ = procinfo.deregister(pid, false);
            return Err(e.into());
        }

        let priority = priority::compute(system_size, &adopted, options.priority);
        let spd = Arc::new(SubProcess {
            pid,
            options: options.clone(),
            tables: Mutex::new(Some(Tables { cpuinfo, procinfo })),
            state: RwLock::new(SpdState {
                process_mask: adopted,
                active_mask: adopted,
                borrowed: CpuSet::new(),
                priority,
                last_borrow_ts: 0,
                system_size,
            }),
            callbacks: RwLock::new(CallbackRegistry::default()),
            helper: Mutex::new(None),
        });

        tracing::info!(
            pid,
            mask = %adopted,
            policy = %options.policy,
            mode = %options.mode,
            "resource manager initialized"
        );

        if options.mode == InteractionMode::Async {
            let helper = Helper::spawn(Arc::downgrade(&spd), options.poll_interval())?;
            *spd.helper.lock() = Some(helper);
        }
        Ok(spd)
    }

    /// Deregisters the pid from both tables and detaches. Pending
    /// requests of this pid are dropped everywhere; active guests of its
    /// CPUs receive disables.
    pub fn finalize(&self) -> Result<(), Error> {
        if let Some(helper) = self.helper.lock().take() {
            helper.stop();
        }
        let tables = self.tables.lock().take().ok_or(Error::NotInitialized)?;
        let actions = tables.cpuinfo.deregister(self.pid)?;
        let return_stolen = self.options.debug_opts.contains(DebugOpts::RETURN_STOLEN);
        tables.procinfo.deregister(self.pid, return_stolen)?;
        tables.cpuinfo.detach()?;
        tables.procinfo.detach()?;
        self.dispatch(actions);
        tracing::info!(pid = self.pid, "resource manager finalized");
        Ok(())
    }

    /// The pid this descriptor registered.
    #[must_use]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The options snapshot taken at init.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The currently registered mask.
    #[must_use]
    pub fn process_mask(&self) -> CpuSet {
        self.state.read().process_mask
    }

    /// CPUs managed by the attached instance.
    #[must_use]
    pub fn system_size(&self) -> usize {
        self.state.read().system_size
    }

    /// CPUs this process is currently allowed to run on.
    #[must_use]
    pub fn active_mask(&self) -> CpuSet {
        self.state.read().active_mask
    }

    /// Foreign CPUs currently on loan to this process.
    #[must_use]
    pub fn borrowed_cpus(&self) -> CpuSet {
        self.state.read().borrowed
    }

    /// Edits the callback registry.
    pub fn set_callbacks(&self, f: impl FnOnce(&mut CallbackRegistry)) {
        f(&mut self.callbacks.write());
    }

    /* Lend */

    /// Lends every in-use owned CPU.
    pub fn lend(&self) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.lend_all(self.pid)?))
    }

    /// Lends one owned CPU.
    pub fn lend_cpu(&self, cpuid: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.lend_cpu(self.pid, cpuid)?))
    }

    /// Lends up to `ncpus` owned CPUs.
    pub fn lend_cpus(&self, ncpus: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.lend_cpus(self.pid, ncpus)?))
    }

    /// Lends every owned CPU in `mask`.
    pub fn lend_mask(&self, mask: &CpuSet) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.lend_mask(self.pid, mask)?))
    }

    /* Reclaim */

    /// Reclaims every lent owned CPU.
    pub fn reclaim(&self) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.reclaim_all(self.pid)?))
    }

    /// Reclaims one owned CPU, preempting any guest.
    pub fn reclaim_cpu(&self, cpuid: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.reclaim_cpu(self.pid, cpuid)?))
    }

    /// Reclaims up to `ncpus` lent owned CPUs.
    pub fn reclaim_cpus(&self, ncpus: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.reclaim_cpus(self.pid, ncpus)?))
    }

    /// Reclaims every owned CPU in `mask`.
    pub fn reclaim_mask(&self, mask: &CpuSet) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.reclaim_mask(self.pid, mask)?))
    }

    /* Acquire */

    /// Acquires one CPU: reclaim when owned, immediate grant when free,
    /// queued request otherwise.
    pub fn acquire_cpu(&self, cpuid: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.acquire_cpu(self.pid, cpuid)?))
    }

    /// Acquires up to `ncpus` CPUs following the priority order.
    pub fn acquire_cpus(&self, ncpus: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        let order = self.state.read().priority.clone();
        self.run(|t| Ok(t.cpuinfo.acquire_cpus(self.pid, ncpus, &order)?))
    }

    /// Acquires up to `ncpus` CPUs, restricted to candidates in `mask`.
    pub fn acquire_cpus_in_mask(&self, ncpus: usize, mask: &CpuSet) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        let order: Vec<usize> = {
            let state = self.state.read();
            state.priority.iter().copied().filter(|c| mask.contains(*c)).collect()
        };
        self.run(|t| Ok(t.cpuinfo.acquire_cpus(self.pid, ncpus, &order)?))
    }

    /// Acquires every CPU in `mask`.
    pub fn acquire_mask(&self, mask: &CpuSet) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.acquire_mask(self.pid, mask)?))
    }

    /* Borrow */

    /// Borrows as many idle CPUs as possible.
    pub fn borrow(&self) -> Result<Outcome, Error> {
        let size = self.state.read().system_size;
        self.borrow_cpus(size)
    }

    /// Borrows one specific CPU if idle.
    pub fn borrow_cpu(&self, cpuid: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.borrow_cpu(self.pid, cpuid)?))
    }

    /// Borrows up to `ncpus` idle CPUs following the priority order.
    /// Candidates that changed hands since the previous borrow call are
    /// skipped to avoid ping-pong between hungry processes.
    pub fn borrow_cpus(&self, ncpus: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        let (order, token) = {
            let state = self.state.read();
            (state.priority.clone(), state.last_borrow_ts)
        };
        let outcome = self.run(|t| Ok(t.cpuinfo.borrow_ncpus_from_subset(self.pid, ncpus, &order, token)?))?;
        self.state.write().last_borrow_ts = monotonic_ns();
        Ok(outcome)
    }

    /// Borrows every idle CPU in `mask`.
    pub fn borrow_mask(&self, mask: &CpuSet) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.borrow_mask(self.pid, mask)?))
    }

    /* Return */

    /// Returns one borrowed CPU (or withdraws a queued request for it).
    pub fn return_cpu(&self, cpuid: usize) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.return_cpu(self.pid, cpuid)?))
    }

    /// Returns every borrowed CPU in `mask`.
    pub fn return_mask(&self, mask: &CpuSet) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.return_mask(self.pid, mask)?))
    }

    /// Returns every borrowed CPU.
    pub fn return_all(&self) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        self.run(|t| Ok(t.cpuinfo.return_all(self.pid)?))
    }

    /// Acknowledges owner reclaims of previously borrowed CPUs, running
    /// the local disables for each.
    pub fn return_claimed(&self) -> Result<Outcome, Error> {
        self.ensure_policy()?;
        let borrowed = self.state.read().borrowed;
        if borrowed.is_empty() {
            return Ok(Outcome::NoUpdate);
        }
        self.run(|t| Ok(t.cpuinfo.return_claimed(self.pid, &borrowed)?))
    }

    /// CPUs registered to other processes, candidates for binding
    /// helper threads outside the own mask.
    pub fn non_owned_cpus(&self) -> Result<CpuSet, Error> {
        let guard = self.tables.lock();
        let tables = guard.as_ref().ok_or(Error::NotInitialized)?;
        Ok(tables.cpuinfo.non_owned_cpus(self.pid)?)
    }

    /// Whether this process may keep running on `cpuid` right now.
    pub fn check_cpu_availability(&self, cpuid: usize) -> Result<(), Error> {
        let guard = self.tables.lock();
        let tables = guard.as_ref().ok_or(Error::NotInitialized)?;
        Ok(tables.cpuinfo.check_availability(self.pid, cpuid)?)
    }

    /* DROM */

    /// Adopts a pending mask update, reconciling CPU ownership and
    /// running the mask-change callback. `Ok(None)` when clean.
    pub fn poll_drom(&self) -> Result<Option<MaskChange>, Error> {
        if !self.options.drom {
            return Err(Error::Disabled("drom"));
        }
        let polled = {
            let guard = self.tables.lock();
            let tables = guard.as_ref().ok_or(Error::NotInitialized)?;
            match tables.procinfo.poll(self.pid)? {
                None => None,
                Some(swap) => {
                    let mut actions = swap.actions.clone();
                    actions.append(tables.cpuinfo.update_ownership(self.pid, &swap.new_mask)?);
                    // Gained CPUs whose guest slot was free are usable
                    // immediately.
                    let mut active_added = CpuSet::new();
                    for cpuid in swap.added.iter() {
                        if tables.cpuinfo.guest_of(cpuid)? == Some(self.pid) {
                            active_added.set(cpuid);
                        }
                    }
                    Some((swap, actions, active_added))
                }
            }
        };
        let Some((swap, actions, active_added)) = polled else {
            return Ok(None);
        };

        {
            let mut state = self.state.write();
            state.process_mask = swap.new_mask;
            state.priority = priority::compute(state.system_size, &swap.new_mask, self.options.priority);
            state.active_mask = state.active_mask.difference(&swap.removed) | active_added;
            state.borrowed = state.borrowed.difference(&swap.new_mask);
        }
        self.dispatch(actions);
        Ok(Some(MaskChange {
            added: swap.added,
            removed: swap.removed,
            new_mask: swap.new_mask,
        }))
    }

    /* Stats */

    /// Adds consumed CPU time to this process's usage counters.
    pub fn add_cpu_usage(&self, delta_ns: u64) -> Result<(), Error> {
        let guard = self.tables.lock();
        let tables = guard.as_ref().ok_or(Error::NotInitialized)?;
        Ok(tables.procinfo.add_cpu_usage(self.pid, delta_ns)?)
    }

    /// Accumulated CPU time of this process, nanoseconds.
    pub fn cpu_usage(&self) -> Result<u64, Error> {
        let guard = self.tables.lock();
        let tables = guard.as_ref().ok_or(Error::NotInitialized)?;
        Ok(tables.procinfo.cpu_usage(self.pid)?)
    }

    /* Internals */

    fn ensure_policy(&self) -> Result<(), Error> {
        if self.options.policy.is_enabled() {
            Ok(())
        } else {
            Err(Error::Disabled("policy"))
        }
    }

    /// Runs a table operation, silently resynchronizes the local view of
    /// usable CPUs (a voluntary lend produces no self-action, so the
    /// active set cannot be derived from the action list alone), and
    /// then executes the action list with no lock held.
    fn run(
        &self,
        op: impl FnOnce(&Tables) -> Result<(Outcome, ActionList), Error>,
    ) -> Result<Outcome, Error> {
        let (outcome, actions, usable) = {
            let guard = self.tables.lock();
            let tables = guard.as_ref().ok_or(Error::NotInitialized)?;
            let (outcome, actions) = op(tables)?;
            let usable = tables.cpuinfo.guested_cpus(self.pid)?;
            (outcome, actions, usable)
        };
        {
            let mut state = self.state.write();
            state.active_mask = usable;
            state.borrowed = usable.difference(&state.process_mask);
        }
        self.dispatch(actions);
        Ok(outcome)
    }

    /// Executes an action list: own items through callbacks, foreign
    /// items are observed by their targets (next call, or their helper
    /// thread in async mode).
    fn dispatch(&self, actions: ActionList) {
        for action in actions {
            if action.target() == self.pid {
                self.apply_local(action);
            } else {
                tracing::trace!(?action, "action for remote process");
            }
        }
    }

    fn apply_local(&self, action: Action) {
        match action {
            Action::Enable { cpuid, .. } => {
                {
                    let mut state = self.state.write();
                    state.active_mask.set(cpuid);
                    if !state.process_mask.contains(cpuid) {
                        state.borrowed.set(cpuid);
                    }
                }
                let cb = self.callbacks.read().enable();
                if let Some(cb) = cb {
                    cb.invoke(cpuid);
                }
            }
            Action::Disable { cpuid, .. } => {
                {
                    let mut state = self.state.write();
                    state.active_mask.clear(cpuid);
                    state.borrowed.clear(cpuid);
                }
                let cb = self.callbacks.read().disable();
                if let Some(cb) = cb {
                    cb.invoke(cpuid);
                }
            }
            Action::SetMask { mask, .. } => {
                let cb = self.callbacks.read().mask_changed();
                if let Some(cb) = cb {
                    cb(&mask);
                }
            }
        }
    }

    /// Reconciles the descriptor with the shared tables: foreign grants
    /// and revocations are detected by diffing the guest column against
    /// the last observed active set, and pending mask updates are
    /// adopted. Runs the resulting callbacks.
    ///
    /// The async helper calls this periodically; polling-mode
    /// applications call it at their own convenient points (task
    /// boundaries, scheduler ticks).
    pub fn reconcile(&self) {
        let snapshot = {
            let guard = self.tables.lock();
            let Some(tables) = guard.as_ref() else { return };
            match tables.cpuinfo.snapshot() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "helper failed to read cpuinfo");
                    return;
                }
            }
        };
        let current: CpuSet = snapshot
            .iter()
            .filter(|c| c.guest == self.pid)
            .map(|c| c.cpuid)
            .collect();
        let previous = self.state.read().active_mask;

        let mut actions = ActionList::new();
        for cpuid in current.difference(&previous).iter() {
            actions.enable(self.pid, cpuid);
        }
        for cpuid in previous.difference(&current).iter() {
            actions.disable(self.pid, cpuid);
        }
        self.dispatch(actions);

        if self.options.drom {
            if let Err(e) = self.poll_drom() {
                tracing::warn!(error = %e, "helper drom poll failed");
            }
        }
    }
}

impl Drop for SubProcess {
    fn drop(&mut self) {
        // The lock must be released before finalize re-takes it.
        let initialized = { self.tables.lock().is_some() };
        if initialized {
            tracing::warn!(pid = self.pid, "descriptor dropped without finalize; cleaning up");
            if let Err(e) = self.finalize() {
                tracing::warn!(pid = self.pid, error = %e, "implicit finalize failed");
            }
        }
    }
}

fn resolve_system_size(options: &Options, mask: &CpuSet) -> usize {
    let configured = options.system_size as usize;
    let base = if configured == 0 {
        std::thread::available_parallelism().map_or(1, usize::from)
    } else {
        configured
    };
    let floor = mask.iter().last().map_or(0, |c| c + 1);
    base.max(floor).min(MAX_CPUS)
}

fn current_affinity() -> Result<CpuSet, Error> {
    let set = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0))
        .map_err(dynres_shmem::ShmemError::Os)?;
    let mut mask = CpuSet::new();
    for cpuid in 0..MAX_CPUS {
        if set.is_set(cpuid).unwrap_or(false) {
            mask.set(cpuid);
        }
    }
    Ok(mask)
}
