// SPDX-License-Identifier: Apache-2.0

//! Free-agent thread manager.
//!
//! The process mask splits into a primary-thread CPU and worker CPUs;
//! whatever remains, plus CPUs borrowed at runtime, hosts free agent
//! threads, one per CPU, activated when tasks pile up and deactivated
//! when the CPU is wanted elsewhere. All hooks are driven by OMPT-style
//! runtime events plus the manager's enable/disable callbacks.

use crate::cpu_state::{AtomicCpuState, CpuFlags};
use crate::runtime::{OpenMpRuntime, ParallelRegion};
use dynres_config::OmpToolOpts;
use dynres_core::spd::SubProcess;
use dynres_shmem::CpuSet;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

bitflags::bitflags! {
    /// OpenMP roles a CPU can host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Roles: u32 {
        /// The primary thread's CPU.
        const PRIMARY = 1 << 0;
        /// A worker thread of parallel regions.
        const WORKER = 1 << 1;
        /// A free agent thread is pinned here.
        const FREE_AGENT = 1 << 2;
    }
}

struct CpuData {
    state: AtomicCpuState,
    roles: AtomicU32,
    wanted_for_parallel: AtomicBool,
}

impl CpuData {
    fn roles(&self) -> Roles {
        Roles::from_bits_truncate(self.roles.load(Ordering::Acquire))
    }

    fn add_role(&self, role: Roles) {
        let _ = self.roles.fetch_or(role.bits(), Ordering::AcqRel);
    }
}

/// Free-agent lookup tables, written only when a thread registers.
#[derive(Default)]
struct AgentTables {
    id_by_cpuid: Vec<Option<usize>>,
    cpuid_by_id: Vec<Option<usize>>,
    /// CPUs hosting an agent, own-process CPUs first.
    cpu_list: Vec<usize>,
}

/// The free-agent flavored thread manager of one sub-process.
pub struct FreeAgentManager {
    spd: Arc<SubProcess>,
    runtime: Arc<dyn OpenMpRuntime>,
    opts: OmpToolOpts,
    system_size: usize,
    process_mask: RwLock<CpuSet>,
    primary_mask: CpuSet,
    worker_mask: CpuSet,
    cpu_data: Vec<CpuData>,
    agents: RwLock<AgentTables>,
    in_parallel: AtomicBool,
    pending_tasks: AtomicUsize,
    num_enabled_agents: AtomicUsize,
}

impl FreeAgentManager {
    /// Builds the manager for `spd` and wires its callbacks.
    ///
    /// `default_team_size` is the worker team size (primary included);
    /// it falls back to `OMP_NUM_THREADS`, then to the mask width. The
    /// first CPU of the mask belongs to the primary thread, the next
    /// `team - 1` to workers; leftovers host free agents from the
    /// start.
    pub fn new(
        spd: Arc<SubProcess>,
        runtime: Arc<dyn OpenMpRuntime>,
        default_team_size: Option<usize>,
    ) -> Arc<Self> {
        let process_mask = spd.process_mask();
        let system_size = spd.system_size();
        let team = default_team_size
            .or_else(|| std::env::var("OMP_NUM_THREADS").ok().and_then(|v| v.parse().ok()))
            .unwrap_or_else(|| process_mask.count())
            .max(1);

        let mut primary_mask = CpuSet::new();
        let mut worker_mask = CpuSet::new();
        for (index, cpuid) in process_mask.iter().enumerate() {
            if index == 0 {
                primary_mask.set(cpuid);
            } else if index < team {
                worker_mask.set(cpuid);
            }
        }

        let cpu_data: Vec<CpuData> = (0..system_size)
            .map(|cpuid| {
                let (roles, state) = if primary_mask.contains(cpuid) {
                    (Roles::PRIMARY, CpuFlags::IN_PARALLEL)
                } else if worker_mask.contains(cpuid) {
                    (Roles::WORKER, CpuFlags::IDLE)
                } else if process_mask.contains(cpuid) {
                    (Roles::empty(), CpuFlags::IDLE)
                } else {
                    (Roles::empty(), CpuFlags::empty())
                };
                CpuData {
                    state: AtomicCpuState::new(state),
                    roles: AtomicU32::new(roles.bits()),
                    wanted_for_parallel: AtomicBool::new(false),
                }
            })
            .collect();

        let num_agents = runtime.num_free_agents();
        let opts = spd.options().lewi_ompt;
        let manager = Arc::new(FreeAgentManager {
            spd,
            runtime,
            opts,
            system_size,
            process_mask: RwLock::new(process_mask),
            primary_mask,
            worker_mask,
            cpu_data,
            agents: RwLock::new(AgentTables {
                id_by_cpuid: vec![None; system_size],
                cpuid_by_id: vec![None; num_agents],
                cpu_list: Vec::with_capacity(num_agents),
            }),
            in_parallel: AtomicBool::new(false),
            pending_tasks: AtomicUsize::new(0),
            num_enabled_agents: AtomicUsize::new(0),
        });

        let weak: Weak<FreeAgentManager> = Arc::downgrade(&manager);
        manager.spd.set_callbacks(|registry| {
            let w = weak.clone();
            registry.on_enable_cpu(move |cpuid| {
                if let Some(m) = w.upgrade() {
                    m.enable_cpu(cpuid);
                }
            });
            let w = weak.clone();
            registry.on_disable_cpu(move |cpuid| {
                if let Some(m) = w.upgrade() {
                    m.disable_cpu(cpuid);
                }
            });
            let w = weak.clone();
            registry.on_set_process_mask(move |mask| {
                if let Some(m) = w.upgrade() {
                    m.mask_changed(mask);
                }
            });
        });

        manager.lend_idle_workers();
        manager
    }

    /// Registers a newly started free agent thread: computes its CPU
    /// binding, records it in the lookup tables and pins the thread.
    /// Agents start deactivated. Returns the chosen CPU.
    pub fn thread_started(&self, agent_id: usize) -> Option<usize> {
        let cpuid = self.compute_binding(agent_id);
        let Some(cpuid) = cpuid else {
            tracing::warn!(agent_id, "no suitable CPU binding for free agent");
            return None;
        };
        {
            let mut agents = self.agents.write();
            agents.id_by_cpuid[cpuid] = Some(agent_id);
            agents.cpuid_by_id[agent_id] = Some(cpuid);
            agents.cpu_list.push(cpuid);
            let mask = *self.process_mask.read();
            agents.cpu_list.sort_by_key(|c| (!mask.contains(*c), *c));
        }
        self.cpu_data[cpuid].add_role(Roles::FREE_AGENT);
        self.runtime.set_free_agent_active(agent_id, false);
        self.runtime.bind_current_thread(cpuid);
        tracing::debug!(agent_id, cpuid, "free agent pinned");
        Some(cpuid)
    }

    /// Deterministic binding: own-mask CPUs not used by the primary or
    /// workers get the lowest agent ids, then CPUs of other processes,
    /// finally worker CPUs (shared).
    fn compute_binding(&self, agent_id: usize) -> Option<usize> {
        let mask = *self.process_mask.read();
        let available = mask.difference(&self.primary_mask).difference(&self.worker_mask);
        let n_available = available.count();
        if agent_id < n_available {
            return available.iter().nth(agent_id);
        }
        let non_owned = self.spd.non_owned_cpus().unwrap_or_default();
        let n_non_owned = non_owned.count();
        if agent_id < n_available + n_non_owned {
            return non_owned.iter().nth(agent_id - n_available);
        }
        let n_workers = self.worker_mask.count();
        if agent_id < n_available + n_non_owned + n_workers {
            return self.worker_mask.iter().nth(agent_id - n_available - n_non_owned);
        }
        None
    }

    /// A CPU became usable. Activate the bound agent unless the CPU is
    /// spoken for by a parallel region or was only granted back after a
    /// reclaim.
    pub fn enable_cpu(&self, cpuid: usize) {
        if cpuid >= self.system_size {
            return;
        }
        if self.cpu_data[cpuid].wanted_for_parallel.load(Ordering::Relaxed) {
            return;
        }
        if self.cpu_data[cpuid].state.swap_flag(CpuFlags::RECLAIMED, CpuFlags::IDLE) {
            return;
        }
        match self.agent_on(cpuid) {
            None => {
                // No agent bound here (yet); the grant cannot be used.
                self.give_back(cpuid);
            }
            Some(agent_id) => {
                if self.cpu_data[cpuid]
                    .state
                    .test_set_clear(CpuFlags::FREE_AGENT_ENABLED, CpuFlags::IDLE)
                {
                    let _ = self.num_enabled_agents.fetch_add(1, Ordering::AcqRel);
                    tracing::debug!(agent_id, cpuid, "enabling free agent");
                    self.runtime.set_free_agent_active(agent_id, true);
                }
            }
        }
    }

    /// A CPU must be vacated. Deactivate the bound agent; the CPU stays
    /// idle-usable only while it remains in the process mask.
    pub fn disable_cpu(&self, cpuid: usize) {
        if cpuid >= self.system_size {
            return;
        }
        let Some(agent_id) = self.agent_on(cpuid) else {
            return;
        };
        if self.process_mask.read().contains(cpuid)
            && !self.cpu_data[cpuid].wanted_for_parallel.load(Ordering::Relaxed)
        {
            self.cpu_data[cpuid].state.set(CpuFlags::IDLE);
        }
        if self.cpu_data[cpuid].state.clear(CpuFlags::FREE_AGENT_ENABLED) {
            let _ = self.num_enabled_agents.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(agent_id, cpuid, "disabling free agent");
            self.runtime.set_free_agent_active(agent_id, false);
        }
    }

    fn mask_changed(&self, mask: &CpuSet) {
        *self.process_mask.write() = *mask;
    }

    /// Level-1 parallel region starts. When the team spans the whole
    /// mask, every owned CPU is wanted: active agents on them are
    /// deactivated and lent CPUs reclaimed.
    pub fn parallel_begin(&self, region: ParallelRegion) {
        if region.level != 1 {
            return;
        }
        self.in_parallel.store(true, Ordering::Release);
        let mask = *self.process_mask.read();
        if region.requested_parallelism != mask.count() {
            return;
        }
        let mut to_reclaim = CpuSet::new();
        for cpuid in mask.iter() {
            self.cpu_data[cpuid].wanted_for_parallel.store(true, Ordering::Relaxed);
            let state = self.cpu_data[cpuid].state.load();
            if state.contains(CpuFlags::FREE_AGENT_ENABLED) {
                self.disable_cpu(cpuid);
            } else if state.contains(CpuFlags::LENT) {
                to_reclaim.set(cpuid);
            }
        }
        match to_reclaim.count() {
            0 => {}
            1 => {
                if let Some(cpuid) = to_reclaim.first() {
                    log_refusal("reclaim", self.spd.reclaim_cpu(cpuid));
                }
            }
            _ => log_refusal("reclaim", self.spd.reclaim_mask(&to_reclaim)),
        }
    }

    /// Level-1 parallel region ends: workers go idle and, under the
    /// lend policy, are offered to the pool right away.
    pub fn parallel_end(&self, level: u32) {
        if level != 1 {
            return;
        }
        self.in_parallel.store(false, Ordering::Release);
        let mask = *self.process_mask.read();
        for cpuid in mask.iter() {
            self.cpu_data[cpuid].wanted_for_parallel.store(false, Ordering::Relaxed);
            if self.cpu_data[cpuid].roles().contains(Roles::WORKER) {
                let _ = self.cpu_data[cpuid].state.swap_flag(CpuFlags::IN_PARALLEL, CpuFlags::IDLE);
            } else if !self.primary_mask.contains(cpuid)
                && self.cpu_data[cpuid].state.load().is_empty()
            {
                // Agent CPUs parked while the region wanted them become
                // usable again.
                self.cpu_data[cpuid].state.set(CpuFlags::IDLE);
            }
        }
        self.lend_idle_workers();
    }

    /// A worker enters its implicit task on `cpuid`: reclaim the CPU if
    /// it had been lent meanwhile.
    pub fn into_parallel_function(&self, cpuid: usize, level: u32) {
        if level != 1 || cpuid >= self.system_size {
            return;
        }
        if self.cpu_data[cpuid].state.load().contains(CpuFlags::LENT) {
            log_refusal("reclaim", self.spd.reclaim_cpu(cpuid));
        }
        self.cpu_data[cpuid].state.set(CpuFlags::IN_PARALLEL);
    }

    /// A task was created: try to bring one more free agent online.
    pub fn task_created(&self) {
        let _ = self.pending_tasks.fetch_add(1, Ordering::AcqRel);
        self.acquire_one_free_agent();
    }

    /// A free agent finished a task. Decide whether it keeps running,
    /// returns a reclaimed CPU, or parks.
    pub fn task_completed(&self, agent_id: usize) {
        let cpuid = {
            let agents = self.agents.read();
            agents.cpuid_by_id.get(agent_id).copied().flatten()
        };
        let Some(cpuid) = cpuid else { return };

        let state = self.cpu_data[cpuid].state.load();
        if state.contains(CpuFlags::IN_PARALLEL)
            || self.cpu_data[cpuid].wanted_for_parallel.load(Ordering::Relaxed)
        {
            self.disable_cpu(cpuid);
        } else if self.spd.check_cpu_availability(cpuid).is_err() {
            // The owner reclaimed it while we were running: acknowledge
            // the loss and park the agent.
            log_refusal("return", self.spd.return_cpu(cpuid));
            self.disable_cpu(cpuid);
        } else if self.pending_tasks.load(Ordering::Acquire) == 0 {
            self.disable_cpu(cpuid);
            let owned = self.process_mask.read().contains(cpuid);
            if !owned {
                log_refusal("return", self.spd.return_cpu(cpuid));
            } else if self.opts.contains(OmpToolOpts::LEND) {
                log_refusal("lend", self.spd.lend_cpu(cpuid));
            }
        }
    }

    /// A thread switched to another pending task.
    pub fn task_switch(&self) {
        let previous = self
            .pending_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        // More work remains after taking this task: keep recruiting.
        if previous > 1 {
            self.acquire_one_free_agent();
        }
    }

    /// Entering a blocking call: every idle CPU serving workers or free
    /// agents is lent for the duration.
    pub fn into_blocking_call(&self) {
        if self.in_parallel.load(Ordering::Acquire) {
            tracing::warn!("blocking call inside a parallel region; not lending");
            return;
        }
        let mask = *self.process_mask.read();
        let mut to_lend = CpuSet::new();
        for cpuid in 0..self.system_size {
            if self.cpu_data[cpuid].roles().intersects(Roles::WORKER | Roles::FREE_AGENT)
                && mask.contains(cpuid)
                && self.cpu_data[cpuid].state.swap_flag(CpuFlags::IDLE, CpuFlags::LENT)
            {
                to_lend.set(cpuid);
            }
        }
        if !to_lend.is_empty() {
            log_refusal("lend", self.spd.lend_mask(&to_lend));
        }
    }

    /// Leaving a blocking call: under the lend policy CPUs are pulled
    /// back on demand; otherwise everything lent is reclaimed now.
    pub fn out_of_blocking_call(&self) {
        if self.opts.contains(OmpToolOpts::LEND) {
            return;
        }
        let mask = *self.process_mask.read();
        let mut to_reclaim = CpuSet::new();
        for cpuid in 0..self.system_size {
            if self.cpu_data[cpuid].roles().intersects(Roles::WORKER | Roles::FREE_AGENT)
                && mask.contains(cpuid)
                && self.cpu_data[cpuid].state.swap_flag(CpuFlags::LENT, CpuFlags::RECLAIMED)
            {
                to_reclaim.set(cpuid);
            }
        }
        if !to_reclaim.is_empty() {
            log_refusal("reclaim", self.spd.reclaim_mask(&to_reclaim));
        }
    }

    /// Looks for a CPU to run one more agent: an idle agent CPU is
    /// enabled locally, otherwise one CPU is requested from the pool
    /// among the candidates.
    fn acquire_one_free_agent(&self) {
        let total = self.runtime.num_free_agents();
        if self.num_enabled_agents.load(Ordering::Acquire) >= total {
            return;
        }
        let candidates: Vec<usize> = self.agents.read().cpu_list.clone();
        let mut to_ask = CpuSet::new();
        for cpuid in candidates {
            let state = self.cpu_data[cpuid].state.load();
            if state.intersects(CpuFlags::IN_PARALLEL | CpuFlags::FREE_AGENT_ENABLED) {
                continue;
            }
            if state == CpuFlags::IDLE {
                self.enable_cpu(cpuid);
                return;
            }
            to_ask.set(cpuid);
        }
        if !to_ask.is_empty() {
            log_refusal("acquire", self.spd.acquire_cpus_in_mask(1, &to_ask));
        }
    }

    fn give_back(&self, cpuid: usize) {
        let owned = self.process_mask.read().contains(cpuid);
        if owned {
            log_refusal("lend", self.spd.lend_cpu(cpuid));
        } else {
            log_refusal("return", self.spd.return_cpu(cpuid));
        }
    }

    fn agent_on(&self, cpuid: usize) -> Option<usize> {
        self.agents.read().id_by_cpuid.get(cpuid).copied().flatten()
    }

    fn lend_idle_workers(&self) {
        if !self.opts.contains(OmpToolOpts::LEND) {
            return;
        }
        let mut to_lend = CpuSet::new();
        for cpuid in self.worker_mask.iter() {
            if self.cpu_data[cpuid].state.swap_flag(CpuFlags::IDLE, CpuFlags::LENT) {
                to_lend.set(cpuid);
            }
        }
        if !to_lend.is_empty() {
            log_refusal("lend", self.spd.lend_mask(&to_lend));
        }
    }

    /* Inspection */

    /// Number of currently active free agents.
    #[must_use]
    pub fn enabled_agents(&self) -> usize {
        self.num_enabled_agents.load(Ordering::Acquire)
    }

    /// Current state flags of a CPU.
    #[must_use]
    pub fn cpu_flags(&self, cpuid: usize) -> CpuFlags {
        self.cpu_data[cpuid].state.load()
    }

    /// Whether a level-1 parallel region is running.
    #[must_use]
    pub fn in_parallel(&self) -> bool {
        self.in_parallel.load(Ordering::Acquire)
    }

    /// The CPU an agent is bound to, if registered.
    #[must_use]
    pub fn binding_of(&self, agent_id: usize) -> Option<usize> {
        self.agents.read().cpuid_by_id.get(agent_id).copied().flatten()
    }
}

fn log_refusal<T>(what: &str, result: Result<T, dynres_core::error::Error>) {
    if let Err(e) = result {
        tracing::debug!(what, error = %e, "pool request refused");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use dynres_config::{Options, Policy};
    use dynres_shmem::ProcessId;
    use std::sync::atomic::AtomicU32 as TestSeq;

    const PID_A: ProcessId = 111;
    const PID_B: ProcessId = 222;

    static KEY_SEQ: TestSeq = TestSeq::new(0);

    fn options(system_size: u32) -> Options {
        Options {
            policy: Policy::LewiMask,
            system_size,
            shm_key: format!(
                "omptm-ut-{}-{}",
                std::process::id(),
                KEY_SEQ.fetch_add(1, Ordering::Relaxed)
            ),
            ..Options::default()
        }
    }

    fn mask(s: &str) -> CpuSet {
        s.parse().expect("valid mask")
    }

    /// 4 CPUs, team of 2: primary on 0, worker on 1, agents on 2 and 3.
    fn manager() -> (Arc<SubProcess>, Arc<MockRuntime>, Arc<FreeAgentManager>) {
        let spd = SubProcess::init(PID_A, Some(mask("0-3")), options(4)).expect("init");
        let runtime = Arc::new(MockRuntime::new(2));
        let manager = FreeAgentManager::new(spd.clone(), runtime.clone(), Some(2));
        assert_eq!(manager.thread_started(0), Some(2));
        assert_eq!(manager.thread_started(1), Some(3));
        (spd, runtime, manager)
    }

    #[test]
    fn binding_prefers_spare_own_cpus() {
        let (spd, runtime, manager) = manager();
        assert_eq!(manager.binding_of(0), Some(2));
        assert_eq!(manager.binding_of(1), Some(3));
        assert_eq!(*runtime.bindings.lock(), vec![2, 3]);
        spd.finalize().expect("finalize");
    }

    #[test]
    fn binding_overflows_to_worker_cpus() {
        let spd = SubProcess::init(PID_A, Some(mask("0-1")), options(2)).expect("init");
        let runtime = Arc::new(MockRuntime::new(1));
        let manager = FreeAgentManager::new(spd.clone(), runtime, Some(2));
        // No spare own CPU, no foreign CPU: share the worker CPU.
        assert_eq!(manager.thread_started(0), Some(1));
        spd.finalize().expect("finalize");
    }

    #[test]
    fn task_creation_enables_an_idle_agent() {
        let (spd, runtime, manager) = manager();
        manager.task_created();
        assert_eq!(manager.enabled_agents(), 1);
        assert_eq!(runtime.active_count(), 1);
        assert!(manager.cpu_flags(2).contains(CpuFlags::FREE_AGENT_ENABLED));
        spd.finalize().expect("finalize");
    }

    #[test]
    fn full_team_parallel_region_parks_agents() {
        let (spd, runtime, manager) = manager();
        manager.task_created();
        manager.task_created();
        assert_eq!(manager.enabled_agents(), 2);

        manager.parallel_begin(ParallelRegion {
            level: 1,
            requested_parallelism: 4,
        });
        assert!(manager.in_parallel());
        assert_eq!(manager.enabled_agents(), 0);
        assert_eq!(runtime.active_count(), 0);

        manager.parallel_end(1);
        assert!(!manager.in_parallel());
        spd.finalize().expect("finalize");
    }

    #[test]
    fn nested_regions_are_ignored() {
        let (spd, _runtime, manager) = manager();
        manager.task_created();
        manager.parallel_begin(ParallelRegion {
            level: 2,
            requested_parallelism: 4,
        });
        // The nested region must not steal the agent.
        assert_eq!(manager.enabled_agents(), 1);
        spd.finalize().expect("finalize");
    }

    #[test]
    fn agent_returns_a_reclaimed_borrowed_cpu() {
        let opts = options(4);
        let a = SubProcess::init(PID_A, Some(mask("0")), opts.clone()).expect("init A");
        let b = SubProcess::init(PID_B, Some(mask("2-3")), opts).expect("init B");
        let runtime = Arc::new(MockRuntime::new(1));
        let manager = FreeAgentManager::new(a.clone(), runtime.clone(), Some(1));

        // B lends CPU 2; the agent binds to the foreign CPU and runs.
        let _ = b.lend_cpu(2).expect("lend");
        assert_eq!(manager.thread_started(0), Some(2));
        manager.task_created();
        assert_eq!(manager.enabled_agents(), 1);

        // The owner wants it back mid-task.
        let _ = b.reclaim_cpu(2).expect("reclaim");
        manager.task_completed(0);
        assert_eq!(manager.enabled_agents(), 0);
        assert_eq!(runtime.active_count(), 0);

        a.finalize().expect("finalize A");
        b.finalize().expect("finalize B");
    }

    #[test]
    fn blocking_call_lends_and_reclaims_worker_cpus() {
        let (spd, _runtime, manager) = manager();
        manager.into_blocking_call();
        // Worker CPU 1 and the agent CPUs are lent.
        assert!(manager.cpu_flags(1).contains(CpuFlags::LENT));
        assert!(manager.cpu_flags(2).contains(CpuFlags::LENT));
        assert!(manager.cpu_flags(3).contains(CpuFlags::LENT));

        manager.out_of_blocking_call();
        // Reclaim round-trips through the enable callback back to IDLE.
        assert!(manager.cpu_flags(1).contains(CpuFlags::IDLE));
        assert!(manager.cpu_flags(2).contains(CpuFlags::IDLE));
        assert!(manager.cpu_flags(3).contains(CpuFlags::IDLE));
        spd.finalize().expect("finalize");
    }

    #[test]
    fn idle_agent_parks_when_the_task_queue_drains() {
        let (spd, runtime, manager) = manager();
        manager.task_created();
        assert_eq!(manager.enabled_agents(), 1);

        // The only task is taken and finished: nothing pending, the
        // agent parks and its own CPU stays with the process.
        manager.task_switch();
        manager.task_completed(0);
        assert_eq!(manager.enabled_agents(), 0);
        assert_eq!(runtime.active_count(), 0);
        assert!(manager.cpu_flags(2).contains(CpuFlags::IDLE));
        spd.finalize().expect("finalize");
    }

    #[test]
    fn task_switch_recruits_more_agents_while_work_remains() {
        let (spd, _runtime, manager) = manager();
        manager.task_created();
        manager.task_created();
        manager.task_created();
        assert_eq!(manager.enabled_agents(), 2);
        // Draining one task still leaves a backlog; the switch hook
        // keeps looking for capacity without dropping below the cap.
        manager.task_switch();
        assert_eq!(manager.enabled_agents(), 2);
        spd.finalize().expect("finalize");
    }

    #[test]
    fn task_flood_asks_the_pool_for_foreign_cpus() {
        let opts = options(4);
        let a = SubProcess::init(PID_A, Some(mask("0")), opts.clone()).expect("init A");
        let b = SubProcess::init(PID_B, Some(mask("2-3")), opts).expect("init B");
        let runtime = Arc::new(MockRuntime::new(1));
        let manager = FreeAgentManager::new(a.clone(), runtime, Some(1));

        // The agent binds to B's CPU 2 (still busy at B).
        assert_eq!(manager.thread_started(0), Some(2));
        manager.task_created();
        // Nothing idle: the manager queued an acquire with the pool.
        assert_eq!(manager.enabled_agents(), 0);

        // When B lends the CPU, the queued request is served and the
        // grant reaches A on reconciliation.
        let _ = b.lend_cpu(2).expect("lend");
        a.reconcile();
        assert_eq!(manager.enabled_agents(), 1);

        a.finalize().expect("finalize A");
        b.finalize().expect("finalize B");
    }
}
