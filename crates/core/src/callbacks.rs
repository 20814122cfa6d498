// SPDX-License-Identifier: Apache-2.0

//! Callback registry of a sub-process.
//!
//! Callbacks are invoked on the calling thread, strictly outside any
//! segment mutex. They are stored behind `Arc` so dispatch can snapshot
//! a callback and release the registry lock before invoking it; a
//! callback may therefore re-enter the descriptor (e.g. lend a CPU back
//! from inside `enable_cpu`).

use dynres_shmem::CpuSet;
use std::sync::Arc;

/// Callback receiving a single CPU id.
pub type CpuCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Callback receiving a CPU mask.
pub type MaskCallback = Arc<dyn Fn(&CpuSet) + Send + Sync>;

/// The set of callbacks a sub-process can register.
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    enable_cpu: Option<CpuCallback>,
    disable_cpu: Option<CpuCallback>,
    enable_cpu_set: Option<MaskCallback>,
    disable_cpu_set: Option<MaskCallback>,
    set_process_mask: Option<MaskCallback>,
}

impl CallbackRegistry {
    /// Registers the callback run when a CPU becomes usable.
    pub fn on_enable_cpu(&mut self, cb: impl Fn(usize) + Send + Sync + 'static) {
        self.enable_cpu = Some(Arc::new(cb));
    }

    /// Registers the callback run when a CPU must be vacated.
    pub fn on_disable_cpu(&mut self, cb: impl Fn(usize) + Send + Sync + 'static) {
        self.disable_cpu = Some(Arc::new(cb));
    }

    /// Registers the batched variant of the enable callback, used when
    /// no per-CPU callback is present.
    pub fn on_enable_cpu_set(&mut self, cb: impl Fn(&CpuSet) + Send + Sync + 'static) {
        self.enable_cpu_set = Some(Arc::new(cb));
    }

    /// Registers the batched variant of the disable callback, used when
    /// no per-CPU callback is present.
    pub fn on_disable_cpu_set(&mut self, cb: impl Fn(&CpuSet) + Send + Sync + 'static) {
        self.disable_cpu_set = Some(Arc::new(cb));
    }

    /// Registers the callback run after a mask update is adopted.
    pub fn on_set_process_mask(&mut self, cb: impl Fn(&CpuSet) + Send + Sync + 'static) {
        self.set_process_mask = Some(Arc::new(cb));
    }

    pub(crate) fn enable(&self) -> Option<EitherCpuCallback> {
        match (&self.enable_cpu, &self.enable_cpu_set) {
            (Some(cb), _) => Some(EitherCpuCallback::PerCpu(cb.clone())),
            (None, Some(cb)) => Some(EitherCpuCallback::Masked(cb.clone())),
            (None, None) => None,
        }
    }

    pub(crate) fn disable(&self) -> Option<EitherCpuCallback> {
        match (&self.disable_cpu, &self.disable_cpu_set) {
            (Some(cb), _) => Some(EitherCpuCallback::PerCpu(cb.clone())),
            (None, Some(cb)) => Some(EitherCpuCallback::Masked(cb.clone())),
            (None, None) => None,
        }
    }

    pub(crate) fn mask_changed(&self) -> Option<MaskCallback> {
        self.set_process_mask.clone()
    }
}

/// A per-CPU callback, or the batched fallback invoked with a
/// single-CPU mask.
pub(crate) enum EitherCpuCallback {
    PerCpu(CpuCallback),
    Masked(MaskCallback),
}

impl EitherCpuCallback {
    pub(crate) fn invoke(&self, cpuid: usize) {
        match self {
            EitherCpuCallback::PerCpu(cb) => cb(cpuid),
            EitherCpuCallback::Masked(cb) => cb(&CpuSet::single(cpuid)),
        }
    }
}
