// SPDX-License-Identifier: Apache-2.0

//! Helper thread of the asynchronous interaction mode.
//!
//! In polling mode a process only observes foreign grants and
//! revocations when it happens to call into the manager. The helper
//! closes that gap: a named thread periodically reconciles the
//! descriptor's view against the shared tables and runs the resulting
//! callbacks, so a victim honors a reclaim without any API traffic of
//! its own.

use crate::error::Error;
use crate::spd::SubProcess;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

pub(crate) struct Helper {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Helper {
    /// Spawns the reconciliation thread. It holds only a weak reference
    /// to the descriptor, so an abandoned descriptor can still be
    /// dropped; the thread then exits on its next tick.
    pub(crate) fn spawn(spd: Weak<SubProcess>, interval: Duration) -> Result<Helper, Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("dynres-helper".to_owned())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(spd) = spd.upgrade() else { break };
                    spd.reconcile();
                }
                tracing::debug!("helper thread exiting");
            })
            .map_err(Error::ThreadSpawn)?;
        Ok(Helper {
            stop,
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it to finish.
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("helper thread panicked");
            }
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
