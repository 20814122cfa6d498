// SPDX-License-Identifier: Apache-2.0

//! Robust process-shared mutex living inside a shared-memory segment.
//!
//! Thin wrapper over the pthread robust mutex: if a holder dies, the
//! next locker gets `EOWNERDEAD`, marks the mutex consistent and is told
//! so, giving it the chance to repair table state left mid-mutation.

#![allow(unsafe_code)]

use crate::error::ShmemError;
use nix::errno::Errno;
use nix::libc;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// A pthread robust mutex with process-shared attributes.
///
/// The struct is embedded in the segment header; it must only be
/// initialized once per segment lifetime, by the creating process,
/// before the segment is published to other attachers.
#[repr(C)]
pub(crate) struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// The whole point of the type: it synchronizes across processes, so it
// is certainly shareable across threads of one process.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

/// Result of a successful lock acquisition.
pub(crate) struct LockState {
    /// The previous holder died while holding the lock; the protected
    /// data may be mid-mutation and must be repaired before use.
    pub recovered: bool,
}

fn check(rc: libc::c_int) -> Result<(), ShmemError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmemError::Mutex(Errno::from_raw(rc)))
    }
}

impl RobustMutex {
    /// Initializes the mutex in place.
    ///
    /// # Safety
    /// `self` must point into zero-initialized, process-shared memory
    /// that no other process is accessing yet.
    pub(crate) unsafe fn init_in_place(&self) -> Result<(), ShmemError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let result = check(libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|()| {
                check(libc::pthread_mutexattr_setrobust(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_MUTEX_ROBUST,
                ))
            })
            .and_then(|()| check(libc::pthread_mutex_init(self.inner.get(), attr.as_ptr())));
            let _ = libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result
        }
    }

    /// Acquires the mutex, recovering it if the previous holder died.
    pub(crate) fn lock(&self) -> Result<LockState, ShmemError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc == 0 {
            return Ok(LockState { recovered: false });
        }
        if rc == libc::EOWNERDEAD {
            // Mark consistent so future lockers do not see EOWNERDEAD
            // again; the caller repairs the protected state.
            let rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
            if rc != 0 {
                let _ = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
                return Err(ShmemError::Mutex(Errno::from_raw(rc)));
            }
            return Ok(LockState { recovered: true });
        }
        Err(ShmemError::Mutex(Errno::from_raw(rc)))
    }

    /// Releases the mutex. Failure here means the lock discipline was
    /// already broken; nothing useful can be done with the error.
    pub(crate) fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc != 0 {
            tracing::error!(errno = rc, "failed to release segment mutex");
        }
    }
}
