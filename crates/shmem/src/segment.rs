// SPDX-License-Identifier: Apache-2.0

//! Named shared-memory segment primitive.
//!
//! A segment is a POSIX shared-memory object holding a fixed header
//! (magic tag, version, size multiplier, attach count, robust mutex)
//! followed by a plain-data body. The first attacher creates and
//! initializes the object and publishes it by writing the magic tag
//! last; later attachers wait for the tag, then verify the version.
//! The attach count is maintained under the segment mutex and the
//! object is unlinked when the last attacher detaches.

#![allow(unsafe_code)]

use crate::error::ShmemError;
use crate::mutex::RobustMutex;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::ftruncate;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Magic tag published once a creator finished initializing a segment.
const MAGIC: u64 = u64::from_le_bytes(*b"DYNRES01");

/// How long an attacher waits for a concurrent creator to finish.
const SETUP_DEADLINE: Duration = Duration::from_secs(5);

const SETUP_POLL: Duration = Duration::from_millis(1);

/// Types that can form a segment body.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain no pointers, references or
/// drop glue, and must be semantically valid when zero-initialized
/// (all-zero is the state of a freshly created segment).
pub unsafe trait ShmBody: Sized + Send + Sync {
    /// Role string, part of the shared-memory object name.
    const ROLE: &'static str;
    /// Layout version; attachers with a different version must abort.
    const VERSION: u32;
}

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU64,
    version: u32,
    size_multiplier: u32,
    // Maintained under the mutex; atomic only so attach/detach never
    // need a unique reference into the shared mapping.
    num_attached: AtomicU32,
    _pad: u32,
    mutex: RobustMutex,
}

#[repr(C)]
struct SegmentShared<B> {
    header: SegmentHeader,
    body: UnsafeCell<B>,
}

/// A mapped shared-memory segment with body type `B`.
pub struct Segment<B: ShmBody> {
    shared: NonNull<SegmentShared<B>>,
    name: String,
    detached: bool,
    _marker: PhantomData<B>,
}

impl<B: ShmBody> std::fmt::Debug for Segment<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("shared", &self.shared)
            .field("name", &self.name)
            .field("detached", &self.detached)
            .finish()
    }
}

// The mapping is shared between processes by construction; within a
// process, access to the body is serialized by the segment mutex.
unsafe impl<B: ShmBody> Send for Segment<B> {}
unsafe impl<B: ShmBody> Sync for Segment<B> {}

/// Exclusive access to a segment body, held under the robust mutex.
pub struct SegmentGuard<'a, B: ShmBody> {
    shared: &'a SegmentShared<B>,
    recovered: bool,
}

impl<B: ShmBody> Deref for SegmentGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        unsafe { &*self.shared.body.get() }
    }
}

impl<B: ShmBody> DerefMut for SegmentGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        unsafe { &mut *self.shared.body.get() }
    }
}

impl<B: ShmBody> Drop for SegmentGuard<'_, B> {
    fn drop(&mut self) {
        self.shared.header.mutex.unlock();
    }
}

impl<B: ShmBody> SegmentGuard<'_, B> {
    /// Whether the previous lock holder died mid-mutation. When true the
    /// caller must repair table state before relying on it.
    #[must_use]
    pub const fn recovered(&self) -> bool {
        self.recovered
    }
}

fn shm_name(key: &str) -> String {
    // POSIX shm object names live in a single flat namespace per node.
    String::new() + "/dynres-" + key
}

impl<B: ShmBody> Segment<B> {
    const LEN: usize = size_of::<SegmentShared<B>>();

    fn object_name(key: &str) -> String {
        shm_name(&format!("{}-{}", B::ROLE, key))
    }

    /// Creates the segment or attaches to an existing one.
    ///
    /// On creation `init` runs on the zero-filled body before any other
    /// process can observe the segment, and `size_multiplier` is stored
    /// in the header. Returns the segment and whether it was created by
    /// this call.
    pub fn create_or_attach(
        key: &str,
        size_multiplier: u32,
        init: impl FnOnce(&mut B),
    ) -> Result<(Self, bool), ShmemError> {
        let name = Self::object_name(key);
        match shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => {
                let segment = Self::create(name, &fd, size_multiplier, init)?;
                Ok((segment, true))
            }
            Err(Errno::EEXIST) => {
                let segment = Self::attach(name)?;
                Ok((segment, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attaches to an existing segment, failing with
    /// [`ShmemError::SegmentMissing`] if it does not exist. Used by
    /// read-mostly observers (administration tools, launchers).
    pub fn attach_existing(key: &str) -> Result<Self, ShmemError> {
        Self::attach(Self::object_name(key))
    }

    fn create(
        name: String,
        fd: &OwnedFd,
        size_multiplier: u32,
        init: impl FnOnce(&mut B),
    ) -> Result<Self, ShmemError> {
        if let Err(e) = ftruncate(fd, Self::LEN as i64) {
            let _ = shm_unlink(name.as_str());
            return Err(e.into());
        }
        let ptr = Self::map(fd)?;

        // Exclusive access until the magic tag is published.
        let raw = ptr.as_ptr();
        unsafe {
            (*raw).header.version = B::VERSION;
            (*raw).header.size_multiplier = size_multiplier;
            (*raw).header.num_attached.store(1, Ordering::Relaxed);
            if let Err(e) = (*raw).header.mutex.init_in_place() {
                // A half-built object must not trap later attachers.
                Self::unmap(ptr);
                let _ = shm_unlink(name.as_str());
                return Err(e);
            }
            init(&mut *(*raw).body.get());
        }
        unsafe { ptr.as_ref() }.header.magic.store(MAGIC, Ordering::Release);

        tracing::debug!(segment = %name, version = B::VERSION, "created shared memory segment");
        Ok(Segment {
            shared: ptr,
            name,
            detached: false,
            _marker: PhantomData,
        })
    }

    fn attach(name: String) -> Result<Self, ShmemError> {
        let fd = match shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Err(ShmemError::SegmentMissing(name)),
            Err(e) => return Err(e.into()),
        };

        // The creator may still be between shm_open and ftruncate.
        let deadline = Instant::now() + SETUP_DEADLINE;
        loop {
            let stat = fstat(&fd)?;
            if stat.st_size as usize >= Self::LEN {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ShmemError::SegmentCorrupted(name));
            }
            std::thread::sleep(SETUP_POLL);
        }

        let ptr = Self::map(&fd)?;
        let shared = unsafe { ptr.as_ref() };

        // Wait for the creator to publish the magic tag.
        while shared.header.magic.load(Ordering::Acquire) != MAGIC {
            if Instant::now() >= deadline {
                unsafe { Self::unmap(ptr) };
                return Err(ShmemError::SegmentCorrupted(name));
            }
            std::thread::sleep(SETUP_POLL);
        }

        if shared.header.version != B::VERSION {
            let found = shared.header.version;
            unsafe { Self::unmap(ptr) };
            return Err(ShmemError::VersionMismatch {
                name,
                found,
                expected: B::VERSION,
            });
        }

        let segment = Segment {
            shared: ptr,
            name,
            detached: false,
            _marker: PhantomData,
        };
        {
            let _guard = segment.lock()?;
            let _ = unsafe { segment.shared.as_ref() }
                .header
                .num_attached
                .fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(segment = %segment.name, "attached to shared memory segment");
        Ok(segment)
    }

    fn map(fd: &OwnedFd) -> Result<NonNull<SegmentShared<B>>, ShmemError> {
        let len = NonZeroUsize::new(Self::LEN).expect("segment length is never zero");
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )?
        };
        Ok(ptr.cast())
    }

    unsafe fn unmap(ptr: NonNull<SegmentShared<B>>) {
        if let Err(e) = unsafe { munmap(ptr.cast(), Self::LEN) } {
            tracing::warn!(error = %e, "failed to unmap segment");
        }
    }

    /// Locks the segment mutex and returns exclusive access to the body.
    pub fn lock(&self) -> Result<SegmentGuard<'_, B>, ShmemError> {
        let shared = unsafe { self.shared.as_ref() };
        let state = shared.header.mutex.lock()?;
        Ok(SegmentGuard {
            shared,
            recovered: state.recovered,
        })
    }

    /// The size multiplier stored by the segment creator.
    #[must_use]
    pub fn size_multiplier(&self) -> u32 {
        unsafe { self.shared.as_ref() }.header.size_multiplier
    }

    /// Number of currently attached processes.
    pub fn attached_count(&self) -> Result<u32, ShmemError> {
        let _guard = self.lock()?;
        Ok(unsafe { self.shared.as_ref() }
            .header
            .num_attached
            .load(Ordering::Relaxed))
    }

    /// The shared-memory object name backing this segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Detaches from the segment, unlinking the object if this was the
    /// last attacher.
    pub fn detach(mut self) -> Result<(), ShmemError> {
        self.detach_inner()
    }

    fn detach_inner(&mut self) -> Result<(), ShmemError> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;

        let last = {
            let _guard = self.lock()?;
            let header = &unsafe { self.shared.as_ref() }.header;
            header.num_attached.fetch_sub(1, Ordering::Relaxed) == 1
        };
        unsafe { Self::unmap(self.shared) };
        if last {
            match shm_unlink(self.name.as_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(segment = %self.name, "unlinked shared memory segment");
        }
        Ok(())
    }
}

impl<B: ShmBody> Drop for Segment<B> {
    fn drop(&mut self) {
        if let Err(e) = self.detach_inner() {
            tracing::warn!(segment = %self.name, error = %e, "failed to detach segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[repr(C)]
    struct TestBody {
        counter: u64,
        flag: u32,
        _pad: u32,
    }

    unsafe impl ShmBody for TestBody {
        const ROLE: &'static str = "test";
        const VERSION: u32 = 7;
    }

    // A second body type with a different version, same role, to force a
    // version clash on the same object.
    #[repr(C)]
    struct TestBodyV2 {
        counter: u64,
        flag: u32,
        _pad: u32,
    }

    unsafe impl ShmBody for TestBodyV2 {
        const ROLE: &'static str = "test";
        const VERSION: u32 = 8;
    }

    static KEY_SEQ: AtomicU32 = AtomicU32::new(0);

    fn unique_key() -> String {
        format!(
            "ut-{}-{}",
            std::process::id(),
            KEY_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn creates_runs_init_and_reattaches() {
        let key = unique_key();
        let (segment, created) =
            Segment::<TestBody>::create_or_attach(&key, 1, |body| body.counter = 42)
                .expect("create");
        assert!(created);
        {
            let guard = segment.lock().expect("lock");
            assert_eq!(guard.counter, 42);
            assert!(!guard.recovered());
        }

        let (second, created) =
            Segment::<TestBody>::create_or_attach(&key, 1, |_| panic!("init must not rerun"))
                .expect("attach");
        assert!(!created);
        {
            let mut guard = second.lock().expect("lock");
            guard.counter += 1;
        }
        let guard = segment.lock().expect("lock");
        assert_eq!(guard.counter, 43);
    }

    #[test]
    fn attach_existing_requires_a_segment() {
        let key = unique_key();
        match Segment::<TestBody>::attach_existing(&key) {
            Err(ShmemError::SegmentMissing(_)) => {}
            other => panic!("expected SegmentMissing, got {other:?}"),
        }
    }

    #[test]
    fn refcount_unlinks_on_last_detach() {
        let key = unique_key();
        let (first, _) =
            Segment::<TestBody>::create_or_attach(&key, 1, |_| ()).expect("create");
        let second = Segment::<TestBody>::attach_existing(&key).expect("attach");
        assert_eq!(first.attached_count().expect("count"), 2);

        second.detach().expect("detach");
        assert_eq!(first.attached_count().expect("count"), 1);
        first.detach().expect("detach");

        // Object gone: a fresh attach must fail.
        assert!(matches!(
            Segment::<TestBody>::attach_existing(&key),
            Err(ShmemError::SegmentMissing(_))
        ));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let key = unique_key();
        let (_segment, _) =
            Segment::<TestBody>::create_or_attach(&key, 1, |_| ()).expect("create");
        match Segment::<TestBodyV2>::attach_existing(&key) {
            Err(ShmemError::VersionMismatch { found, expected, .. }) => {
                assert_eq!(found, 7);
                assert_eq!(expected, 8);
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn stores_size_multiplier() {
        let key = unique_key();
        let (segment, _) =
            Segment::<TestBody>::create_or_attach(&key, 4, |_| ()).expect("create");
        assert_eq!(segment.size_multiplier(), 4);
    }
}
