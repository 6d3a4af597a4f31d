//! Cross-process table lock
//!
//! The whole table is guarded by one binary semaphore stored inside the
//! head region and initialized process-shared, so every attached process
//! blocks on the same object. Callers go through `TableLock` so another
//! locking scheme can replace the semaphore without touching them.

use crate::common::{Error, Result};
use std::io;
use std::ptr::NonNull;

pub trait TableLock {
    /// Block until this process owns the lock.
    fn acquire(&self) -> Result<()>;

    /// Give the lock up, waking one waiter.
    fn release(&self) -> Result<()>;

    /// Acquire and hand back a guard that releases on drop.
    fn lock(&self) -> Result<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        self.acquire()?;
        Ok(LockGuard { lock: self })
    }
}

/// Releases the lock when dropped, including on error paths.
pub struct LockGuard<'a, L: TableLock> {
    lock: &'a L,
}

impl<L: TableLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::error!("Failed to release table lock: {}", e);
        }
    }
}

/// POSIX unnamed semaphore living in shared memory.
pub struct SemaphoreLock {
    sem: NonNull<libc::sem_t>,
}

impl SemaphoreLock {
    /// Initialize a fresh process-shared semaphore with value 1.
    ///
    /// # Safety
    /// `sem` must point to writable shared memory that outlives the returned
    /// lock and every lock later attached to it, and no other process may be
    /// using it yet.
    pub unsafe fn init(sem: NonNull<libc::sem_t>) -> Result<Self> {
        if libc::sem_init(sem.as_ptr(), 1, 1) == -1 {
            return Err(Error::resource(
                "sem_init",
                "table lock",
                io::Error::last_os_error(),
            ));
        }
        Ok(Self { sem })
    }

    /// Use a semaphore another process already initialized.
    ///
    /// # Safety
    /// `sem` must point to a semaphore set up by `init` that outlives the
    /// returned lock.
    pub unsafe fn attach(sem: NonNull<libc::sem_t>) -> Self {
        Self { sem }
    }

    /// Tear the semaphore down. No process may be blocked on it.
    pub fn destroy(self) -> Result<()> {
        // Safety: the semaphore was initialized and is still mapped
        if unsafe { libc::sem_destroy(self.sem.as_ptr()) } == -1 {
            return Err(Error::resource(
                "sem_destroy",
                "table lock",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

impl TableLock for SemaphoreLock {
    fn acquire(&self) -> Result<()> {
        loop {
            // Safety: the semaphore stays mapped for the lifetime of self
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::resource("sem_wait", "table lock", err));
            }
        }
    }

    fn release(&self) -> Result<()> {
        // Safety: the semaphore stays mapped for the lifetime of self
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == -1 {
            return Err(Error::resource(
                "sem_post",
                "table lock",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

// The semaphore is process-shared; any thread may block on it.
unsafe impl Send for SemaphoreLock {}
