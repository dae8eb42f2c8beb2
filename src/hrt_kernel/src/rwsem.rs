//! Reader-writer semaphores built on [`RtMutex`]
//!
//! Only one context holds an [`RwSemaphore`] at a time, whether it took it
//! for reading or for writing. Readers are not admitted concurrently. The
//! holder may take further read locks recursively, which are counted in
//! `read_depth`. Every acquisition goes through the mutex's priority-ordered
//! wait list, so readers and writers are served in the same order.
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{error::UnlockError, plist::Priority, port::PortThreading, rt_mutex::RtMutex};

/// A reader-writer semaphore with a single holder.
pub struct RwSemaphore<P: PortThreading> {
    lock: RtMutex<P>,
    /// Read locks nested inside the holder's outermost acquisition. Only
    /// touched by the holder.
    read_depth: AtomicUsize,
}

impl<P: PortThreading> RwSemaphore<P> {
    pub const fn new() -> Self {
        Self {
            lock: RtMutex::new(),
            read_depth: AtomicUsize::new(0),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Get the number of read locks nested inside the holder's outermost
    /// acquisition.
    #[inline]
    pub fn read_depth(&self) -> usize {
        self.read_depth.load(Ordering::Relaxed)
    }

    /// Get the number of contexts waiting for the semaphore.
    pub fn num_waiters(&self) -> usize {
        self.lock.num_waiters()
    }

    /// Take a read lock. Succeeds immediately if the calling context already
    /// holds the semaphore.
    pub fn down_read(&self, prio: Priority) {
        if self.nest_read() {
            return;
        }
        self.lock.acquire(prio);
    }

    /// Take a read lock without blocking.
    pub fn try_down_read(&self) -> bool {
        self.nest_read() || self.lock.try_acquire()
    }

    /// Take a write lock.
    ///
    /// # Panics
    ///
    /// Panics if the calling context already holds the semaphore.
    pub fn down_write(&self, prio: Priority) {
        self.lock.acquire(prio);
    }

    /// Take a write lock without blocking.
    pub fn try_down_write(&self) -> bool {
        self.lock.try_acquire()
    }

    /// Release a read lock. The semaphore is released when the outermost
    /// acquisition is undone.
    pub fn up_read(&self) -> Result<(), UnlockError> {
        if !self.lock.is_owned_by_current() {
            return Err(UnlockError::NotOwner);
        }
        let depth = self.read_depth();
        if depth > 0 {
            self.read_depth.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }
        self.lock.release()
    }

    /// Release a write lock.
    ///
    /// # Panics
    ///
    /// Panics if read locks taken inside the write lock are still held.
    pub fn up_write(&self) -> Result<(), UnlockError> {
        if self.lock.is_owned_by_current() && self.read_depth() != 0 {
            panic!("write lock released with nested read locks held");
        }
        self.lock.release()
    }

    /// Turn the calling context's write lock into a read lock. Other readers
    /// are still excluded because readers don't share the semaphore.
    pub fn downgrade_write(&self) -> Result<(), UnlockError> {
        if !self.lock.is_owned_by_current() {
            return Err(UnlockError::NotOwner);
        }
        log::trace!("rwsem {:p}: write lock downgraded", self);
        Ok(())
    }

    /// Count a nested read lock if the calling context is the holder.
    fn nest_read(&self) -> bool {
        // Only the holder can make this true, and only the holder can
        // change it afterward
        if self.lock.is_owned_by_current() {
            self.read_depth.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl<P: PortThreading> Default for RwSemaphore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PortThreading> fmt::Debug for RwSemaphore<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RwSemaphore")
            .field("lock", &self.lock)
            .field("read_depth", &self.read_depth())
            .finish()
    }
}
