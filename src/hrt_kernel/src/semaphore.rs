//! Counting semaphores built on [`RtMutex`]
//!
//! The mutex is held while the count is zero. [`Semaphore::down`] takes the
//! mutex, decrements the count, and lets the mutex go again unless it took
//! the last unit. [`Semaphore::up`] releases the mutex on the transition from
//! zero to one. Waiters are therefore served in the priority order of the
//! mutex's wait list.
//!
//! The mutex isn't tied to a context here: any context may call `up`, and the
//! context that took the last unit may wait for another one.
use core::{
    fmt,
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::{LockCancelledError, LockTimeoutError},
    ktime::Ktime,
    ktimer::KtimerBase,
    plist::Priority,
    port::PortThreading,
    rt_mutex::{Ownership, RtMutex, RtMutexWaiter},
};

/// A counting semaphore with priority-ordered wake-ups.
pub struct Semaphore<P: PortThreading> {
    count: AtomicUsize,
    lock: RtMutex<P>,
}

impl<P: PortThreading> Semaphore<P> {
    /// Construct a semaphore holding `count` units.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero. A semaphore can't start out locked because
    /// its mutex would have no holder.
    pub const fn new(count: usize) -> Self {
        if count == 0 {
            panic!("a semaphore must start with at least one unit");
        }
        Self {
            count: AtomicUsize::new(count),
            lock: RtMutex::new(),
        }
    }

    /// Get the number of available units.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Return `true` if no unit is available.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.count() == 0
    }

    /// Get the number of contexts waiting for a unit.
    pub fn num_waiters(&self) -> usize {
        self.lock.num_waiters()
    }

    /// Take a unit, blocking the calling context until one is available.
    pub fn down(&self, prio: Priority) {
        self.lock.acquire_with(prio, Ownership::Detached);
        self.down_complete();
    }

    /// Take a unit using `waiter`. The wait can be aborted by
    /// [`Self::try_to_cancel_wait`].
    pub fn down_cancellable(
        &self,
        waiter: Pin<&RtMutexWaiter<P>>,
    ) -> Result<(), LockCancelledError> {
        self.lock
            .acquire_cancellable_with(waiter, Ownership::Detached)?;
        self.down_complete();
        Ok(())
    }

    /// Take a unit, giving up after `timeout` has passed on the clock of
    /// `base`.
    pub fn down_timeout(
        &self,
        prio: Priority,
        base: &KtimerBase<P>,
        timeout: Ktime,
    ) -> Result<(), LockTimeoutError> {
        self.lock
            .acquire_timeout_with(prio, base, timeout, Ownership::Detached)?;
        self.down_complete();
        Ok(())
    }

    /// Take a unit if one is available without blocking.
    pub fn try_down(&self) -> bool {
        if self.lock.try_acquire() {
            self.down_complete();
            true
        } else {
            false
        }
    }

    /// Abort the wait of a [`Self::down_cancellable`] call.
    pub fn try_to_cancel_wait(&self, waiter: &RtMutexWaiter<P>) -> bool {
        self.lock.try_to_cancel_wait(waiter)
    }

    /// Return a unit, waking up the most urgent waiter if the count was
    /// zero.
    pub fn up(&self) {
        let old = self.count.fetch_add(1, Ordering::AcqRel);
        if old == 0 {
            // The mutex is held whenever the count is zero
            let released = self.lock.release_with(Ownership::Detached);
            debug_assert!(released.is_ok(), "semaphore count out of sync");
        }
    }

    /// Called with the mutex held.
    fn down_complete(&self) {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(old, 0, "semaphore count out of sync");
        if old > 1 {
            // Units are left for others
            let released = self.lock.release_with(Ownership::Detached);
            debug_assert!(released.is_ok());
        }
    }
}

impl<P: PortThreading> fmt::Debug for Semaphore<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .field("lock", &self.lock)
            .finish()
    }
}
