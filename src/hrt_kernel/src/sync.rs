//! Data-protecting locks
//!
//! [`Lock`] wraps a value and a [`RawLock`]. Two raw locks are provided:
//!
//!  - [`RawSpinLock`] busy-waits.
//!  - [`RtMutex`] puts the waiting context to sleep and hands the ownership
//!    over in priority order.
//!
//! [`SpinLock`] is what the rest of a system should use for short critical
//! sections. With the `preempt_rt` feature it's backed by [`RtMutex`], so
//! contended critical sections sleep instead of spinning.
use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use crate::{port::PortThreading, rt_mutex::RtMutex};

/// A lock without the data it protects.
///
/// # Safety
///
/// While `lock` or a successful `try_lock` is followed by no `unlock`, no
/// other call to `lock` may return and no other `try_lock` may succeed.
pub unsafe trait RawLock: Send + Sync {
    /// Acquire the lock, waiting for as long as necessary.
    fn lock(&self);

    /// Acquire the lock if it's available.
    fn try_lock(&self) -> bool;

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling context must be holding the lock.
    unsafe fn unlock(&self);

    fn is_locked(&self) -> bool;
}

/// A busy-waiting [`RawLock`].
pub struct RawSpinLock<P: PortThreading> {
    inner: spin::Mutex<()>,
    #[cfg(feature = "debug_lock")]
    owner: spin::Mutex<Option<P::Context>>,
    _phantom: PhantomData<fn() -> P>,
}

impl<P: PortThreading> RawSpinLock<P> {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(()),
            #[cfg(feature = "debug_lock")]
            owner: spin::Mutex::new(None),
            _phantom: PhantomData,
        }
    }

    #[cfg(feature = "debug_lock")]
    fn check_not_owner(&self) {
        if *self.owner.lock() == Some(P::current()) {
            panic!("recursive acquisition of a spinlock would deadlock");
        }
    }

    #[cfg(feature = "debug_lock")]
    fn set_owner(&self, owner: Option<P::Context>) {
        *self.owner.lock() = owner;
    }
}

impl<P: PortThreading> Default for RawSpinLock<P> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<P: PortThreading> RawLock for RawSpinLock<P> {
    fn lock(&self) {
        #[cfg(feature = "debug_lock")]
        self.check_not_owner();

        core::mem::forget(self.inner.lock());

        #[cfg(feature = "debug_lock")]
        self.set_owner(Some(P::current()));
    }

    fn try_lock(&self) -> bool {
        match self.inner.try_lock() {
            Some(guard) => {
                core::mem::forget(guard);
                #[cfg(feature = "debug_lock")]
                self.set_owner(Some(P::current()));
                true
            }
            None => false,
        }
    }

    unsafe fn unlock(&self) {
        #[cfg(feature = "debug_lock")]
        {
            let mut owner = self.owner.lock();
            assert!(
                *owner == Some(P::current()),
                "spinlock released by a non-owner"
            );
            *owner = None;
        }

        // Safety: The guard was forgotten in `lock` or `try_lock`
        unsafe { self.inner.force_unlock() };
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<P: PortThreading> fmt::Debug for RawSpinLock<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawSpinLock")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

unsafe impl<P: PortThreading> RawLock for RtMutex<P> {
    fn lock(&self) {
        self.acquire(P::current_priority());
    }

    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    unsafe fn unlock(&self) {
        if self.release().is_err() {
            panic!("rt_mutex released by a non-owner");
        }
    }

    fn is_locked(&self) -> bool {
        RtMutex::is_locked(self)
    }
}

/// A value protected by a [`RawLock`].
pub struct Lock<R, T: ?Sized> {
    raw: R,
    data: UnsafeCell<T>,
}

/// Protects its value with a [`RawSpinLock`], or an [`RtMutex`] if the
/// `preempt_rt` feature is enabled.
#[cfg(not(feature = "preempt_rt"))]
pub type SpinLock<P, T> = Lock<RawSpinLock<P>, T>;

/// Protects its value with a [`RawSpinLock`], or an [`RtMutex`] if the
/// `preempt_rt` feature is enabled.
#[cfg(feature = "preempt_rt")]
pub type SpinLock<P, T> = Lock<RtMutex<P>, T>;

/// Protects its value with an [`RtMutex`].
pub type RtLock<P, T> = Lock<RtMutex<P>, T>;

// Safety: Only one context at a time can access `data`
unsafe impl<R: RawLock, T: ?Sized + Send> Sync for Lock<R, T> {}

impl<P: PortThreading, T> Lock<RawSpinLock<P>, T> {
    pub const fn new(x: T) -> Self {
        Self::with_raw(RawSpinLock::new(), x)
    }
}

impl<P: PortThreading, T> Lock<RtMutex<P>, T> {
    pub const fn new(x: T) -> Self {
        Self::with_raw(RtMutex::new(), x)
    }
}

impl<R, T> Lock<R, T> {
    pub const fn with_raw(raw: R, x: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(x),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<R: RawLock, T: ?Sized> Lock<R, T> {
    pub fn lock(&self) -> LockGuard<'_, R, T> {
        self.raw.lock();
        LockGuard {
            lock: self,
            _no_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<LockGuard<'_, R, T>> {
        if self.raw.try_lock() {
            Some(LockGuard {
                lock: self,
                _no_send: PhantomData,
            })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[inline]
    pub fn raw(&self) -> &R {
        &self.raw
    }

    /// Get a mutable reference to the contained value. No locking is needed
    /// because `self` is borrowed mutably.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<R: RawLock + Default, T: Default> Default for Lock<R, T> {
    fn default() -> Self {
        Self::with_raw(R::default(), T::default())
    }
}

impl<R: RawLock, T: ?Sized + fmt::Debug> fmt::Debug for Lock<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_tuple("Lock").field(&&*guard).finish(),
            None => f.write_str("Lock(< locked >)"),
        }
    }
}

/// RAII guard of [`Lock`]. Must be dropped by the context that created it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, R: RawLock, T: ?Sized> {
    lock: &'a Lock<R, T>,
    _no_send: PhantomData<*const ()>,
}

unsafe impl<R: RawLock, T: ?Sized + Sync> Sync for LockGuard<'_, R, T> {}

impl<R: RawLock, T: ?Sized> Deref for LockGuard<'_, R, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T: ?Sized> DerefMut for LockGuard<'_, R, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T: ?Sized> Drop for LockGuard<'_, R, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: We hold the lock, and `LockGuard` is `!Send`
        unsafe { self.lock.raw.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_logger, set_priority, ThreadPort};
    use std::{sync::Arc, thread, vec::Vec};

    fn exercise<R: RawLock + 'static>(lock: Arc<Lock<R, (u64, u64)>>) {
        let joins: Vec<_> = (0..4)
            .map(|i| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    set_priority(i);
                    for _ in 0..2000 {
                        let mut g = lock.lock();
                        // Torn updates would show up as `0 != 1`
                        g.0 += 1;
                        thread::yield_now();
                        g.1 += 1;
                    }
                })
            })
            .collect();
        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(*lock.lock(), (8000, 8000));
        assert!(!lock.is_locked());
    }

    #[test]
    fn spin_lock_excludes() {
        init_logger();
        exercise(Arc::new(Lock::<RawSpinLock<ThreadPort>, _>::new((0, 0))));
    }

    #[test]
    fn rt_lock_excludes() {
        init_logger();
        exercise(Arc::new(RtLock::<ThreadPort, _>::new((0, 0))));
    }

    #[test]
    fn default_spin_lock_excludes() {
        init_logger();
        exercise(Arc::new(SpinLock::<ThreadPort, _>::new((0, 0))));
    }

    #[test]
    fn try_lock() {
        let lock = SpinLock::<ThreadPort, u32>::new(1);
        let g = lock.lock();
        assert!(lock.is_locked());
        thread::scope(|s| {
            s.spawn(|| assert!(lock.try_lock().is_none()));
        });
        assert_eq!(format!("{:?}", lock), "Lock(< locked >)");
        drop(g);

        *lock.try_lock().unwrap() += 1;
        assert_eq!(format!("{:?}", lock), "Lock(2)");
        assert_eq!(lock.into_inner(), 2);
    }

    #[test]
    fn get_mut() {
        let mut lock = RtLock::<ThreadPort, Vec<u8>>::default();
        lock.get_mut().push(4);
        assert_eq!(*lock.lock(), [4]);
        assert!(!lock.raw().is_locked());
    }

    #[cfg(feature = "debug_lock")]
    #[test]
    #[should_panic(expected = "would deadlock")]
    fn recursive_spin_lock() {
        let lock = RawSpinLock::<ThreadPort>::new();
        lock.lock();
        lock.lock();
    }
}
