//! Real-time mutexes
//!
//! [`RtMutex`] keeps its waiters in a [`PList`] ordered by priority. Releasing
//! the mutex hands the ownership directly to the most urgent waiter, which is
//! then woken up already owning the mutex. A context arriving later can't
//! barge in before it.
//!
//! A waiter ([`RtMutexWaiter`]) lives on the waiting context's stack. Both
//! [`RtMutex::release`] and [`RtMutex::try_to_cancel_wait`] claim a waiter by
//! moving it out of the `WAITING` state while holding the mutex's wait lock,
//! so exactly one of them gets to act on it.
//!
//! Priority inheritance is not implemented. The owner keeps running at its own
//! priority.
use core::{
    fmt,
    marker::PhantomPinned,
    pin::Pin,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    error::{LockCancelledError, LockTimeoutError, UnlockError},
    ktime::Ktime,
    ktimer::{KtimerBase, KtimerMode, Ktimer, StartFlags},
    plist::{NodeId, PList, Priority},
    port::PortThreading,
};

const WAITER_IDLE: u8 = 0;
const WAITER_WAITING: u8 = 1;
const WAITER_GRANTED: u8 = 2;
const WAITER_CANCELLED: u8 = 3;

const NODE_NONE: usize = usize::MAX;

/// How an acquisition relates the mutex to the calling context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    /// The acquiring context owns the mutex. Only it may release the mutex,
    /// and acquiring it again panics.
    Context,
    /// The mutex is held on behalf of a resource count, as in
    /// [`Semaphore`](crate::semaphore::Semaphore). Any context may release
    /// it, and the holder may wait for it again.
    Detached,
}

/// A context waiting for an [`RtMutex`]. Must be pinned because the mutex
/// refers to it while it's waiting.
pub struct RtMutexWaiter<P: PortThreading> {
    ctx: P::Context,
    prio: Priority,
    state: AtomicU8,
    /// The `NodeId` in the wait list, written with the wait lock held
    node: AtomicUsize,
    _pin: PhantomPinned,
}

impl<P: PortThreading> RtMutexWaiter<P> {
    /// Construct a waiter for the calling context.
    pub fn new(prio: Priority) -> Self {
        Self {
            ctx: P::current(),
            prio,
            state: AtomicU8::new(WAITER_IDLE),
            node: AtomicUsize::new(NODE_NONE),
            _pin: PhantomPinned,
        }
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.prio
    }

    /// Return `true` if the waiter is in a wait list.
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITER_WAITING
    }
}

impl<P: PortThreading> Drop for RtMutexWaiter<P> {
    fn drop(&mut self) {
        if self.is_waiting() {
            panic!("waiter dropped while waiting");
        }
    }
}

impl<P: PortThreading> fmt::Debug for RtMutexWaiter<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RtMutexWaiter")
            .field("ctx", &self.ctx)
            .field("prio", &self.prio)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

struct WaiterRef<P: PortThreading>(NonNull<RtMutexWaiter<P>>);

// Safety: `RtMutexWaiter` is `Sync`, and it stays alive while it's in a wait
//         list
unsafe impl<P: PortThreading> Send for WaiterRef<P> {}

impl<P: PortThreading> WaiterRef<P> {
    /// # Safety
    ///
    /// The waiter must be in the wait list, or have been removed from it
    /// with the wait lock still held.
    #[inline]
    unsafe fn get<'a>(&self) -> &'a RtMutexWaiter<P> {
        unsafe { &*self.0.as_ptr() }
    }
}

struct MutexState<P: PortThreading> {
    owner: Option<P::Context>,
    /// Non-empty only if `owner.is_some()`
    waiters: PList<WaiterRef<P>>,
}

/// A sleeping mutual exclusion primitive with priority-ordered hand-off.
pub struct RtMutex<P: PortThreading> {
    wait_lock: spin::Mutex<MutexState<P>>,
}

impl<P: PortThreading> RtMutex<P> {
    pub const fn new() -> Self {
        Self {
            wait_lock: spin::Mutex::new(MutexState {
                owner: None,
                waiters: PList::new(),
            }),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.wait_lock.lock().owner.is_some()
    }

    /// Get the owning context.
    pub fn owner(&self) -> Option<P::Context> {
        self.wait_lock.lock().owner.clone()
    }

    pub fn is_owned_by_current(&self) -> bool {
        self.wait_lock.lock().owner == Some(P::current())
    }

    pub fn has_waiters(&self) -> bool {
        !self.wait_lock.lock().waiters.is_empty()
    }

    /// Get the number of waiting contexts.
    pub fn num_waiters(&self) -> usize {
        self.wait_lock.lock().waiters.len()
    }

    /// Get the priority of the most urgent waiter.
    pub fn top_waiter_priority(&self) -> Option<Priority> {
        self.wait_lock.lock().waiters.first_prio()
    }

    /// Acquire the mutex if it's not owned by anyone.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.wait_lock.lock();
        if st.owner.is_none() {
            st.owner = Some(P::current());
            true
        } else {
            false
        }
    }

    /// Acquire the mutex, blocking the calling context for as long as
    /// necessary.
    ///
    /// # Panics
    ///
    /// Panics if the calling context already owns the mutex.
    pub fn acquire(&self, prio: Priority) {
        self.acquire_with(prio, Ownership::Context);
    }

    pub(crate) fn acquire_with(&self, prio: Priority, ownership: Ownership) {
        let waiter = RtMutexWaiter::<P>::new(prio);
        pin_utils::pin_mut!(waiter);
        // Nothing else can see `waiter`, so nothing can cancel the wait
        if self.acquire_cancellable_with(waiter.as_ref(), ownership).is_err() {
            unreachable!();
        }
    }

    /// Acquire the mutex using `waiter`, which must have been created by the
    /// calling context. The wait can be aborted by
    /// [`Self::try_to_cancel_wait`], in which case this method returns
    /// [`LockCancelledError::Interrupted`].
    ///
    /// # Panics
    ///
    /// Panics if the calling context already owns the mutex.
    pub fn acquire_cancellable(
        &self,
        waiter: Pin<&RtMutexWaiter<P>>,
    ) -> Result<(), LockCancelledError> {
        self.acquire_cancellable_with(waiter, Ownership::Context)
    }

    pub(crate) fn acquire_cancellable_with(
        &self,
        waiter: Pin<&RtMutexWaiter<P>>,
        ownership: Ownership,
    ) -> Result<(), LockCancelledError> {
        if self.enqueue(&waiter, ownership) {
            return Ok(());
        }
        self.wait(&waiter)
    }

    /// Acquire the mutex, giving up after `timeout` has passed on the clock of
    /// `base`.
    ///
    /// # Panics
    ///
    /// Panics if the calling context already owns the mutex.
    pub fn acquire_timeout(
        &self,
        prio: Priority,
        base: &KtimerBase<P>,
        timeout: Ktime,
    ) -> Result<(), LockTimeoutError> {
        self.acquire_timeout_with(prio, base, timeout, Ownership::Context)
    }

    pub(crate) fn acquire_timeout_with(
        &self,
        prio: Priority,
        base: &KtimerBase<P>,
        timeout: Ktime,
        ownership: Ownership,
    ) -> Result<(), LockTimeoutError> {
        struct Timeout<P: PortThreading> {
            mutex: *const RtMutex<P>,
            waiter: *const RtMutexWaiter<P>,
            fired: AtomicBool,
        }

        fn on_timeout<P: PortThreading>(data: usize) {
            // Safety: The timer is cancelled before `Timeout` goes out of
            //         scope. The waiter outlives the timer.
            let timeout = unsafe { &*(data as *const Timeout<P>) };
            let (mutex, waiter) = unsafe { (&*timeout.mutex, &*timeout.waiter) };
            if mutex.try_to_cancel_wait(waiter) {
                timeout.fired.store(true, Ordering::Release);
            }
        }

        if self.try_acquire() {
            return Ok(());
        }
        if !timeout.is_positive() {
            return Err(LockTimeoutError::Timeout);
        }

        let waiter = RtMutexWaiter::<P>::new(prio);
        pin_utils::pin_mut!(waiter);
        if self.enqueue(&waiter, ownership) {
            return Ok(());
        }

        let timeout_state = Timeout::<P> {
            mutex: self,
            waiter: &*waiter,
            fired: AtomicBool::new(false),
        };
        let timer = Ktimer::new(
            base,
            on_timeout::<P>,
            &timeout_state as *const Timeout<P> as usize,
        );
        pin_utils::pin_mut!(timer);
        let started = timer
            .as_ref()
            .start(timeout, KtimerMode::Rel, StartFlags::empty());
        // A relative start with any value is valid
        debug_assert!(started.is_ok());

        let result = self.wait(&waiter);
        timer.cancel();

        match result {
            Ok(()) => Ok(()),
            Err(_) => {
                debug_assert!(timeout_state.fired.load(Ordering::Acquire));
                log::trace!("rt_mutex {:p}: wait timed out", self);
                Err(LockTimeoutError::Timeout)
            }
        }
    }

    /// Take the mutex or link `waiter` into the wait list. Returns `true` in
    /// the former case.
    fn enqueue(&self, waiter: &RtMutexWaiter<P>, ownership: Ownership) -> bool {
        let mut st = self.wait_lock.lock();
        match &st.owner {
            None => {
                st.owner = Some(waiter.ctx.clone());
                return true;
            }
            Some(owner) if *owner == waiter.ctx && ownership == Ownership::Context => {
                panic!("recursive acquisition of an rt_mutex would deadlock");
            }
            Some(_) => {}
        }

        assert_eq!(
            waiter.state.load(Ordering::Relaxed),
            WAITER_IDLE,
            "waiter is already in use"
        );
        waiter.state.store(WAITER_WAITING, Ordering::Relaxed);
        let (id, max_changed) = st.waiters.insert(WaiterRef(NonNull::from(waiter)), waiter.prio);
        waiter.node.store(id.into_raw(), Ordering::Relaxed);

        log::trace!(
            "rt_mutex {:p}: {:?} waits with priority {} (top changed: {})",
            self,
            waiter.ctx,
            waiter.prio,
            max_changed
        );
        false
    }

    /// Park until `waiter` is granted or cancelled.
    fn wait(&self, waiter: &RtMutexWaiter<P>) -> Result<(), LockCancelledError> {
        loop {
            match waiter.state.load(Ordering::Acquire) {
                WAITER_GRANTED => {
                    waiter.state.store(WAITER_IDLE, Ordering::Relaxed);
                    return Ok(());
                }
                WAITER_CANCELLED => {
                    waiter.state.store(WAITER_IDLE, Ordering::Relaxed);
                    return Err(LockCancelledError::Interrupted);
                }
                _ => P::park(),
            }
        }
    }

    /// Release the mutex. If there are waiters, the most urgent one (the
    /// earliest among equals) becomes the owner.
    pub fn release(&self) -> Result<(), UnlockError> {
        self.release_with(Ownership::Context)
    }

    /// Release the mutex. With [`Ownership::Detached`], the caller doesn't
    /// have to be the owner, but the mutex must be locked.
    pub(crate) fn release_with(&self, ownership: Ownership) -> Result<(), UnlockError> {
        let mut st = self.wait_lock.lock();
        let permitted = match ownership {
            Ownership::Context => st.owner == Some(P::current()),
            Ownership::Detached => st.owner.is_some(),
        };
        if !permitted {
            return Err(UnlockError::NotOwner);
        }

        let next = match st.waiters.pop_highest() {
            Some(w) => {
                // Safety: It was in the list until now, and we hold the lock
                let waiter = unsafe { w.get() };
                // Clone it first; the waiter may disappear once it's granted
                let ctx = waiter.ctx.clone();
                waiter.node.store(NODE_NONE, Ordering::Relaxed);
                let claimed = waiter.state.compare_exchange(
                    WAITER_WAITING,
                    WAITER_GRANTED,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                debug_assert!(claimed.is_ok(), "a listed waiter wasn't waiting");
                st.owner = Some(ctx.clone());
                Some(ctx)
            }
            None => {
                st.owner = None;
                None
            }
        };
        drop(st);

        if let Some(ctx) = next {
            log::trace!("rt_mutex {:p}: handed off to {:?}", self, ctx);
            P::unpark(&ctx);
        }
        Ok(())
    }

    /// Remove `waiter` from the wait list, making its
    /// [`Self::acquire_cancellable`] call return
    /// [`LockCancelledError::Interrupted`].
    ///
    /// Returns `false` if `waiter` isn't waiting for this mutex, e.g.,
    /// because it has already been granted the ownership.
    pub fn try_to_cancel_wait(&self, waiter: &RtMutexWaiter<P>) -> bool {
        let mut st = self.wait_lock.lock();
        if waiter.state.load(Ordering::Acquire) != WAITER_WAITING {
            return false;
        }

        let id = NodeId::from_raw(waiter.node.load(Ordering::Relaxed));
        match st.waiters.get(id) {
            Some(w) if w.0 == NonNull::from(waiter) => {}
            // Waiting for another mutex
            _ => return false,
        }
        st.waiters.remove(id);
        waiter.node.store(NODE_NONE, Ordering::Relaxed);

        let ctx = waiter.ctx.clone();
        waiter.state.store(WAITER_CANCELLED, Ordering::Release);
        drop(st);

        log::trace!("rt_mutex {:p}: wait of {:?} cancelled", self, ctx);
        P::unpark(&ctx);
        true
    }
}

impl<P: PortThreading> Default for RtMutex<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PortThreading> fmt::Debug for RtMutex<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.wait_lock.lock();
        f.debug_struct("RtMutex")
            .field("owner", &st.owner)
            .field("num_waiters", &st.waiters.len())
            .field("top_waiter_priority", &st.waiters.first_prio())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ktimer::ClockId,
        test_utils::{init_logger, leak, set_priority, ManualClock, ThreadPort},
    };
    use std::{
        sync::{Arc, Mutex},
        thread,
        time::Duration,
        vec::Vec,
    };

    type M = RtMutex<ThreadPort>;

    /// Wait until `m` has `n` waiters.
    fn wait_for_waiters(m: &M, n: usize) {
        while m.num_waiters() != n {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn try_acquire_and_release() {
        init_logger();
        let m = M::new();
        assert!(!m.is_locked());
        assert_eq!(m.release(), Err(UnlockError::NotOwner));
        assert!(m.try_acquire());
        assert!(m.is_locked());
        assert!(m.is_owned_by_current());
        assert!(!m.try_acquire());

        thread::scope(|s| {
            s.spawn(|| {
                assert!(!m.try_acquire());
                assert!(!m.is_owned_by_current());
                assert_eq!(m.release(), Err(UnlockError::NotOwner));
            });
        });

        assert_eq!(m.release(), Ok(()));
        assert!(!m.is_locked());
        assert_eq!(m.owner(), None);
    }

    #[test]
    #[should_panic(expected = "would deadlock")]
    fn recursive_acquire() {
        let m = M::new();
        m.acquire(0);
        m.acquire(0);
    }

    #[test]
    fn hand_off_in_priority_order() {
        init_logger();
        let m = Arc::new(M::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        m.acquire(0);

        // Arrive in an order unrelated to the priorities
        let prios = [30, 10, 50, 20, 40, 10];
        let mut joins = Vec::new();
        for (i, &prio) in prios.iter().enumerate() {
            let m2 = Arc::clone(&m);
            let order = Arc::clone(&order);
            joins.push(thread::spawn(move || {
                set_priority(prio);
                m2.acquire(ThreadPort::current_priority());
                order.lock().unwrap().push((prio, i));
                m2.release().unwrap();
            }));
            wait_for_waiters(&m, i + 1);
        }
        assert_eq!(m.top_waiter_priority(), Some(10));
        assert!(m.has_waiters());

        m.release().unwrap();
        for j in joins {
            j.join().unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            [(10, 1), (10, 5), (20, 3), (30, 0), (40, 4), (50, 2)]
        );
        assert!(!m.is_locked());
        assert!(!m.has_waiters());
    }

    #[test]
    fn no_barging() {
        init_logger();
        let m = M::new();
        m.acquire(0);

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                m.acquire(5);
                let owned = m.is_owned_by_current();
                m.release().unwrap();
                owned
            });
            wait_for_waiters(&m, 1);

            m.release().unwrap();
            // The ownership already belongs to the waiter, even if it hasn't
            // run yet
            assert!(!m.try_acquire());
            assert!(waiter.join().unwrap());
        });
    }

    #[test]
    fn cancel_wait() {
        init_logger();
        let m = M::new();
        m.acquire(0);

        let m = &m;
        thread::scope(|s| {
            let (tx, rx) = std::sync::mpsc::channel();
            let waiter_thread = s.spawn(move || {
                let waiter = RtMutexWaiter::<ThreadPort>::new(7);
                pin_utils::pin_mut!(waiter);
                tx.send(&*waiter as *const RtMutexWaiter<ThreadPort> as usize)
                    .unwrap();
                m.acquire_cancellable(waiter.as_ref())
            });

            let waiter = rx.recv().unwrap();
            wait_for_waiters(&m, 1);
            // Safety: The waiter stays alive until its wait is resolved
            let waiter = unsafe { &*(waiter as *const RtMutexWaiter<ThreadPort>) };
            assert!(waiter.is_waiting());
            assert!(m.try_to_cancel_wait(waiter));

            assert_eq!(
                waiter_thread.join().unwrap(),
                Err(LockCancelledError::Interrupted)
            );
        });

        assert!(!m.has_waiters());
        assert!(m.is_owned_by_current());
        m.release().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn cancel_after_grant_fails() {
        init_logger();
        let m = M::new();
        let other = M::new();
        m.acquire(0);

        let m = &m;
        thread::scope(|s| {
            let (tx, rx) = std::sync::mpsc::channel::<usize>();
            let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
            let waiter_thread = s.spawn(move || {
                let waiter = RtMutexWaiter::<ThreadPort>::new(7);
                pin_utils::pin_mut!(waiter);
                tx.send(&*waiter as *const RtMutexWaiter<ThreadPort> as usize)
                    .unwrap();
                let result = m.acquire_cancellable(waiter.as_ref());
                // Keep the waiter alive until the main thread is done with it
                done_rx.recv().unwrap();
                result
            });

            let waiter = rx.recv().unwrap();
            wait_for_waiters(&m, 1);
            let waiter = unsafe { &*(waiter as *const RtMutexWaiter<ThreadPort>) };

            // Not waiting for `other`
            assert!(!other.try_to_cancel_wait(waiter));

            m.release().unwrap();
            // The release claimed it first
            assert!(!m.try_to_cancel_wait(waiter));
            done_tx.send(()).unwrap();

            assert_eq!(waiter_thread.join().unwrap(), Ok(()));
        });
    }

    #[test]
    fn release_cancel_race() {
        init_logger();
        for _ in 0..200 {
            let m = M::new();
            m.acquire(0);

            let m = &m;
            thread::scope(|s| {
                let (tx, rx) = std::sync::mpsc::channel::<usize>();
                let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
                let waiter_thread = s.spawn(move || {
                    let waiter = RtMutexWaiter::<ThreadPort>::new(1);
                    pin_utils::pin_mut!(waiter);
                    tx.send(&*waiter as *const RtMutexWaiter<ThreadPort> as usize)
                        .unwrap();
                    let result = m.acquire_cancellable(waiter.as_ref());
                    done_rx.recv().unwrap();
                    if result.is_ok() {
                        m.release().unwrap();
                    }
                    result
                });

                let waiter = rx.recv().unwrap();
                wait_for_waiters(&m, 1);
                let waiter = unsafe { &*(waiter as *const RtMutexWaiter<ThreadPort>) };

                let canceller = s.spawn(|| m.try_to_cancel_wait(waiter));
                m.release().unwrap();
                let cancelled = canceller.join().unwrap();
                done_tx.send(()).unwrap();

                // Exactly one of them acted on the waiter
                let result = waiter_thread.join().unwrap();
                assert_eq!(cancelled, result.is_err());
            });

            assert!(!m.is_locked());
        }
    }

    #[test]
    fn acquire_timeout() {
        init_logger();
        let clock = leak(ManualClock::new());
        let base = leak(KtimerBase::<ThreadPort>::new(
            ClockId::Monotonic,
            "test",
            Ktime::from_ns(1),
            clock,
        ));
        let m = M::new();

        // Free: no timer involved
        assert_eq!(m.acquire_timeout(0, base, Ktime::from_ns(100)), Ok(()));
        assert!(base.is_empty());

        thread::scope(|s| {
            // Owned by this thread, so the other thread times out
            let t = s.spawn(|| {
                assert_eq!(
                    m.acquire_timeout(0, base, Ktime::ZERO),
                    Err(LockTimeoutError::Timeout)
                );
                m.acquire_timeout(0, base, Ktime::from_ns(100))
            });
            wait_for_waiters(&m, 1);
            // The timer is started after the waiter is linked
            while base.len() != 1 {
                thread::sleep(Duration::from_millis(1));
            }

            clock.advance(100);
            base.run_queues();
            assert_eq!(t.join().unwrap(), Err(LockTimeoutError::Timeout));
        });
        assert!(!m.has_waiters());
        assert!(base.is_empty());

        // Released in time
        thread::scope(|s| {
            let t = s.spawn(|| {
                let r = m.acquire_timeout(0, base, Ktime::from_ns(100));
                m.release().unwrap();
                r
            });
            wait_for_waiters(&m, 1);
            m.release().unwrap();
            assert_eq!(t.join().unwrap(), Ok(()));
        });
        assert!(base.is_empty());
        assert!(!m.is_locked());
    }
}
