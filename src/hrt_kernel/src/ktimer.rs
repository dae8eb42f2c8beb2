//! High-resolution timers
//!
//! A [`KtimerBase`] holds the pending timers of one clock, ordered by
//! (expiry, priority, insertion order). [`KtimerBase::run_queues`] fires every
//! timer whose expiry has been reached. It's called from the interrupt path of
//! a clockevent device bound by [`KtimerBase::bind_clockevent`] (high-resolution
//! mode), or periodically by the port (low-resolution mode).
//!
//! A [`Ktimer`] is an intrusive object: the base refers to it while it's
//! queued or running, so it has to be pinned before it's started and may not
//! be dropped while active.
use alloc::vec::Vec;
use bitflags::bitflags;
use core::{
    fmt,
    marker::PhantomPinned,
    pin::Pin,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    clockevent::{ClockEvent, ClockEventHandler},
    error::{CancelTimerError, ProgramEventError, StartTimerError},
    ktime::Ktime,
    plist::Priority,
    port::PortThreading,
    timekeeping::GetTime,
    utils::binary_heap::{BinaryHeap, BinaryHeapCtx},
};


/// Identifies the clock a [`KtimerBase`] measures time with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockId {
    /// Never jumps. Unaffected by changes to the wall-clock time.
    Monotonic,
    /// The wall-clock time. May jump on [`Timekeeper::settimeofday`].
    ///
    /// [`Timekeeper::settimeofday`]: crate::timekeeping::Timekeeper::settimeofday
    Realtime,
}

/// The state of a [`Ktimer`].
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///             start                      run_queues
///   .----------. ----> .---------. -------------------.
///   | Inactive |       | Pending |                    |
///   '----------' <---- '---------' <--.               v
///     ^   ^    cancel      ^          |      .-----------------.
///     |   |                |          '----- | ExpiredDequeued |
///     |   |    start       |   rearm         '-----------------'
///     |   |  (past, no     |                    |
///     |   |   NOCHECK)     | run_queues         | callback returns,
///     |   |    .---------. |                    | no interval
///     |   '----| Expired |-'                    |
///     | cancel '---------'                      |
///     '-----------------------------------------'
/// ```
)]
///
/// </center>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KtimerState {
    /// Not queued.
    Inactive = 0,
    /// Queued and waiting for its expiry.
    Pending = 1,
    /// Queued with an expiry that had already passed when it was started.
    /// Fires on the next [`KtimerBase::run_queues`].
    Expired = 2,
    /// Removed from the queue, the callback is running.
    ExpiredDequeued = 3,
}

impl KtimerState {
    fn from_u8(x: u8) -> Self {
        match x {
            1 => Self::Pending,
            2 => Self::Expired,
            3 => Self::ExpiredDequeued,
            _ => Self::Inactive,
        }
    }

    #[inline]
    fn is_queued(self) -> bool {
        matches!(self, Self::Pending | Self::Expired)
    }
}

/// How [`Ktimer::start`] interprets its time argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KtimerMode {
    /// The time value is the absolute expiry.
    Abs,
    /// The time value is relative to now.
    Rel,
    /// The time value is relative to the previous expiry.
    Incr,
    /// The time value becomes the interval, and the previous expiry is
    /// advanced past now by whole intervals. The skipped intervals are added
    /// to the overrun counter.
    Forward,
    /// Like `Forward`, but uses the stored interval. The time value is
    /// ignored.
    Rearm,
    /// The previous expiry is reused. The time value is ignored.
    Restart,
}

bitflags! {
    /// Options for [`Ktimer::start`].
    pub struct StartFlags: u32 {
        /// Don't check the expiry against the current time.
        const NOCHECK = 1 << 0;
        /// Round the time value up to the resolution of the base.
        const ROUND = 1 << 1;
    }
}

const HEAP_POS_NONE: usize = usize::MAX;

/// The part of a [`Ktimer`] the base refers to. All fields are written with
/// the base's lock held.
struct TimerCore {
    expires: AtomicI64,
    /// The time when the timer was dequeued by `run_queues`
    expired: AtomicI64,
    interval: AtomicI64,
    state: AtomicU8,
    overrun: AtomicU64,
    heap_pos: AtomicUsize,
    callback: fn(usize),
    data: usize,
    prio: Priority,
}

impl TimerCore {
    #[inline]
    fn state(&self) -> KtimerState {
        KtimerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: KtimerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    fn expires(&self) -> Ktime {
        Ktime::from_ns(self.expires.load(Ordering::Relaxed))
    }

    #[inline]
    fn interval(&self) -> Ktime {
        Ktime::from_ns(self.interval.load(Ordering::Relaxed))
    }

    fn add_overrun(&self, orun: u64) {
        if orun == 0 {
            return;
        }
        let _ = self
            .overrun
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_add(orun))
            });
    }

    /// Advance `expires` past `now`. Returns the number of intervals added.
    fn forward(&self, now: Ktime) -> u64 {
        let (expires, orun) = forward_expiry(self.expires(), self.interval(), now);
        self.expires.store(expires.to_ns(), Ordering::Relaxed);
        orun
    }
}

/// Calculate the first expiry after `now` that is `expires` plus a whole
/// multiple of `interval`. Returns the new expiry and the multiple.
///
/// Does nothing if `now < expires` or `interval` isn't positive.
pub fn forward_expiry(expires: Ktime, interval: Ktime, now: Ktime) -> (Ktime, u64) {
    if now < expires || !interval.is_positive() {
        return (expires, 0);
    }

    let delta = now.to_ns() as i128 - expires.to_ns() as i128;
    let interval = interval.to_ns() as i128;

    let mut orun = (delta + interval - 1) / interval;
    let mut new_expires = expires.to_ns() as i128 + orun * interval;
    if new_expires <= now.to_ns() as i128 {
        new_expires += interval;
        orun += 1;
    }

    (
        Ktime::from_ns(new_expires.min(i64::MAX as i128) as i64),
        orun.min(u64::MAX as i128) as u64,
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct TimerRef(NonNull<TimerCore>);

// Safety: `TimerCore` is `Sync`, and it outlives every `TimerRef` to it
//         (`Ktimer`'s destructor unlinks the timer and waits for its
//         callback)
unsafe impl Send for TimerRef {}

impl TimerRef {
    /// # Safety
    ///
    /// The referent must still be linked to the base or running.
    #[inline]
    unsafe fn get<'a>(self) -> &'a TimerCore {
        unsafe { &*self.0.as_ptr() }
    }
}

struct HeapEntry {
    expires: Ktime,
    prio: Priority,
    seq: u64,
    timer: TimerRef,
}

impl HeapEntry {
    #[inline]
    fn key(&self) -> (Ktime, Priority, u64) {
        (self.expires, self.prio, self.seq)
    }
}

struct HeapCtx;

impl BinaryHeapCtx<HeapEntry> for HeapCtx {
    #[inline]
    fn lt(&mut self, x: &HeapEntry, y: &HeapEntry) -> bool {
        x.key() < y.key()
    }

    #[inline]
    fn on_move(&mut self, e: &mut HeapEntry, new_index: usize) {
        // Safety: The timer is linked
        unsafe { e.timer.get() }
            .heap_pos
            .store(new_index, Ordering::Relaxed);
    }
}

struct BaseInner<P: PortThreading> {
    heap: Vec<HeapEntry>,
    seq: u64,
    /// The timer whose callback is running, and who is running it
    running: Option<(TimerRef, P::Context)>,
    /// Contexts parked in `Ktimer::cancel` until `running` is cleared
    cancel_waiters: Vec<P::Context>,
    in_run_queues: bool,
    /// `run_queues` was called while another pass was in progress
    rerun: bool,
}

/// The timer queue of one clock.
pub struct KtimerBase<P: PortThreading> {
    clock: ClockId,
    name: &'static str,
    resolution: Ktime,
    get_time: &'static dyn GetTime,
    inner: spin::Mutex<BaseInner<P>>,
    event_dev: spin::RwLock<Option<&'static ClockEvent>>,
}

impl<P: PortThreading> KtimerBase<P> {
    pub const fn new(
        clock: ClockId,
        name: &'static str,
        resolution: Ktime,
        get_time: &'static dyn GetTime,
    ) -> Self {
        Self {
            clock,
            name,
            resolution,
            get_time,
            inner: spin::Mutex::new(BaseInner {
                heap: Vec::new(),
                seq: 0,
                running: None,
                cancel_waiters: Vec::new(),
                in_run_queues: false,
                rerun: false,
            }),
            event_dev: spin::RwLock::new(None),
        }
    }

    #[inline]
    pub fn clock_id(&self) -> ClockId {
        self.clock
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the current time of this base's clock.
    #[inline]
    pub fn now(&self) -> Ktime {
        self.get_time.now()
    }

    /// Get the resolution. Timer expiries are rounded up to a multiple of
    /// this value when [`StartFlags::ROUND`] is given.
    #[inline]
    pub fn get_res(&self) -> Ktime {
        self.resolution
    }

    /// Round `t` up to the resolution.
    #[inline]
    pub fn round(&self, t: Ktime) -> Ktime {
        t.round_up(self.resolution)
    }

    /// Get the expiry of the earliest queued timer.
    pub fn next_expiry(&self) -> Option<Ktime> {
        self.inner.lock().heap.first().map(|e| e.expires)
    }

    /// Get the number of queued timers.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the clockevent device driving this base, if any.
    pub fn clockevent(&self) -> Option<&'static ClockEvent> {
        *self.event_dev.read()
    }

    /// Return `true` if a clockevent device has been bound.
    pub fn is_hres(&self) -> bool {
        self.clockevent().is_some()
    }

    /// Drive this base by `dev` from now on (high-resolution mode). `dev`
    /// must be in [`Oneshot`] mode, and its driver must deliver events
    /// asynchronously (not from within `set_next_event`).
    ///
    /// [`Oneshot`]: crate::clockevent::ClockEventMode::Oneshot
    pub fn bind_clockevent(&'static self, dev: &'static ClockEvent) {
        log::debug!("ktimer base {:?}: bound to clockevent {:?}", self.name, dev.name);
        dev.set_handler(self);
        *self.event_dev.write() = Some(dev);

        let inner = self.inner.lock();
        self.reprogram(&inner, true);
    }

    /// Stop using the bound clockevent device.
    pub fn unbind_clockevent(&self) {
        if let Some(dev) = self.event_dev.write().take() {
            dev.clear_handler();
            log::debug!("ktimer base {:?}: unbound from {:?}", self.name, dev.name);
        }
    }

    /// Fire every timer whose expiry is not later than the current time.
    ///
    /// Each callback runs with the base unlocked, so it may start, cancel, or
    /// forward any timer including its own. A periodic timer whose callback
    /// leaves it alone is advanced past the current time and requeued; the
    /// intervals that were skipped are added to its overrun counter.
    pub fn run_queues(&self) {
        let mut inner = self.inner.lock();
        if inner.in_run_queues {
            inner.rerun = true;
            return;
        }
        inner.in_run_queues = true;
        let me = P::current();

        loop {
            inner.rerun = false;
            let now = self.get_time.now();

            loop {
                if !inner.heap.first().map_or(false, |e| e.expires <= now) {
                    break;
                }
                let Some(entry) = inner.heap.heap_pop(HeapCtx) else {
                    break;
                };

                // Safety: The timer was linked until now. `Ktimer`'s
                //         destructor waits while `running` refers to it.
                let timer = unsafe { entry.timer.get() };
                timer.heap_pos.store(HEAP_POS_NONE, Ordering::Relaxed);
                timer.expired.store(now.to_ns(), Ordering::Relaxed);
                timer.set_state(KtimerState::ExpiredDequeued);
                inner.running = Some((entry.timer, me.clone()));

                log::trace!(
                    "ktimer base {:?}: firing {:p} (expires = {:?}, now = {:?})",
                    self.name,
                    timer,
                    entry.expires,
                    now
                );

                let (callback, data) = (timer.callback, timer.data);
                drop(inner);
                let guard = UnwindGuard { base: self, timer };
                callback(data);
                core::mem::forget(guard);
                inner = self.inner.lock();

                // The callback may have cancelled (`Inactive`) or restarted
                // (`Pending`) the timer. Those are left alone.
                if timer.state() == KtimerState::ExpiredDequeued {
                    if timer.interval().is_positive() {
                        let orun = timer.forward(now);
                        timer.add_overrun(orun.saturating_sub(1));
                        log::trace!(
                            "ktimer base {:?}: rearming {:p} at {:?} (overrun += {})",
                            self.name,
                            timer,
                            timer.expires(),
                            orun.saturating_sub(1)
                        );
                        self.enqueue(&mut inner, entry.timer, KtimerState::Pending);
                    } else {
                        timer.set_state(KtimerState::Inactive);
                    }
                }
                inner.running = None;
                for ctx in inner.cancel_waiters.drain(..) {
                    P::unpark(&ctx);
                }
            }

            if !inner.rerun {
                break;
            }
        }

        inner.in_run_queues = false;
        self.reprogram(&inner, true);
    }

    /// Re-evaluate the queue after the clock jumped. Timers that became due
    /// fire immediately, and the clockevent device is reprogrammed for the
    /// rest.
    pub fn clock_was_set(&self) {
        log::debug!("ktimer base {:?}: clock was set", self.name);
        self.run_queues();
    }

    /// Block the calling context for `tim` (interpreted according to `mode`).
    pub fn nanosleep(&self, tim: Ktime, mode: KtimerMode) -> Result<(), StartTimerError> {
        struct Sleeper<P: PortThreading> {
            ctx: P::Context,
            done: AtomicBool,
        }

        fn wake<P: PortThreading>(data: usize) {
            // Safety: `data` points to the `Sleeper` below, which outlives
            //         the timer
            let sleeper = unsafe { &*(data as *const Sleeper<P>) };
            // The sleeper may return as soon as `done` is set
            let ctx = sleeper.ctx.clone();
            sleeper.done.store(true, Ordering::Release);
            P::unpark(&ctx);
        }

        let sleeper = Sleeper::<P> {
            ctx: P::current(),
            done: AtomicBool::new(false),
        };
        let timer = Ktimer::new(self, wake::<P>, &sleeper as *const Sleeper<P> as usize);
        pin_utils::pin_mut!(timer);

        timer.as_ref().start(tim, mode, StartFlags::ROUND)?;
        while !sleeper.done.load(Ordering::Acquire) {
            P::park();
        }

        // `timer`'s destructor waits until `run_queues` lets go of it
        Ok(())
    }

    /// Insert `timer` into the queue. Doesn't touch the timer's fields other
    /// than `state` and `heap_pos`.
    fn enqueue(&self, inner: &mut BaseInner<P>, timer: TimerRef, state: KtimerState) {
        // Safety: The caller owns a pinned reference to the timer
        let core = unsafe { timer.get() };
        inner.seq += 1;
        let entry = HeapEntry {
            expires: core.expires(),
            prio: core.prio,
            seq: inner.seq,
            timer,
        };
        core.set_state(state);
        let pos = inner.heap.heap_push(entry, HeapCtx);

        if pos == 0 && !inner.in_run_queues {
            self.reprogram(inner, false);
        }
    }

    /// Remove `core` from the queue.
    fn dequeue(&self, inner: &mut BaseInner<P>, core: &TimerCore) {
        let pos = core.heap_pos.load(Ordering::Relaxed);
        let entry = inner.heap.heap_remove(pos, HeapCtx);
        debug_assert!(
            entry.map_or(false, |e| core::ptr::eq(e.timer.0.as_ptr(), core)),
            "timer queue is corrupted"
        );
        core.heap_pos.store(HEAP_POS_NONE, Ordering::Relaxed);
    }

    /// Program the bound clockevent device for the earliest expiry. Unless
    /// `force` is set, this is skipped when the device is already armed for
    /// an earlier time.
    fn reprogram(&self, inner: &BaseInner<P>, force: bool) {
        let Some(dev) = self.clockevent() else { return };
        let Some(first) = inner.heap.first() else { return };
        let expires = first.expires;
        if !force && dev.next_event() <= expires {
            return;
        }

        let now = self.get_time.now();
        let result = match dev.program(expires, now) {
            Err(ProgramEventError::DeltaTooSmall) => dev.program_soonest(now),
            Err(ProgramEventError::DeltaTooLarge) => {
                // Wake up early and try again then
                let max = Ktime::from_ns(dev.max_delta_ns.min(i64::MAX as u64) as i64);
                dev.program(now + max, now)
            }
            x => x,
        };
        if let Err(e) = result {
            log::warn!(
                "ktimer base {:?}: could not program {:?} for {:?}: {:?}",
                self.name,
                dev.name,
                expires,
                e
            );
        }
    }
}

/// Restores the base if a timer callback unwinds out of `run_queues`. The
/// failed timer is deactivated unless the callback requeued it.
struct UnwindGuard<'a, P: PortThreading> {
    base: &'a KtimerBase<P>,
    timer: &'a TimerCore,
}

impl<P: PortThreading> Drop for UnwindGuard<'_, P> {
    fn drop(&mut self) {
        let mut inner = self.base.inner.lock();
        log::warn!(
            "ktimer base {:?}: callback of {:p} panicked",
            self.base.name,
            self.timer
        );
        if self.timer.state() == KtimerState::ExpiredDequeued {
            self.timer.set_state(KtimerState::Inactive);
        }
        inner.running = None;
        inner.in_run_queues = false;
        inner.rerun = false;
        for ctx in inner.cancel_waiters.drain(..) {
            P::unpark(&ctx);
        }
        self.base.reprogram(&inner, true);
    }
}

impl<P: PortThreading> ClockEventHandler for KtimerBase<P> {
    fn event_handler(&self, dev: &ClockEvent) {
        log::trace!("ktimer base {:?}: event from {:?}", self.name, dev.name);
        self.run_queues();
    }
}

impl<P: PortThreading> fmt::Debug for KtimerBase<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KtimerBase")
            .field("clock", &self.clock)
            .field("name", &self.name)
            .field("resolution", &self.resolution)
            .field("next_expiry", &self.next_expiry())
            .field("clockevent", &self.clockevent().map(|d| d.name))
            .finish()
    }
}

enum CancelOutcome {
    /// The timer was queued and has been removed.
    Removed,
    /// The timer was neither queued nor running.
    Inactive,
    /// The timer's callback is running in another context. The caller has
    /// been registered to be unparked when it returns.
    RunningElsewhere,
    /// The timer's callback is the caller. `bool` tells if the callback had
    /// requeued the timer.
    RunningHere(bool),
}

/// A high-resolution timer.
///
/// On expiry, `callback(data)` is called from [`KtimerBase::run_queues`].
/// The callback must not block.
pub struct Ktimer<'b, P: PortThreading> {
    base: &'b KtimerBase<P>,
    core: TimerCore,
    _pin: PhantomPinned,
}

impl<'b, P: PortThreading> Ktimer<'b, P> {
    pub const fn new(base: &'b KtimerBase<P>, callback: fn(usize), data: usize) -> Self {
        Self {
            base,
            core: TimerCore {
                expires: AtomicI64::new(0),
                expired: AtomicI64::new(0),
                interval: AtomicI64::new(0),
                state: AtomicU8::new(KtimerState::Inactive as u8),
                overrun: AtomicU64::new(0),
                heap_pos: AtomicUsize::new(HEAP_POS_NONE),
                callback,
                data,
                prio: 0,
            },
            _pin: PhantomPinned,
        }
    }

    /// Set the priority that orders this timer among timers with the same
    /// expiry. Lower values fire first.
    pub fn with_priority(mut self, prio: Priority) -> Self {
        self.core.prio = prio;
        self
    }

    /// Set the interval for automatic rearming. Zero disables rearming.
    pub fn with_interval(self, interval: Ktime) -> Self {
        self.core.interval.store(interval.to_ns(), Ordering::Relaxed);
        self
    }

    #[inline]
    pub fn base(&self) -> &'b KtimerBase<P> {
        self.base
    }

    #[inline]
    pub fn state(&self) -> KtimerState {
        self.core.state()
    }

    /// Return `true` if the timer is queued or its callback is running.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() != KtimerState::Inactive
    }

    /// Get the absolute expiry time.
    #[inline]
    pub fn expires(&self) -> Ktime {
        self.core.expires()
    }

    /// Get the time when the timer was last dequeued for firing.
    #[inline]
    pub fn expired(&self) -> Ktime {
        Ktime::from_ns(self.core.expired.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn interval(&self) -> Ktime {
        self.core.interval()
    }

    /// Set the interval for automatic rearming. Zero disables rearming.
    /// Takes effect at the next expiry.
    pub fn set_interval(&self, interval: Ktime) {
        let _inner = self.base.inner.lock();
        self.core.interval.store(interval.to_ns(), Ordering::Relaxed);
    }

    /// Get the number of intervals that elapsed without the timer being
    /// serviced.
    #[inline]
    pub fn overrun(&self) -> u64 {
        self.core.overrun.load(Ordering::Relaxed)
    }

    /// Get and reset the overrun counter.
    pub fn take_overrun(&self) -> u64 {
        self.core.overrun.swap(0, Ordering::Relaxed)
    }

    /// Get the time remaining until the expiry. Negative if the expiry has
    /// passed. Zero if the timer is inactive.
    pub fn get_remtime(&self) -> Ktime {
        if self.is_active() {
            self.expires() - self.base.now()
        } else {
            Ktime::ZERO
        }
    }

    fn timer_ref(&self) -> TimerRef {
        TimerRef(NonNull::from(&self.core))
    }

    /// Queue the timer. A queued timer is requeued with the new expiry.
    ///
    /// Unless `flags` contains [`StartFlags::NOCHECK`], a timer whose expiry
    /// has already passed is queued in [`KtimerState::Expired`]. Either way,
    /// it fires on the next [`KtimerBase::run_queues`].
    pub fn start(
        self: Pin<&Self>,
        tim: Ktime,
        mode: KtimerMode,
        flags: StartFlags,
    ) -> Result<(), StartTimerError> {
        let base = self.base;
        let core = &self.core;
        let tim = if flags.contains(StartFlags::ROUND) {
            base.round(tim)
        } else {
            tim
        };

        let mut inner = base.inner.lock();
        let now = base.now();

        let expires = match mode {
            KtimerMode::Abs => tim,
            KtimerMode::Rel => now + tim,
            KtimerMode::Incr => core.expires() + tim,
            KtimerMode::Restart => core.expires(),
            KtimerMode::Forward | KtimerMode::Rearm => {
                let interval = if mode == KtimerMode::Forward {
                    tim
                } else {
                    core.interval()
                };
                if !interval.is_positive() {
                    return Err(StartTimerError::BadParam);
                }
                let (expires, orun) = forward_expiry(core.expires(), interval, now);
                core.interval.store(interval.to_ns(), Ordering::Relaxed);
                core.add_overrun(orun);
                expires
            }
        };

        if core.state().is_queued() {
            base.dequeue(&mut inner, core);
        }
        core.expires.store(expires.to_ns(), Ordering::Relaxed);

        let state = if !flags.contains(StartFlags::NOCHECK) && expires <= now {
            KtimerState::Expired
        } else {
            KtimerState::Pending
        };

        log::trace!(
            "ktimer base {:?}: start {:p} {:?} {:?} → expires = {:?} ({:?})",
            base.name,
            core,
            mode,
            tim,
            expires,
            state
        );

        base.enqueue(&mut inner, self.timer_ref(), state);
        Ok(())
    }

    /// Cancel the timer, then start it.
    pub fn restart(
        self: Pin<&Self>,
        tim: Ktime,
        mode: KtimerMode,
        flags: StartFlags,
    ) -> Result<(), StartTimerError> {
        self.cancel();
        self.start(tim, mode, flags)
    }

    fn cancel_inner(&self) -> CancelOutcome {
        let base = self.base;
        let core = &self.core;
        let mut inner = base.inner.lock();

        let running_ctx = match &inner.running {
            Some((t, ctx)) if *t == self.timer_ref() => Some(ctx.clone()),
            _ => None,
        };
        let queued = core.state().is_queued();

        if let Some(ctx) = running_ctx {
            let me = P::current();
            if ctx != me {
                if !inner.cancel_waiters.contains(&me) {
                    inner.cancel_waiters.push(me);
                }
                return CancelOutcome::RunningElsewhere;
            }
            // Cancelled by its own callback. Marking it inactive prevents
            // `run_queues` from rearming it.
            if queued {
                base.dequeue(&mut inner, core);
            }
            core.set_state(KtimerState::Inactive);
            log::trace!("ktimer base {:?}: {:p} cancelled itself", base.name, core);
            return CancelOutcome::RunningHere(queued);
        }

        if queued {
            base.dequeue(&mut inner, core);
            core.set_state(KtimerState::Inactive);
            log::trace!("ktimer base {:?}: cancelled {:p}", base.name, core);
            CancelOutcome::Removed
        } else {
            CancelOutcome::Inactive
        }
    }

    /// Dequeue the timer if it's queued. Fails with
    /// [`CancelTimerError::Running`] if its callback is running (even if the
    /// caller is the callback).
    ///
    /// Returns `Ok(true)` if the timer was queued.
    pub fn try_to_cancel(&self) -> Result<bool, CancelTimerError> {
        let base = self.base;
        let core = &self.core;
        let mut inner = base.inner.lock();

        if matches!(&inner.running, Some((t, _)) if *t == self.timer_ref()) {
            return Err(CancelTimerError::Running);
        }

        if core.state().is_queued() {
            base.dequeue(&mut inner, core);
            core.set_state(KtimerState::Inactive);
            log::trace!("ktimer base {:?}: cancelled {:p}", base.name, core);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Dequeue the timer, waiting for its callback to complete if it's
    /// running in another context.
    ///
    /// When called from the timer's own callback, this returns immediately
    /// and the timer won't be rearmed.
    ///
    /// Returns `true` if the timer was queued.
    pub fn cancel(&self) -> bool {
        loop {
            match self.cancel_inner() {
                CancelOutcome::Removed => return true,
                CancelOutcome::Inactive => return false,
                CancelOutcome::RunningHere(queued) => return queued,
                CancelOutcome::RunningElsewhere => P::park(),
            }
        }
    }

    /// Advance the expiry past `now` by whole intervals, adding their number
    /// to the overrun counter. Returns the number of intervals.
    ///
    /// Does nothing if `now` is before the expiry or the interval is zero.
    pub fn forward(&self, now: Ktime) -> u64 {
        let base = self.base;
        let core = &self.core;
        let mut inner = base.inner.lock();

        let state = core.state();
        if state.is_queued() {
            base.dequeue(&mut inner, core);
        }
        let orun = core.forward(now);
        core.add_overrun(orun);
        if state.is_queued() {
            // A forwarded expiry is always later than `now`
            let state = if orun > 0 { KtimerState::Pending } else { state };
            base.enqueue(&mut inner, self.timer_ref(), state);
        }
        orun
    }
}

impl<P: PortThreading> Drop for Ktimer<'_, P> {
    fn drop(&mut self) {
        match self.cancel_inner() {
            CancelOutcome::Inactive => {}
            CancelOutcome::RunningHere(_) => {
                panic!("timer dropped from its own callback");
            }
            CancelOutcome::RunningElsewhere => {
                // Wait for `run_queues` to let go of the timer. It might get
                // rearmed in the meantime.
                if self.cancel() {
                    panic!("timer is still linked");
                }
            }
            CancelOutcome::Removed => panic!("timer is still linked"),
        }
    }
}

impl<P: PortThreading> fmt::Debug for Ktimer<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ktimer")
            .field("base", &self.base.name)
            .field("state", &self.state())
            .field("expires", &self.expires())
            .field("interval", &self.interval())
            .field("overrun", &self.overrun())
            .field("prio", &self.core.prio)
            .finish()
    }
}
