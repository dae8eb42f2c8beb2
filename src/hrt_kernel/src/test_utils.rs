//! Shared fixtures for unit tests
use std::{
    cell::Cell,
    sync::atomic::{AtomicI64, Ordering},
    thread,
};

use crate::{ktime::Ktime, plist::Priority, port::PortThreading, timekeeping::GetTime};

/// A port backed by `std::thread`.
pub struct ThreadPort;

#[derive(Clone, Debug)]
pub struct ThreadCtx(thread::Thread);

impl PartialEq for ThreadCtx {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

thread_local! {
    static PRIORITY: Cell<Priority> = Cell::new(0);
    static PARK_COUNT: Cell<usize> = Cell::new(0);
}

/// Set the priority reported by `ThreadPort::current_priority` for the
/// calling thread.
pub fn set_priority(prio: Priority) {
    PRIORITY.with(|c| c.set(prio));
}

/// Get the number of times the calling thread has called
/// `ThreadPort::park`.
pub fn park_count() -> usize {
    PARK_COUNT.with(|c| c.get())
}

impl PortThreading for ThreadPort {
    type Context = ThreadCtx;

    fn current() -> ThreadCtx {
        ThreadCtx(thread::current())
    }

    fn current_priority() -> Priority {
        PRIORITY.with(|c| c.get())
    }

    fn park() {
        PARK_COUNT.with(|c| c.set(c.get() + 1));
        thread::park();
    }

    fn unpark(ctx: &ThreadCtx) {
        ctx.0.unpark();
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn set(&self, ns: i64) {
        self.0.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: i64) {
        self.0.fetch_add(ns, Ordering::SeqCst);
    }
}

impl GetTime for ManualClock {
    fn now(&self) -> Ktime {
        Ktime::from_ns(self.0.load(Ordering::SeqCst))
    }
}

pub fn leak<T>(x: T) -> &'static T {
    Box::leak(Box::new(x))
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
