//! [`PortThreading`] on `std::thread`
use hrt_kernel::{plist::Priority, port::PortThreading};
use std::{cell::Cell, fmt, thread};

/// The port type. Every `std` thread is an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdPort;

/// Identifies a thread.
#[derive(Clone)]
pub struct ThreadCtx(thread::Thread);

impl ThreadCtx {
    #[inline]
    pub fn id(&self) -> thread::ThreadId {
        self.0.id()
    }
}

impl PartialEq for ThreadCtx {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

impl fmt::Debug for ThreadCtx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.name() {
            Some(name) => write!(f, "{:?}({name:?})", self.0.id()),
            None => write!(f, "{:?}", self.0.id()),
        }
    }
}

/// The priority of threads that never called [`set_current_priority`].
pub const DEFAULT_PRIORITY: Priority = 100;

thread_local! {
    static PRIORITY: Cell<Priority> = Cell::new(DEFAULT_PRIORITY);
}

/// Set the priority the calling thread uses when it blocks on an
/// [`RtMutex`](hrt_kernel::rt_mutex::RtMutex) through
/// [`RawLock::lock`](hrt_kernel::sync::RawLock::lock). Lower values are more
/// urgent.
///
/// This doesn't affect the host scheduler.
pub fn set_current_priority(prio: Priority) {
    PRIORITY.with(|c| c.set(prio));
}

impl PortThreading for StdPort {
    type Context = ThreadCtx;

    #[inline]
    fn current() -> ThreadCtx {
        ThreadCtx(thread::current())
    }

    #[inline]
    fn current_priority() -> Priority {
        PRIORITY.with(|c| c.get())
    }

    #[inline]
    fn park() {
        thread::park();
    }

    #[inline]
    fn unpark(ctx: &ThreadCtx) {
        ctx.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_identity() {
        let me = StdPort::current();
        assert_eq!(me, StdPort::current());
        let other = thread::spawn(StdPort::current).join().unwrap();
        assert_ne!(me, other);
    }

    #[test]
    fn priority_is_per_thread() {
        set_current_priority(3);
        assert_eq!(StdPort::current_priority(), 3);
        let other = thread::spawn(StdPort::current_priority).join().unwrap();
        assert_eq!(other, DEFAULT_PRIORITY);
    }

    #[test]
    fn unpark_before_park() {
        StdPort::unpark(&StdPort::current());
        // Consumes the token without blocking
        StdPort::park();
    }
}
