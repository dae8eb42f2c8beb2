//! The high-resolution timekeeping core of a kernel.
//!
//! # Components
//!
//!  - [`ktime`]: signed 64-bit nanosecond time values and their arithmetic.
//!  - [`clocksource`]: free-running counters, the conversion of their cycles
//!    into nanoseconds, and the rating-based selection among them.
//!  - [`timekeeping`]: the monotonic and wall clocks derived from the current
//!    clocksource.
//!  - [`clockevent`]: programmable interrupt sources.
//!  - [`ktimer`]: timer queues with nanosecond expiries, driven by a
//!    clockevent device or a periodic tick.
//!  - [`plist`]: the priority-sorted list used for wait queues.
//!  - [`rt_mutex`]: sleeping mutexes with priority-ordered hand-off.
//!  - [`semaphore`], [`rwsem`]: counting and reader-writer semaphores on top
//!    of `rt_mutex`.
//!  - [`sync`]: data-protecting locks on top of the above.
//!
//! The crate doesn't create threads or access hardware by itself. A port
//! implements [`port::PortThreading`] to let it block and wake up contexts,
//! and supplies the counter and interrupt drivers behind [`ClockSource`] and
//! [`ClockEvent`].
//!
//! [`ClockSource`]: clocksource::ClockSource
//! [`ClockEvent`]: clockevent::ClockEvent
//!
//! # Cargo features
//!
//!  - `preempt_rt`: Back [`sync::SpinLock`] with [`rt_mutex::RtMutex`].
//!  - `debug_lock`: Detect recursive locking of [`sync::RawSpinLock`].
//!  - `doc`: Render the diagrams in the documentation.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![warn(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod clockevent;
pub mod clocksource;
pub mod error;
pub mod ktime;
pub mod ktimer;
pub mod plist;
pub mod port;
pub mod rt_mutex;
pub mod rwsem;
pub mod semaphore;
pub mod sync;
pub mod timekeeping;
mod utils;

#[cfg(test)]
mod test_utils;

pub use self::{
    error::ResultCode,
    ktime::Ktime,
    plist::Priority,
    port::PortThreading,
};
