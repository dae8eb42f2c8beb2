//! The interface to the execution environment
use core::fmt;

use crate::plist::Priority;

/// Implemented by a port. Provides the identity, priority, and blocking
/// primitives of the execution contexts (threads or tasks) that use the
/// blocking operations of this crate.
///
/// [`Self::park`] and [`Self::unpark`] follow the token semantics of
/// `std::thread::park`: an `unpark` issued before the corresponding `park`
/// makes that `park` return immediately, and `park` may return spuriously.
/// Callers always re-check their wake-up condition.
pub trait PortThreading: Send + Sync + 'static {
    /// A handle to an execution context.
    type Context: Clone + PartialEq + Send + Sync + fmt::Debug + 'static;

    /// Get the calling context.
    fn current() -> Self::Context;

    /// Get the priority of the calling context. Lower values are more
    /// urgent.
    fn current_priority() -> Priority;

    /// Block the calling context until [`Self::unpark`] is called for it.
    fn park();

    /// Make a parked context runnable.
    fn unpark(ctx: &Self::Context);
}
