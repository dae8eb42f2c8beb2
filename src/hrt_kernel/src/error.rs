//! Result codes and per-operation error types
//!
//! Every operation that can fail has its own error type listing only the
//! codes it can actually produce. All of them convert losslessly into
//! [`ResultCode`], whose values are shared across the crate.
use core::fmt;

/// Defines [`ResultCode`] along with a lookup from a raw value.
macro_rules! result_codes {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $( $( #[$vmeta:meta] )* $vname:ident = $vd:literal, )*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $( $( #[$vmeta] )* $vname = $vd, )*
        }

        impl ResultCode {
            /// Get the name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use hrt_kernel::error::ResultCode;
            /// assert_eq!(ResultCode::DeltaTooSmall.as_str(), "DeltaTooSmall");
            /// ```
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$vname => stringify!($vname), )*
                }
            }

            /// Find the result code whose value is `raw`.
            ///
            /// ```
            /// use hrt_kernel::error::ResultCode;
            /// assert_eq!(ResultCode::from_raw(-50), Some(ResultCode::Timeout));
            /// assert_eq!(ResultCode::from_raw(-1), None);
            /// ```
            pub const fn from_raw(raw: i8) -> Option<Self> {
                match raw {
                    $( $vd => Some(Self::$vname), )*
                    _ => None,
                }
            }
        }
    };
}

result_codes! {
    /// All result codes (including success) that the operations of this crate
    /// can report. Failures are negative.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// The device lacks the capability the operation needs.
        NotSupported = -9,
        /// A parameter is invalid in a way that is not covered by any other
        /// error code.
        BadParam = -17,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// The requested event is closer than the device can program.
        DeltaTooSmall = -33,
        /// The requested event is farther than the device can program.
        DeltaTooLarge = -34,
        /// The target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// The object is already registered.
        Duplicate = -42,
        /// There's no room left to register the object.
        QueueOverflow = -43,
        /// The target timer's callback is executing. Retry after it returns.
        Running = -47,
        /// The wait was cancelled by another context.
        Interrupted = -49,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    #[inline]
    pub const fn is_err(self) -> bool {
        (self as i8) < 0
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        !self.is_err()
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defines an error type whose variants are a subset of [`ResultCode`].
///
/// `enum A: B { .. }` additionally implements `From<B> for A`, where `B`'s
/// variants must be a subset of `A`'s.
macro_rules! define_error {
    (
        mod $test_mod:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $( : $($narrower:ident),+ )? {
            $( $( #[$vmeta:meta] )* $vname:ident, )*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for the values.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $( $( #[$vmeta] )* $vname = ResultCode::$vname as i8, )*
        }

        impl $name {
            /// Convert `self` to [`ResultCode`].
            #[inline]
            pub const fn code(self) -> ResultCode {
                match self {
                    $( Self::$vname => ResultCode::$vname, )*
                }
            }
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.code().as_str())
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                x.code()
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                x.map_or_else(|e| e.code(), |()| Self::Success)
            }
        }

        $($(
            impl From<$narrower> for $name {
                #[inline]
                fn from(x: $narrower) -> Self {
                    $name::from_code(x.code())
                }
            }
        )+)?

        impl $name {
            /// The inverse of [`Self::code`]. Panics on a code this type
            /// doesn't have.
            #[allow(dead_code)]
            fn from_code(code: ResultCode) -> Self {
                match code {
                    $( ResultCode::$vname => Self::$vname, )*
                    _ => unreachable!("{:?} is not a {}", code, stringify!($name)),
                }
            }
        }

        #[cfg(test)]
        mod $test_mod {
            use super::*;

            #[test]
            fn codes_match() {
                $(
                    let e = $name::$vname;
                    assert_eq!(e as i8, ResultCode::$vname as i8);
                    assert_eq!(ResultCode::from(e), ResultCode::$vname);
                    assert_eq!(ResultCode::from(Err(e)), ResultCode::$vname);
                    assert!(ResultCode::$vname.is_err());
                    assert_eq!($name::from_code(ResultCode::$vname), e);
                )*
                assert_eq!(ResultCode::from(Result::<(), $name>::Ok(())), ResultCode::Success);
            }
        }
    };
}

define_error! {
    mod register_clock_source_error {}
    /// Error type for [`ClockSourceRegistry::register`].
    ///
    /// [`ClockSourceRegistry::register`]: crate::clocksource::ClockSourceRegistry::register
    pub enum RegisterClockSourceError {
        /// The same clocksource is already registered.
        Duplicate,
        /// The registry is full.
        QueueOverflow,
    }
}

define_error! {
    mod program_event_error {}
    /// Error type for [`ClockEvent::program`].
    ///
    /// The caller is expected to pick a fallback deadline, usually
    /// [`ClockEvent::program_soonest`].
    ///
    /// [`ClockEvent::program`]: crate::clockevent::ClockEvent::program
    /// [`ClockEvent::program_soonest`]: crate::clockevent::ClockEvent::program_soonest
    pub enum ProgramEventError {
        /// The requested deadline is closer than `min_delta_ns` (or already
        /// in the past).
        DeltaTooSmall,
        /// The requested deadline is farther than `max_delta_ns`.
        DeltaTooLarge,
        /// The device is not in the one-shot mode.
        BadObjectState,
    }
}

define_error! {
    mod set_event_mode_error {}
    /// Error type for [`ClockEvent::set_mode`].
    ///
    /// [`ClockEvent::set_mode`]: crate::clockevent::ClockEvent::set_mode
    pub enum SetEventModeError {
        /// The device lacks the feature required by the requested mode.
        NotSupported,
    }
}

define_error! {
    mod start_timer_error {}
    /// Error type for [`Ktimer::start`].
    ///
    /// [`Ktimer::start`]: crate::ktimer::Ktimer::start
    pub enum StartTimerError {
        /// The mode needs a positive interval, and none was supplied or
        /// stored.
        BadParam,
    }
}

define_error! {
    mod cancel_timer_error {}
    /// Error type for [`Ktimer::try_to_cancel`].
    ///
    /// [`Ktimer::try_to_cancel`]: crate::ktimer::Ktimer::try_to_cancel
    pub enum CancelTimerError {
        /// The timer's callback is executing. Retry after it returns.
        Running,
    }
}

define_error! {
    mod unlock_error {}
    /// Error type for [`RtMutex::release`].
    ///
    /// [`RtMutex::release`]: crate::rt_mutex::RtMutex::release
    pub enum UnlockError {
        /// The current context does not own the mutex.
        NotOwner,
    }
}

define_error! {
    mod lock_cancelled_error {}
    /// Error type for [`RtMutex::acquire_cancellable`].
    ///
    /// [`RtMutex::acquire_cancellable`]: crate::rt_mutex::RtMutex::acquire_cancellable
    pub enum LockCancelledError {
        /// The wait was cancelled by [`RtMutex::try_to_cancel_wait`].
        ///
        /// [`RtMutex::try_to_cancel_wait`]: crate::rt_mutex::RtMutex::try_to_cancel_wait
        Interrupted,
    }
}

define_error! {
    mod lock_timeout_error {}
    /// Error type for [`RtMutex::acquire_timeout`].
    ///
    /// [`RtMutex::acquire_timeout`]: crate::rt_mutex::RtMutex::acquire_timeout
    pub enum LockTimeoutError: LockCancelledError {
        /// The wait was cancelled by [`RtMutex::try_to_cancel_wait`].
        ///
        /// [`RtMutex::try_to_cancel_wait`]: crate::rt_mutex::RtMutex::try_to_cancel_wait
        Interrupted,
        /// The timeout expired before the mutex was handed over.
        Timeout,
    }
}
