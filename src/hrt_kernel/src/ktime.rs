//! Kernel time values
use core::{fmt, ops};
use num_integer::Integer;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;
/// Nanoseconds per microsecond.
pub const NSEC_PER_USEC: i64 = 1_000;
/// Microseconds per second.
pub const USEC_PER_SEC: i64 = 1_000_000;

/// The tick rate assumed by bases that are not backed by a one-shot clockevent
/// device.
pub const HZ: i64 = 1000;

/// The resolution of a tick-driven timer base.
pub const KTIME_LOW_RES: Ktime = Ktime::from_ns(NSEC_PER_SEC / HZ);

/// Represents either a point in time (relative to the epoch of some clock) or
/// a signed time span, with nanosecond precision.
///
/// `Ktime` is backed by `i64` and can represent roughly ±292 years. The
/// seconds + nanoseconds form ([`Timespec`]) is only produced at conversion
/// boundaries.
///
/// The arithmetic operators saturate at [`Ktime::MIN`] and [`Ktime::MAX`], so
/// they never fail. `Ktime::MAX` doubles as "never" for expiry times.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Ktime {
    ns: i64,
}

/// A seconds + nanoseconds pair.
///
/// `nsec` is always in range `0..NSEC_PER_SEC`. A negative time has a negative
/// `sec` and a non-negative `nsec`, e.g., -1.5s is `{ sec: -2, nsec: 500_000_000 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

/// A seconds + microseconds pair, normalized like [`Timespec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timeval {
    pub sec: i64,
    pub usec: u32,
}

impl Ktime {
    /// Zero, the epoch of a clock or an empty span.
    pub const ZERO: Self = Self { ns: 0 };

    /// The largest representable value. Used as "never expires".
    pub const MAX: Self = Self { ns: i64::MAX };

    /// The smallest representable value.
    pub const MIN: Self = Self { ns: i64::MIN };

    /// Construct a `Ktime` from a nanosecond count.
    #[inline]
    pub const fn from_ns(ns: i64) -> Self {
        Self { ns }
    }

    /// Get the nanosecond count.
    #[inline]
    pub const fn to_ns(self) -> i64 {
        self.ns
    }

    /// Construct a `Ktime` from seconds and nanoseconds.
    ///
    /// `nsecs` may be outside `0..NSEC_PER_SEC`; the excess is carried into
    /// seconds. Saturates on overflow.
    #[inline]
    pub const fn set(secs: i64, nsecs: i64) -> Self {
        Self {
            ns: secs.saturating_mul(NSEC_PER_SEC).saturating_add(nsecs),
        }
    }

    /// Construct a `Ktime` from a microsecond count. Saturates on overflow.
    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self {
            ns: micros.saturating_mul(NSEC_PER_USEC),
        }
    }

    /// Construct a `Ktime` from a millisecond count. Saturates on overflow.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self {
            ns: millis.saturating_mul(1_000_000),
        }
    }

    /// Get the total number of whole microseconds, rounding toward negative
    /// infinity.
    #[inline]
    pub fn as_micros(self) -> i64 {
        Integer::div_floor(&self.ns, &NSEC_PER_USEC)
    }

    /// Return `true` if and only if `self` is negative.
    #[inline]
    pub const fn is_negative(self) -> bool {
        self.ns < 0
    }

    /// Return `true` if and only if `self` is positive.
    #[inline]
    pub const fn is_positive(self) -> bool {
        self.ns > 0
    }

    /// Add the specified number of nanoseconds. Saturates on overflow.
    #[inline]
    pub const fn add_ns(self, ns: i64) -> Self {
        Self {
            ns: self.ns.saturating_add(ns),
        }
    }

    /// Add the specified value to `self`, saturating on overflow.
    #[inline]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self {
            ns: self.ns.saturating_add(other.ns),
        }
    }

    /// Subtract the specified value from `self`, saturating on overflow.
    #[inline]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self {
            ns: self.ns.saturating_sub(other.ns),
        }
    }

    /// Add the specified value to `self`, returning `None` if the result
    /// overflows.
    #[inline]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        // `Option::map` is inconvenient to use in `const fn`
        if let Some(ns) = self.ns.checked_add(other.ns) {
            Some(Self { ns })
        } else {
            None
        }
    }

    /// Subtract the specified value from `self`, returning `None` if the
    /// result overflows.
    #[inline]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        if let Some(ns) = self.ns.checked_sub(other.ns) {
            Some(Self { ns })
        } else {
            None
        }
    }

    /// The distance between `self` and `other` in nanoseconds.
    #[inline]
    pub const fn abs_diff(self, other: Self) -> u64 {
        self.ns.abs_diff(other.ns)
    }

    /// Round `self` up to the next multiple of `res`. Non-positive `res` leaves
    /// `self` unchanged.
    pub fn round_up(self, res: Self) -> Self {
        if res.ns <= 0 {
            return self;
        }
        let rem = Integer::mod_floor(&self.ns, &res.ns);
        if rem == 0 {
            self
        } else {
            self.add_ns(res.ns - rem)
        }
    }

    /// Split `self` into seconds and nanoseconds.
    pub fn to_timespec(self) -> Timespec {
        let (sec, nsec) = Integer::div_mod_floor(&self.ns, &NSEC_PER_SEC);
        Timespec {
            sec,
            nsec: nsec as u32,
        }
    }

    /// Construct a `Ktime` from seconds and nanoseconds.
    pub fn from_timespec(ts: Timespec) -> Self {
        Self::set(ts.sec, ts.nsec as i64)
    }

    /// Split `self` into seconds and microseconds. The sub-microsecond part
    /// is rounded toward negative infinity.
    pub fn to_timeval(self) -> Timeval {
        let (sec, usec) = Integer::div_mod_floor(&self.as_micros(), &USEC_PER_SEC);
        Timeval {
            sec,
            usec: usec as u32,
        }
    }

    /// Construct a `Ktime` from seconds and microseconds.
    pub fn from_timeval(tv: Timeval) -> Self {
        Self::set(tv.sec, (tv.usec as i64).saturating_mul(NSEC_PER_USEC))
    }
}

impl Timespec {
    /// Construct a `Timespec`, carrying out-of-range nanoseconds into seconds.
    pub fn normalize(sec: i64, nsec: i64) -> Self {
        let (carry, nsec) = Integer::div_mod_floor(&nsec, &NSEC_PER_SEC);
        Self {
            sec: sec.saturating_add(carry),
            nsec: nsec as u32,
        }
    }
}

impl From<Timespec> for Ktime {
    #[inline]
    fn from(ts: Timespec) -> Self {
        Self::from_timespec(ts)
    }
}

impl From<Ktime> for Timespec {
    #[inline]
    fn from(t: Ktime) -> Self {
        t.to_timespec()
    }
}

impl From<Timeval> for Ktime {
    #[inline]
    fn from(tv: Timeval) -> Self {
        Self::from_timeval(tv)
    }
}

impl From<Ktime> for Timeval {
    #[inline]
    fn from(t: Ktime) -> Self {
        t.to_timeval()
    }
}

/// Error type returned when a checked `Ktime` conversion fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryFromKtimeError(());

impl TryFrom<core::time::Duration> for Ktime {
    type Error = TryFromKtimeError;

    /// Try to construct a `Ktime` from the specified `core::time::Duration`.
    /// Returns an error if the specified `Duration` overflows the representable
    /// range of `Ktime`.
    fn try_from(value: core::time::Duration) -> Result<Self, Self::Error> {
        value
            .as_nanos()
            .try_into()
            .map(Self::from_ns)
            .map_err(|_| TryFromKtimeError(()))
    }
}

impl TryFrom<Ktime> for core::time::Duration {
    type Error = TryFromKtimeError;

    /// Try to construct a `core::time::Duration` from the specified `Ktime`.
    /// Returns an error if `value` is negative.
    fn try_from(value: Ktime) -> Result<Self, Self::Error> {
        if value.ns < 0 {
            Err(TryFromKtimeError(()))
        } else {
            Ok(Self::from_nanos(value.ns as u64))
        }
    }
}

impl fmt::Debug for Ktime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let abs = core::time::Duration::from_nanos(self.ns.unsigned_abs());
        if self.ns < 0 {
            write!(f, "-")?;
        }
        abs.fmt(f)
    }
}

impl ops::Add for Ktime {
    type Output = Self;

    /// Perform a saturating addition.
    #[inline]
    fn add(self, rhs: Self) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl ops::AddAssign for Ktime {
    /// Perform a saturating addition.
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl ops::Sub for Ktime {
    type Output = Self;

    /// Perform a saturating subtraction.
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl ops::SubAssign for Ktime {
    /// Perform a saturating subtraction.
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl ops::Neg for Ktime {
    type Output = Self;

    /// Negate `self`. `Ktime::MIN` becomes `Ktime::MAX`.
    #[inline]
    fn neg(self) -> Self::Output {
        Self {
            ns: self.ns.saturating_neg(),
        }
    }
}
