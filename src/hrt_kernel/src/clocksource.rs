//! Clocksources: free-running cycle counters and their conversion to
//! nanoseconds
//!
//! A [`ClockSource`] describes how to read a counter and how to scale its
//! value. `nanoseconds = (cycles * (mult + adj)) >> shift`, where `adj` is a
//! transient frequency correction derived from an NTP-style parts-per-million
//! value ([`ClockSource::ppm_to_mult_adj`]). The stored `mult` never changes.
//!
//! Rating bands (advisory, only the ordering matters):
//!
//! | Rating    | Meaning                                      |
//! |-----------|----------------------------------------------|
//! | 1–99      | Only usable for bootup and testing purposes  |
//! | 100–199   | Functional for real use, but not desired     |
//! | 200–299   | A correct and usable clocksource             |
//! | 300–399   | A reasonably fast and accurate clocksource   |
//! | 400–499   | The ideal clocksource                        |
use arrayvec::ArrayVec;
use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::error::RegisterClockSourceError;

/// A raw counter value.
pub type Cycle = u64;

/// The maximum number of clocksources a [`ClockSourceRegistry`] can hold.
pub const MAX_CLOCKSOURCES: usize = 8;

/// The scale of the `ppm` argument of [`ClockSource::ppm_to_mult_adj`]
/// (parts per million, shifted left by this amount).
pub const SHIFT_USEC: u32 = 16;

/// Construct a mask covering the lowest `bits` bits of a counter.
pub const fn clocksource_mask(bits: u32) -> Cycle {
    if bits >= 64 {
        Cycle::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Calculate a `mult` value for a counter running at `hz` Hz.
///
/// `hz` must not be zero.
pub const fn hz2mult(hz: u32, shift: u32) -> u32 {
    let tmp = ((1_000_000_000u64 << shift) + (hz / 2) as u64) / hz as u64;
    tmp as u32
}

/// Calculate a `mult` value for a counter running at `khz` kHz.
///
/// `khz` must not be zero.
pub const fn khz2mult(khz: u32, shift: u32) -> u32 {
    let tmp = ((1_000_000u64 << shift) + (khz / 2) as u64) / khz as u64;
    tmp as u32
}

/// How a clocksource's counter is read.
#[derive(Clone, Copy)]
pub struct ClockRead(ReadKind);

#[derive(Clone, Copy)]
enum ReadKind {
    Function(fn() -> Cycle),
    Mmio32(NonNull<u32>),
    Mmio64(NonNull<u32>),
}

impl ClockRead {
    /// Read the counter by calling `f`.
    pub const fn function(f: fn() -> Cycle) -> Self {
        Self(ReadKind::Function(f))
    }

    /// Read the counter from a 32-bit memory-mapped register.
    ///
    /// # Safety
    ///
    /// `reg` must point to a readable 32-bit register (or memory location)
    /// for as long as the clocksource is in use.
    pub const unsafe fn mmio32(reg: NonNull<u32>) -> Self {
        Self(ReadKind::Mmio32(reg))
    }

    /// Read the counter from a pair of 32-bit memory-mapped registers (low
    /// word first).
    ///
    /// # Safety
    ///
    /// `reg` must point to two consecutive readable 32-bit registers for as
    /// long as the clocksource is in use.
    pub const unsafe fn mmio64(reg: NonNull<u32>) -> Self {
        Self(ReadKind::Mmio64(reg))
    }

    #[inline]
    fn read(&self) -> Cycle {
        match self.0 {
            ReadKind::Function(f) => f(),
            // Safety: Guaranteed by the constructor's caller
            ReadKind::Mmio32(reg) => unsafe { ptr::read_volatile(reg.as_ptr()) as Cycle },
            ReadKind::Mmio64(reg) => unsafe {
                let lo_ptr = reg.as_ptr();
                let hi_ptr = lo_ptr.add(1);
                // Re-read the high word until it's stable so that a carry
                // between the two reads is not observed half-way
                loop {
                    let hi = ptr::read_volatile(hi_ptr);
                    let lo = ptr::read_volatile(lo_ptr);
                    if hi == ptr::read_volatile(hi_ptr) {
                        break ((hi as Cycle) << 32) | lo as Cycle;
                    }
                }
            },
        }
    }
}

impl fmt::Debug for ClockRead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            ReadKind::Function(func) => write!(f, "Function({:p})", func as *const ()),
            ReadKind::Mmio32(reg) => write!(f, "Mmio32({reg:p})"),
            ReadKind::Mmio64(reg) => write!(f, "Mmio64({reg:p})"),
        }
    }
}

// Safety: MMIO registers are only read, and `ClockRead::mmio*`'s caller
//         guarantees they stay valid
unsafe impl Send for ClockRead {}
unsafe impl Sync for ClockRead {}

/// A hardware abstraction for a free-running counter.
///
/// Registered once and never destroyed, so the registry deals in
/// `&'static ClockSource`.
#[derive(Debug)]
pub struct ClockSource {
    pub name: &'static str,
    /// Higher is better. Used by [`ClockSourceRegistry::reselect`].
    pub rating: i32,
    pub read: ClockRead,
    /// The counter wraps around at `mask + 1`.
    pub mask: Cycle,
    pub mult: u32,
    pub shift: u32,
    /// The counter keeps running and is fine-grained enough for one-shot
    /// timer operation.
    pub is_continuous: bool,
    /// Called by the timekeeper at every fold point. Returns `true` if the
    /// source changed its parameters.
    pub update_callback: Option<fn() -> bool>,
}

impl ClockSource {
    /// Construct a `ClockSource` with a function reader.
    pub const fn new(name: &'static str, rating: i32, read: fn() -> Cycle, mask: Cycle) -> Self {
        Self {
            name,
            rating,
            read: ClockRead::function(read),
            mask,
            mult: 1,
            shift: 0,
            is_continuous: false,
            update_callback: None,
        }
    }

    /// Set `mult` and `shift` for a counter running at `hz` Hz.
    pub const fn with_frequency(self, hz: u32, shift: u32) -> Self {
        Self {
            mult: hz2mult(hz, shift),
            shift,
            ..self
        }
    }

    pub const fn with_continuous(self, is_continuous: bool) -> Self {
        Self {
            is_continuous,
            ..self
        }
    }

    /// Read the current counter value, masked to the counter's width.
    #[inline]
    pub fn read(&self) -> Cycle {
        self.read.read() & self.mask
    }

    /// Get the number of cycles elapsed from `last` to `now`, accounting for
    /// the counter wrapping around in between.
    #[inline]
    pub fn delta(&self, now: Cycle, last: Cycle) -> Cycle {
        now.wrapping_sub(last) & self.mask
    }

    #[inline]
    fn adjusted_mult(&self, adj: i32) -> u128 {
        (self.mult as i64 + adj as i64).max(0) as u128
    }

    /// Convert a cycle count to nanoseconds, applying the frequency correction
    /// `adj`.
    #[inline]
    pub fn cyc2ns(&self, adj: i32, cycles: Cycle) -> u64 {
        let ns = (cycles as u128 * self.adjusted_mult(adj)) >> self.shift;
        ns.min(u64::MAX as u128) as u64
    }

    /// Like [`Self::cyc2ns`], but carries the sub-nanosecond part in `rem`
    /// from one call to the next.
    ///
    /// Feeding a sequence of deltas through this method with the same `rem`
    /// yields exactly the same total as converting the sum of the deltas at
    /// once.
    #[inline]
    pub fn cyc2ns_rem(&self, adj: i32, cycles: Cycle, rem: &mut u64) -> u64 {
        let scaled = cycles as u128 * self.adjusted_mult(adj) + *rem as u128;
        let frac_mask = (1u128 << self.shift) - 1;
        *rem = (scaled & frac_mask) as u64;
        (scaled >> self.shift).min(u64::MAX as u128) as u64
    }

    /// Calculate the `mult` adjustment for a frequency error of `ppm` parts
    /// per million, where `ppm` is scaled by `1 << SHIFT_USEC`.
    pub fn ppm_to_mult_adj(&self, ppm: i32) -> i32 {
        let mut adj = (ppm.unsigned_abs() as u64 * self.mult as u64) >> SHIFT_USEC;
        adj += 1_000_000 / 2;
        adj /= 1_000_000;
        let adj = adj.min(i32::MAX as u64) as i32;
        if ppm < 0 {
            -adj
        } else {
            adj
        }
    }
}

/// A fixed-length conversion step precomputed by
/// [`ClockSourceInterval::new`].
///
/// Used to convert long cycle counts in constant-size steps, which keeps the
/// accumulated error bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSourceInterval {
    /// The number of cycles in one step.
    pub cycles: Cycle,
    /// The length of one step, scaled by `1 << shift`.
    scaled_ns: u128,
    shift: u32,
}

impl ClockSourceInterval {
    /// Calculate the number of cycles closest to `length_ns` (at least one).
    pub fn new(cs: &ClockSource, adj: i32, length_ns: u64) -> Self {
        let mult = cs.adjusted_mult(adj).max(1);
        let cycles = (((length_ns as u128) << cs.shift) / mult).max(1);
        let cycles = cycles.min(Cycle::MAX as u128) as Cycle;
        Self {
            cycles,
            scaled_ns: cycles as u128 * mult,
            shift: cs.shift,
        }
    }

    /// The length of one step in whole nanoseconds.
    pub fn ns(&self) -> u64 {
        (self.scaled_ns >> self.shift) as u64
    }

    /// Consume as many whole steps from `cycles` as possible and return the
    /// elapsed nanoseconds. The sub-nanosecond part is accumulated in `rem`.
    pub fn cyc2ns_fixed_rem(&self, cycles: &mut Cycle, rem: &mut u64) -> u64 {
        let steps = *cycles / self.cycles;
        *cycles -= steps * self.cycles;

        let scaled = steps as u128 * self.scaled_ns + *rem as u128;
        *rem = (scaled & ((1u128 << self.shift) - 1)) as u64;
        (scaled >> self.shift).min(u64::MAX as u128) as u64
    }
}

/// The set of registered clocksources and the currently active one.
pub struct ClockSourceRegistry {
    sources: spin::Mutex<ArrayVec<&'static ClockSource, MAX_CLOCKSOURCES>>,
    /// The active source. Null if none has been selected yet.
    current: AtomicPtr<ClockSource>,
}

impl ClockSourceRegistry {
    pub const fn new() -> Self {
        Self {
            sources: spin::Mutex::new(ArrayVec::new_const()),
            current: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Add a clocksource to the candidate set.
    ///
    /// Returns `Ok(true)` if `cs` outranks the active source, i.e., the next
    /// [`Self::reselect`] would switch to it (or to an even better one).
    pub fn register(&self, cs: &'static ClockSource) -> Result<bool, RegisterClockSourceError> {
        let mut sources = self.sources.lock();
        if sources
            .iter()
            .any(|x| ptr::eq(*x, cs) || x.name == cs.name)
        {
            return Err(RegisterClockSourceError::Duplicate);
        }
        sources
            .try_push(cs)
            .map_err(|_| RegisterClockSourceError::QueueOverflow)?;
        drop(sources);

        log::debug!("registered clocksource {:?} (rating {})", cs.name, cs.rating);

        Ok(match self.current() {
            Some(current) => cs.rating > current.rating,
            None => true,
        })
    }

    /// Find the best candidate without switching to it. Ties are won by the
    /// earliest registered source.
    pub fn get_next(&self) -> Option<&'static ClockSource> {
        let sources = self.sources.lock();
        let mut best: Option<&'static ClockSource> = None;
        for &cs in sources.iter() {
            if best.map_or(true, |b| cs.rating > b.rating) {
                best = Some(cs);
            }
        }
        best
    }

    /// Make the best candidate the active source and return it.
    pub fn reselect(&self) -> Option<&'static ClockSource> {
        let next = self.get_next()?;
        let next_ptr = next as *const ClockSource as *mut ClockSource;
        let old = self.current.swap(next_ptr, Ordering::AcqRel);
        if old != next_ptr {
            log::debug!("selected clocksource {:?}", next.name);
        }
        Some(next)
    }

    /// Return `true` if [`Self::reselect`] would change the active source.
    pub fn needs_reselect(&self) -> bool {
        match (self.get_next(), self.current()) {
            (Some(next), Some(current)) => !ptr::eq(next, current),
            (next, _) => next.is_some(),
        }
    }

    /// Get the active source. Never blocks.
    #[inline]
    pub fn current(&self) -> Option<&'static ClockSource> {
        // Safety: Only `&'static ClockSource` is ever stored in `current`
        unsafe { self.current.load(Ordering::Acquire).as_ref() }
    }

    /// Return `true` if the active source can drive one-shot timers.
    pub fn is_hres_capable(&self) -> bool {
        self.current().map_or(false, |cs| cs.is_continuous)
    }

    /// Get the number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClockSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClockSourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClockSourceRegistry")
            .field("current", &self.current().map(|cs| cs.name))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn read_zero() -> Cycle {
        0
    }

    fn leak(name: &'static str, rating: i32) -> &'static ClockSource {
        Box::leak(Box::new(ClockSource::new(
            name,
            rating,
            read_zero,
            clocksource_mask(32),
        )))
    }

    #[test]
    fn reselect_prefers_rating_then_registration_order() {
        let registry = ClockSourceRegistry::new();
        let a = leak("a", 100);
        let b = leak("b", 300);
        let c = leak("c", 300);

        assert_eq!(registry.register(a), Ok(true));
        assert_eq!(registry.register(b), Ok(true));
        assert!(ptr::eq(registry.reselect().unwrap(), b));

        assert_eq!(registry.register(c), Ok(false));
        assert!(!registry.needs_reselect());
        assert!(ptr::eq(registry.reselect().unwrap(), b));
        assert!(ptr::eq(registry.current().unwrap(), b));
    }

    #[test]
    fn register_rejects_duplicates_and_overflow() {
        let registry = ClockSourceRegistry::new();
        assert!(registry.reselect().is_none());

        let a = leak("a", 1);
        registry.register(a).unwrap();
        assert_eq!(
            registry.register(a),
            Err(RegisterClockSourceError::Duplicate)
        );

        for i in 1..MAX_CLOCKSOURCES {
            let name: &'static str = Box::leak(format!("cs{i}").into_boxed_str());
            registry.register(leak(name, 1)).unwrap();
        }
        assert_eq!(
            registry.register(leak("overflow", 500)),
            Err(RegisterClockSourceError::QueueOverflow)
        );
        assert_eq!(registry.len(), MAX_CLOCKSOURCES);
    }

    #[test]
    fn delta_wraps_under_mask() {
        let cs = ClockSource::new("w", 1, read_zero, clocksource_mask(16));
        assert_eq!(cs.delta(0x0005, 0xfffe), 7);
        assert_eq!(cs.delta(0x1234, 0x1234), 0);
        let cs = ClockSource::new("w64", 1, read_zero, clocksource_mask(64));
        assert_eq!(cs.delta(2, u64::MAX), 3);
    }

    #[test]
    fn mult_from_frequency() {
        // 1 MHz: one microsecond per cycle
        assert_eq!(hz2mult(1_000_000, 20), 1000 << 20);
        assert_eq!(khz2mult(1_000, 20), 1000 << 20);
        let cs = ClockSource::new("f", 1, read_zero, clocksource_mask(64))
            .with_frequency(1_000_000, 20);
        assert_eq!(cs.cyc2ns(0, 3), 3000);
        // 3 GHz rounds to the nearest representable scale
        let cs = ClockSource::new("g", 1, read_zero, clocksource_mask(64))
            .with_frequency(3_000_000_000, 22);
        let ns = cs.cyc2ns(0, 3_000_000_000);
        assert!(ns.abs_diff(1_000_000_000) < 1_000, "{ns}");
    }

    #[test]
    fn ppm_adjustment() {
        let cs = ClockSource::new("p", 1, read_zero, clocksource_mask(64))
            .with_frequency(1_000_000, 20);
        assert_eq!(cs.ppm_to_mult_adj(0), 0);
        // 100 ppm of `mult`
        let adj = cs.ppm_to_mult_adj(100 << SHIFT_USEC);
        assert_eq!(adj, (((1000u64 << 20) * 100 + 500_000) / 1_000_000) as i32);
        assert_eq!(cs.ppm_to_mult_adj(-100 << SHIFT_USEC), -adj);
        // One second of cycles runs 100µs fast
        assert_eq!(cs.cyc2ns(adj, 1_000_000), 1_000_100_000);
    }

    #[quickcheck]
    fn cyc2ns_is_monotonic(mult: u32, shift: u8, adj: i16, c1: u64, c2: u64) {
        let cs = ClockSource {
            mult,
            shift: (shift % 32) as u32,
            ..ClockSource::new("m", 1, read_zero, clocksource_mask(64))
        };
        let (lo, hi) = if c1 <= c2 { (c1, c2) } else { (c2, c1) };
        assert!(cs.cyc2ns(adj as i32, lo) <= cs.cyc2ns(adj as i32, hi));
    }

    #[quickcheck]
    fn cyc2ns_rem_does_not_drift(deltas: Vec<u16>, mult: u32, shift: u8) {
        let cs = ClockSource {
            mult,
            shift: (shift % 32) as u32,
            ..ClockSource::new("r", 1, read_zero, clocksource_mask(64))
        };
        let mut rem = 0;
        let total_ns: u64 = deltas
            .iter()
            .map(|&d| cs.cyc2ns_rem(0, d as Cycle, &mut rem))
            .sum();
        let total_cycles: u64 = deltas.iter().map(|&d| d as u64).sum();
        assert_eq!(total_ns, cs.cyc2ns(0, total_cycles));
        assert!(rem < 1 << cs.shift);
    }

    #[test]
    fn fixed_interval_conversion() {
        let cs = ClockSource::new("i", 1, read_zero, clocksource_mask(64))
            .with_frequency(3_000_000, 20);
        let interval = ClockSourceInterval::new(&cs, 0, 1_000_000);
        assert_eq!(interval.cycles, 3000);

        let mut cycles = 10_500;
        let mut rem = 0;
        let ns = interval.cyc2ns_fixed_rem(&mut cycles, &mut rem);
        assert_eq!(cycles, 1500);
        assert_eq!(ns + cs.cyc2ns_rem(0, cycles, &mut rem), cs.cyc2ns(0, 10_500));

        // A zero-length interval still makes progress
        assert_eq!(ClockSourceInterval::new(&cs, 0, 0).cycles, 1);
    }
}
