//! The system's notion of monotonic and wall-clock time, derived from the
//! active clocksource
//!
//! The [`Timekeeper`] keeps a base monotonic time and the counter value it
//! corresponds to (the *fold point*). Readers add the cycles elapsed since the
//! fold point to the base. [`Timekeeper::periodic_hook`] moves the fold point
//! forward, which must happen before the counter wraps around, and is the only
//! place where the active clocksource may change.
use core::fmt;

use crate::{
    clocksource::{ClockSource, ClockSourceRegistry, Cycle},
    ktime::Ktime,
};

/// A source of the current time for a timer base.
pub trait GetTime: Send + Sync {
    fn now(&self) -> Ktime;
}

struct TimekeeperState {
    cs: Option<&'static ClockSource>,
    /// The counter value at the fold point
    cycle_last: Cycle,
    /// The monotonic time at the fold point
    mono_base: Ktime,
    /// The sub-nanosecond part of `mono_base`, scaled by `1 << cs.shift`
    rem: u64,
    /// `realtime - monotonic`
    realtime_offset: Ktime,
    /// The frequency correction in NTP-scaled ppm
    ppm: i32,
    /// `ppm` converted for `cs`
    mult_adj: i32,
}

/// Tracks monotonic and wall-clock time.
pub struct Timekeeper {
    registry: &'static ClockSourceRegistry,
    state: spin::RwLock<TimekeeperState>,
}

impl Timekeeper {
    pub const fn new(registry: &'static ClockSourceRegistry) -> Self {
        Self {
            registry,
            state: spin::RwLock::new(TimekeeperState {
                cs: None,
                cycle_last: 0,
                mono_base: Ktime::ZERO,
                rem: 0,
                realtime_offset: Ktime::ZERO,
                ppm: 0,
                mult_adj: 0,
            }),
        }
    }

    /// Select the best registered clocksource and start counting from it.
    /// Time stands still at zero until this is called.
    pub fn init(&self) {
        let mut st = self.state.write();
        self.fold(&mut st);
        self.switch_to(&mut st, self.registry.reselect());
    }

    /// Get the registry this timekeeper selects clocksources from.
    pub fn registry(&self) -> &'static ClockSourceRegistry {
        self.registry
    }

    /// Get the clocksource currently used for timekeeping.
    pub fn clocksource(&self) -> Option<&'static ClockSource> {
        self.state.read().cs
    }

    /// Return `true` if the clocksource in use can drive one-shot timers.
    pub fn is_hres_capable(&self) -> bool {
        self.clocksource().map_or(false, |cs| cs.is_continuous)
    }

    /// Get the monotonic time. Never goes backwards.
    pub fn get_monotonic(&self) -> Ktime {
        let st = self.state.read();
        Self::monotonic_locked(&st)
    }

    /// Get the wall-clock time.
    pub fn get_realtime(&self) -> Ktime {
        let st = self.state.read();
        Self::monotonic_locked(&st) + st.realtime_offset
    }

    /// Get `realtime - monotonic`.
    pub fn get_realtime_offset(&self) -> Ktime {
        self.state.read().realtime_offset
    }

    /// Set the wall-clock time. The monotonic time is not affected.
    ///
    /// Timer bases on the realtime clock must be told with
    /// [`KtimerBase::clock_was_set`](crate::ktimer::KtimerBase::clock_was_set).
    pub fn settimeofday(&self, realtime: Ktime) {
        let mut st = self.state.write();
        let mono = Self::monotonic_locked(&st);
        st.realtime_offset = realtime - mono;
        log::debug!("wall clock set, offset = {:?}", st.realtime_offset);
    }

    /// Apply a frequency correction of `ppm` parts per million (scaled by
    /// `1 << SHIFT_USEC`) from now on. Returns the resulting `mult`
    /// adjustment.
    pub fn adjust(&self, ppm: i32) -> i32 {
        let mut st = self.state.write();
        // Time elapsed so far is accounted with the old correction
        self.fold(&mut st);
        st.ppm = ppm;
        st.mult_adj = st.cs.map_or(0, |cs| cs.ppm_to_mult_adj(ppm));
        log::trace!("frequency correction: ppm = {ppm}, mult_adj = {}", st.mult_adj);
        st.mult_adj
    }

    /// Move the fold point to the present, run the clocksource's update
    /// callback, and switch to a better clocksource if one has been
    /// registered.
    ///
    /// Must be called more often than the clocksource's counter wraps around.
    pub fn periodic_hook(&self) {
        let mut st = self.state.write();
        self.fold(&mut st);

        if let Some(cs) = st.cs {
            if cs.update_callback.map_or(false, |f| f()) {
                log::debug!("clocksource {:?} changed, resynchronizing", cs.name);
                st.cycle_last = cs.read();
                st.rem = 0;
            }
        }

        if self.registry.needs_reselect() {
            self.switch_to(&mut st, self.registry.reselect());
        }
    }

    fn monotonic_locked(st: &TimekeeperState) -> Ktime {
        match st.cs {
            Some(cs) => {
                let delta = cs.delta(cs.read(), st.cycle_last);
                let mut rem = st.rem;
                let ns = cs.cyc2ns_rem(st.mult_adj, delta, &mut rem);
                st.mono_base.add_ns(ns.min(i64::MAX as u64) as i64)
            }
            None => st.mono_base,
        }
    }

    /// Accumulate the cycles elapsed since the last fold point into
    /// `mono_base`.
    fn fold(&self, st: &mut TimekeeperState) {
        let Some(cs) = st.cs else { return };
        let now = cs.read();
        let delta = cs.delta(now, st.cycle_last);
        let ns = cs.cyc2ns_rem(st.mult_adj, delta, &mut st.rem);
        st.mono_base = st.mono_base.add_ns(ns.min(i64::MAX as u64) as i64);
        st.cycle_last = now;
    }

    /// Start counting from `cs`. The caller must have folded just before.
    fn switch_to(&self, st: &mut TimekeeperState, cs: Option<&'static ClockSource>) {
        let Some(cs) = cs else { return };
        if st.cs.map_or(false, |old| core::ptr::eq(old, cs)) {
            return;
        }
        log::debug!(
            "timekeeping: switching clocksource {:?} → {:?} at {:?}",
            st.cs.map(|cs| cs.name),
            cs.name,
            st.mono_base
        );
        st.cs = Some(cs);
        st.cycle_last = cs.read();
        st.rem = 0;
        st.mult_adj = cs.ppm_to_mult_adj(st.ppm);
    }
}

impl fmt::Debug for Timekeeper {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.state.read();
        f.debug_struct("Timekeeper")
            .field("clocksource", &st.cs.map(|cs| cs.name))
            .field("mono_base", &st.mono_base)
            .field("realtime_offset", &st.realtime_offset)
            .field("mult_adj", &st.mult_adj)
            .finish()
    }
}

/// [`GetTime`] reading [`Timekeeper::get_monotonic`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock<'a>(pub &'a Timekeeper);

impl GetTime for MonotonicClock<'_> {
    #[inline]
    fn now(&self) -> Ktime {
        self.0.get_monotonic()
    }
}

/// [`GetTime`] reading [`Timekeeper::get_realtime`].
#[derive(Debug, Clone, Copy)]
pub struct RealtimeClock<'a>(pub &'a Timekeeper);

impl GetTime for RealtimeClock<'_> {
    #[inline]
    fn now(&self) -> Ktime {
        self.0.get_realtime()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocksource::clocksource_mask;
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    // Each test owns its counters so that tests can run in parallel

    macro_rules! counter {
        ($name:ident) => {
            static $name: AtomicU64 = AtomicU64::new(0);
        };
    }

    fn leak<T>(x: T) -> &'static T {
        Box::leak(Box::new(x))
    }

    #[test]
    fn stands_still_without_clocksource() {
        let registry = leak(ClockSourceRegistry::new());
        let tk = Timekeeper::new(registry);
        tk.init();
        assert_eq!(tk.get_monotonic(), Ktime::ZERO);
        tk.periodic_hook();
        assert_eq!(tk.get_monotonic(), Ktime::ZERO);
    }

    #[test]
    fn counts_and_folds() {
        counter!(C);
        // 1 GHz, 1:1
        static CS: ClockSource =
            ClockSource::new("c", 100, || C.load(Ordering::Relaxed), u64::MAX);
        let registry = leak(ClockSourceRegistry::new());
        registry.register(&CS).unwrap();
        let tk = Timekeeper::new(registry);
        tk.init();

        C.store(1_000, Ordering::Relaxed);
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(1_000));
        tk.periodic_hook();
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(1_000));
        C.store(2_500, Ordering::Relaxed);
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(2_500));
    }

    #[test]
    fn survives_wraparound_between_folds() {
        counter!(C);
        static CS: ClockSource =
            ClockSource::new("w", 100, || C.load(Ordering::Relaxed), clocksource_mask(16));
        let registry = leak(ClockSourceRegistry::new());
        registry.register(&CS).unwrap();
        let tk = Timekeeper::new(registry);

        C.store(0xfff0, Ordering::Relaxed);
        tk.init();
        let t0 = tk.get_monotonic();

        C.store(0x10010, Ordering::Relaxed);
        assert_eq!(tk.get_monotonic() - t0, Ktime::from_ns(0x20));
        tk.periodic_hook();
        C.store(0x10030, Ordering::Relaxed);
        assert_eq!(tk.get_monotonic() - t0, Ktime::from_ns(0x40));
    }

    #[test]
    fn realtime_offset() {
        counter!(C);
        static CS: ClockSource =
            ClockSource::new("r", 100, || C.load(Ordering::Relaxed), u64::MAX);
        let registry = leak(ClockSourceRegistry::new());
        registry.register(&CS).unwrap();
        let tk = Timekeeper::new(registry);
        tk.init();

        C.store(500, Ordering::Relaxed);
        tk.settimeofday(Ktime::set(1_000, 0));
        assert_eq!(tk.get_realtime(), Ktime::set(1_000, 0));
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(500));
        assert_eq!(tk.get_realtime_offset(), Ktime::set(1_000, 0) - Ktime::from_ns(500));

        C.store(700, Ordering::Relaxed);
        assert_eq!(tk.get_realtime(), Ktime::set(1_000, 200));
        assert_eq!(RealtimeClock(&tk).now(), Ktime::set(1_000, 200));
        assert_eq!(MonotonicClock(&tk).now(), Ktime::from_ns(700));
    }

    #[test]
    fn switches_only_at_fold_point() {
        counter!(SLOW);
        counter!(FAST);
        // 1 MHz
        static SLOW_CS: ClockSource =
            ClockSource::new("slow", 100, || SLOW.load(Ordering::Relaxed), u64::MAX)
                .with_frequency(1_000_000, 20);
        static FAST_CS: ClockSource =
            ClockSource::new("fast", 300, || FAST.load(Ordering::Relaxed), u64::MAX)
                .with_continuous(true);

        let registry = leak(ClockSourceRegistry::new());
        registry.register(&SLOW_CS).unwrap();
        let tk = Timekeeper::new(registry);
        tk.init();
        assert!(!tk.is_hres_capable());

        SLOW.store(10, Ordering::Relaxed);
        FAST.store(123_456, Ordering::Relaxed);
        assert_eq!(registry.register(&FAST_CS), Ok(true));

        // Not switched yet
        assert_eq!(tk.clocksource().map(|cs| cs.name), Some("slow"));
        assert_eq!(tk.get_monotonic(), Ktime::from_micros(10));

        tk.periodic_hook();
        assert_eq!(tk.clocksource().map(|cs| cs.name), Some("fast"));
        assert!(tk.is_hres_capable());
        // Continuous across the switch
        assert_eq!(tk.get_monotonic(), Ktime::from_micros(10));
        FAST.store(123_456 + 42, Ordering::Relaxed);
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(10_042));
    }

    #[test]
    fn frequency_correction() {
        counter!(C);
        static CS: ClockSource =
            ClockSource::new("f", 100, || C.load(Ordering::Relaxed), u64::MAX)
                .with_frequency(1_000_000_000, 20);
        let registry = leak(ClockSourceRegistry::new());
        registry.register(&CS).unwrap();
        let tk = Timekeeper::new(registry);
        tk.init();

        C.store(1_000_000, Ordering::Relaxed);
        // +100 ppm
        let adj = tk.adjust(100 << crate::clocksource::SHIFT_USEC);
        assert!(adj > 0);
        let t0 = tk.get_monotonic();
        assert_eq!(t0, Ktime::from_ns(1_000_000));

        C.store(2_000_000, Ordering::Relaxed);
        let elapsed = (tk.get_monotonic() - t0).to_ns();
        assert!((1_000_099..=1_000_101).contains(&elapsed), "{elapsed}");
    }

    #[test]
    fn update_callback_resynchronizes() {
        counter!(C);
        static RESET: AtomicBool = AtomicBool::new(false);
        // The callback resets the counter on request and reports it
        static CS: ClockSource = ClockSource {
            update_callback: Some(|| {
                let reset = RESET.swap(false, Ordering::Relaxed);
                if reset {
                    C.store(0, Ordering::Relaxed);
                }
                reset
            }),
            ..ClockSource::new("u", 100, || C.load(Ordering::Relaxed), u64::MAX)
        };
        let registry = leak(ClockSourceRegistry::new());
        registry.register(&CS).unwrap();
        let tk = Timekeeper::new(registry);
        tk.init();

        C.store(100, Ordering::Relaxed);
        tk.periodic_hook();
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(100));

        C.store(150, Ordering::Relaxed);
        RESET.store(true, Ordering::Relaxed);
        tk.periodic_hook();
        assert_eq!(C.load(Ordering::Relaxed), 0);
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(150));
        C.store(5, Ordering::Relaxed);
        assert_eq!(tk.get_monotonic(), Ktime::from_ns(155));
    }
}
