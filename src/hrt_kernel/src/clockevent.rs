//! Clockevent devices: programmable interrupt sources
use bitflags::bitflags;
use core::{
    fmt,
    sync::atomic::{AtomicI64, AtomicU8, Ordering},
};

use crate::{
    error::{ProgramEventError, SetEventModeError},
    ktime::{Ktime, NSEC_PER_SEC},
};

bitflags! {
    /// The capabilities of a clockevent device.
    pub struct ClockEventFeatures: u32 {
        /// The device can deliver a periodic tick ([`ClockEventMode::Periodic`]).
        const TICK = 1 << 0;
        /// The device can be programmed for the next event
        /// ([`ClockEventMode::Oneshot`]).
        const NEXTEVT = 1 << 1;
        /// The device's interrupt may be used for process time accounting.
        const UPDATE = 1 << 2;
        /// The device's interrupt may be used for profiling.
        const PROFILE = 1 << 3;
    }
}

/// The operating mode of a clockevent device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClockEventMode {
    /// Not yet configured.
    Unused = 0,
    /// Stopped. No interrupt is armed.
    Shutdown = 1,
    /// Delivers an interrupt every tick.
    Periodic = 2,
    /// Delivers a single interrupt at the programmed time.
    Oneshot = 3,
}

impl ClockEventMode {
    fn from_u8(x: u8) -> Self {
        match x {
            1 => Self::Shutdown,
            2 => Self::Periodic,
            3 => Self::Oneshot,
            _ => Self::Unused,
        }
    }
}

/// The hardware-specific part of a clockevent device.
pub trait ClockEventDriver: Send + Sync {
    /// Arm the device to fire after `cycles` device cycles.
    fn set_next_event(&self, cycles: u64);

    /// Switch the hardware to `mode`. `Shutdown` and `Unused` must leave no
    /// interrupt armed.
    fn set_mode(&self, mode: ClockEventMode);
}

/// Receives the events of a clockevent device.
pub trait ClockEventHandler: Send + Sync {
    /// Called from the device's interrupt path. Interrupts may be masked, so
    /// this must not block.
    fn event_handler(&self, dev: &ClockEvent);
}

/// Calculate a `mult` value converting nanoseconds to device ticks
/// (`ticks` ticks per `nsec` nanoseconds).
pub const fn div_sc(ticks: u64, nsec: u64, shift: u32) -> u32 {
    (((ticks as u128) << shift) / nsec as u128) as u32
}

/// A programmable interrupt source.
pub struct ClockEvent {
    pub name: &'static str,
    pub features: ClockEventFeatures,
    /// The longest programmable delta.
    pub max_delta_ns: u64,
    /// The shortest programmable delta.
    pub min_delta_ns: u64,
    /// `cycles = (ns * mult) >> shift`
    pub mult: u32,
    pub shift: u32,
    driver: &'static dyn ClockEventDriver,
    mode: AtomicU8,
    /// The absolute time of the armed event, `Ktime::MAX` if none.
    next_event: AtomicI64,
    handler: spin::RwLock<Option<&'static dyn ClockEventHandler>>,
}

impl ClockEvent {
    pub const fn new(
        name: &'static str,
        features: ClockEventFeatures,
        driver: &'static dyn ClockEventDriver,
    ) -> Self {
        Self {
            name,
            features,
            max_delta_ns: u64::MAX,
            min_delta_ns: 1,
            mult: 1,
            shift: 0,
            driver,
            mode: AtomicU8::new(ClockEventMode::Unused as u8),
            next_event: AtomicI64::new(i64::MAX),
            handler: spin::RwLock::new(None),
        }
    }

    /// Set the programmable delta range.
    pub const fn with_delta_range(self, min_delta_ns: u64, max_delta_ns: u64) -> Self {
        Self {
            min_delta_ns,
            max_delta_ns,
            ..self
        }
    }

    /// Set `mult` and `shift` for a device counting at `hz` Hz.
    pub const fn with_frequency(self, hz: u64, shift: u32) -> Self {
        Self {
            mult: div_sc(hz, NSEC_PER_SEC as u64, shift),
            shift,
            ..self
        }
    }

    /// Get the current mode.
    #[inline]
    pub fn mode(&self) -> ClockEventMode {
        ClockEventMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Get the absolute time of the armed event, or `Ktime::MAX` if none is
    /// armed.
    #[inline]
    pub fn next_event(&self) -> Ktime {
        Ktime::from_ns(self.next_event.load(Ordering::Acquire))
    }

    /// Switch the device to `mode`.
    ///
    /// `Shutdown` and `Unused` are accepted from any mode. Every mode change
    /// disarms the pending one-shot event.
    pub fn set_mode(&self, mode: ClockEventMode) -> Result<(), SetEventModeError> {
        let required = match mode {
            ClockEventMode::Periodic => ClockEventFeatures::TICK,
            ClockEventMode::Oneshot => ClockEventFeatures::NEXTEVT,
            ClockEventMode::Unused | ClockEventMode::Shutdown => ClockEventFeatures::empty(),
        };
        if !self.features.contains(required) {
            return Err(SetEventModeError::NotSupported);
        }

        log::debug!("clockevent {:?}: {:?} → {:?}", self.name, self.mode(), mode);

        self.next_event.store(i64::MAX, Ordering::Release);
        self.mode.store(mode as u8, Ordering::Release);
        self.driver.set_mode(mode);
        Ok(())
    }

    /// Convert a device latch value to nanoseconds.
    pub fn delta2ns(&self, latch: u64) -> u64 {
        if self.mult == 0 {
            return u64::MAX;
        }
        (((latch as u128) << self.shift) / self.mult as u128).min(u64::MAX as u128) as u64
    }

    /// Rounds up so that the device never fires before the requested time.
    fn ns2cycles(&self, delta_ns: u64) -> u64 {
        let scaled = delta_ns as u128 * self.mult as u128 + ((1u128 << self.shift) - 1);
        (scaled >> self.shift).min(u64::MAX as u128) as u64
    }

    /// Arm the device to fire at `expires`, given the current time `now`.
    ///
    /// Fails without touching the hardware if the device is not in the
    /// one-shot mode or `expires - now` is outside the programmable range.
    pub fn program(&self, expires: Ktime, now: Ktime) -> Result<(), ProgramEventError> {
        if self.mode() != ClockEventMode::Oneshot {
            return Err(ProgramEventError::BadObjectState);
        }

        let delta = expires - now;
        if delta.to_ns() < 0 || (delta.to_ns() as u64) < self.min_delta_ns {
            return Err(ProgramEventError::DeltaTooSmall);
        }
        let delta_ns = delta.to_ns() as u64;
        if delta_ns > self.max_delta_ns {
            return Err(ProgramEventError::DeltaTooLarge);
        }

        log::trace!("clockevent {:?}: next event in {:?}", self.name, delta);

        self.next_event.store(expires.to_ns(), Ordering::Release);
        self.driver.set_next_event(self.ns2cycles(delta_ns));
        Ok(())
    }

    /// Arm the device to fire `delta` after `now`.
    #[inline]
    pub fn program_in(&self, delta: Ktime, now: Ktime) -> Result<(), ProgramEventError> {
        self.program(now + delta, now)
    }

    /// Arm the device for the earliest time it supports. Used as the fallback
    /// when the desired deadline is too close or already passed.
    pub fn program_soonest(&self, now: Ktime) -> Result<(), ProgramEventError> {
        let min = Ktime::from_ns(self.min_delta_ns.min(i64::MAX as u64) as i64);
        self.program(now + min, now)
    }

    /// Register the receiver of this device's events, replacing any previous
    /// one.
    pub fn set_handler(&self, handler: &'static dyn ClockEventHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Unregister the receiver of this device's events.
    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    /// Process an interrupt from the device. Called by the port's interrupt
    /// path.
    pub fn handle_event(&self) {
        if self.mode() == ClockEventMode::Oneshot {
            self.next_event.store(i64::MAX, Ordering::Release);
        }

        // Copy the handler out so that the handler may replace itself
        let handler = *self.handler.read();
        match handler {
            Some(handler) => handler.event_handler(self),
            None => log::trace!("clockevent {:?}: event without a handler", self.name),
        }
    }
}

impl fmt::Debug for ClockEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClockEvent")
            .field("name", &self.name)
            .field("features", &self.features)
            .field("mode", &self.mode())
            .field("next_event", &self.next_event())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        SetNextEvent(u64),
        SetMode(ClockEventMode),
    }

    #[derive(Default)]
    struct RecordingDriver {
        calls: spin::Mutex<Vec<Call>>,
    }

    impl ClockEventDriver for RecordingDriver {
        fn set_next_event(&self, cycles: u64) {
            self.calls.lock().push(Call::SetNextEvent(cycles));
        }

        fn set_mode(&self, mode: ClockEventMode) {
            self.calls.lock().push(Call::SetMode(mode));
        }
    }

    #[derive(Default)]
    struct CountingHandler(AtomicUsize);

    impl ClockEventHandler for CountingHandler {
        fn event_handler(&self, _: &ClockEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn device(features: ClockEventFeatures) -> (&'static RecordingDriver, &'static ClockEvent) {
        let driver: &'static RecordingDriver = Box::leak(Box::default());
        let dev = Box::leak(Box::new(
            ClockEvent::new("test", features, driver)
                .with_delta_range(1_000, 1_000_000)
                .with_frequency(1_000_000, 32),
        ));
        (driver, dev)
    }

    #[test]
    fn program_range() {
        let (driver, dev) = device(ClockEventFeatures::NEXTEVT);
        let now = Ktime::from_ns(10_000);

        assert_eq!(
            dev.program(now + Ktime::from_ns(5_000), now),
            Err(ProgramEventError::BadObjectState)
        );
        dev.set_mode(ClockEventMode::Oneshot).unwrap();

        assert_eq!(
            dev.program(now + Ktime::from_ns(999), now),
            Err(ProgramEventError::DeltaTooSmall)
        );
        assert_eq!(
            dev.program(now - Ktime::from_ns(1), now),
            Err(ProgramEventError::DeltaTooSmall)
        );
        assert_eq!(
            dev.program(now + Ktime::from_ns(1_000_001), now),
            Err(ProgramEventError::DeltaTooLarge)
        );

        dev.program(now + Ktime::from_ns(5_000), now).unwrap();
        assert_eq!(dev.next_event(), Ktime::from_ns(15_000));

        dev.program_soonest(now).unwrap();
        assert_eq!(dev.next_event(), Ktime::from_ns(11_000));

        // 1 MHz: 5µs is five cycles, 1µs is one
        assert_eq!(
            *driver.calls.lock(),
            [
                Call::SetMode(ClockEventMode::Oneshot),
                Call::SetNextEvent(5),
                Call::SetNextEvent(1),
            ]
        );
    }

    #[test]
    fn unsupported_mode() {
        let (_, dev) = device(ClockEventFeatures::NEXTEVT);
        assert_eq!(
            dev.set_mode(ClockEventMode::Periodic),
            Err(SetEventModeError::NotSupported)
        );
        assert_eq!(dev.mode(), ClockEventMode::Unused);
    }

    #[test]
    fn shutdown_disarms() {
        let (driver, dev) = device(ClockEventFeatures::NEXTEVT | ClockEventFeatures::TICK);
        dev.set_mode(ClockEventMode::Shutdown).unwrap();
        dev.set_mode(ClockEventMode::Oneshot).unwrap();
        dev.program_in(Ktime::from_ns(2_000), Ktime::ZERO).unwrap();
        dev.set_mode(ClockEventMode::Shutdown).unwrap();
        assert_eq!(dev.next_event(), Ktime::MAX);
        assert_eq!(
            driver.calls.lock().last(),
            Some(&Call::SetMode(ClockEventMode::Shutdown))
        );
        dev.set_mode(ClockEventMode::Periodic).unwrap();
        dev.set_mode(ClockEventMode::Unused).unwrap();
    }

    #[test]
    fn mode_change_disarms() {
        let (_driver, dev) = device(ClockEventFeatures::NEXTEVT | ClockEventFeatures::TICK);
        dev.set_mode(ClockEventMode::Oneshot).unwrap();
        dev.program_in(Ktime::from_ns(2_000), Ktime::ZERO).unwrap();
        assert_eq!(dev.next_event(), Ktime::from_ns(2_000));

        // Re-entering the one-shot mode drops the armed event
        dev.set_mode(ClockEventMode::Oneshot).unwrap();
        assert_eq!(dev.next_event(), Ktime::MAX);

        dev.program_in(Ktime::from_ns(2_000), Ktime::ZERO).unwrap();
        dev.set_mode(ClockEventMode::Periodic).unwrap();
        assert_eq!(dev.next_event(), Ktime::MAX);
    }

    #[test]
    fn handle_event_calls_handler() {
        let (_, dev) = device(ClockEventFeatures::NEXTEVT);
        dev.handle_event();

        let handler: &'static CountingHandler = Box::leak(Box::default());
        dev.set_handler(handler);
        dev.set_mode(ClockEventMode::Oneshot).unwrap();
        dev.program_in(Ktime::from_ns(2_000), Ktime::ZERO).unwrap();
        dev.handle_event();
        dev.handle_event();
        assert_eq!(handler.0.load(Ordering::Relaxed), 2);
        assert_eq!(dev.next_event(), Ktime::MAX);

        dev.clear_handler();
        dev.handle_event();
        assert_eq!(handler.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn conversions() {
        let (_, dev) = device(ClockEventFeatures::NEXTEVT);
        assert_eq!(div_sc(1_000_000, 1_000_000_000, 32), 4_294_967);
        // 4294967 / 2^32 ticks per ns ≈ one tick per µs
        let ns = dev.delta2ns(1_000);
        assert!(ns.abs_diff(1_000_000) < 100, "{ns}");
    }
}
