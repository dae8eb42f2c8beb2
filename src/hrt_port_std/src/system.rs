//! Wiring the kernel objects together
use hrt_kernel::{
    clockevent::{ClockEvent, ClockEventHandler, ClockEventMode},
    clocksource::{ClockSource, ClockSourceRegistry},
    error::{RegisterClockSourceError, SetEventModeError, StartTimerError},
    ktime::{Ktime, KTIME_LOW_RES},
    ktimer::{ClockId, Ktimer, KtimerBase, KtimerMode, StartFlags},
    timekeeping::{GetTime, MonotonicClock, RealtimeClock, Timekeeper},
};
use std::{fmt, pin::Pin, time::Duration, vec::Vec};

use crate::{
    clock::{instant_clocksource, SimEventDriver},
    threading::StdPort,
};

/// A timer base of this port.
pub type Base = KtimerBase<StdPort>;

/// A timer of this port.
pub type Timer<'b> = Ktimer<'b, StdPort>;

/// The error type of [`SystemBuilder::build`].
#[derive(Debug)]
pub enum BuildError {
    RegisterClockSource(RegisterClockSourceError),
    SetEventMode(SetEventModeError),
    StartTimer(StartTimerError),
    SpawnThread(std::io::Error),
}

impl From<RegisterClockSourceError> for BuildError {
    fn from(x: RegisterClockSourceError) -> Self {
        Self::RegisterClockSource(x)
    }
}

impl From<SetEventModeError> for BuildError {
    fn from(x: SetEventModeError) -> Self {
        Self::SetEventMode(x)
    }
}

impl From<StartTimerError> for BuildError {
    fn from(x: StartTimerError) -> Self {
        Self::StartTimer(x)
    }
}

impl From<std::io::Error> for BuildError {
    fn from(x: std::io::Error) -> Self {
        Self::SpawnThread(x)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RegisterClockSource(e) => write!(f, "could not register the clocksource: {e:?}"),
            Self::SetEventMode(e) => write!(f, "could not configure the clockevent: {e:?}"),
            Self::StartTimer(e) => write!(f, "could not start the tick timer: {e:?}"),
            Self::SpawnThread(e) => write!(f, "could not spawn a timer thread: {e}"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Configures a [`System`].
#[derive(Debug, Clone)]
pub struct SystemBuilder {
    clocksource_rating: i32,
    high_resolution: bool,
    tick_period: Ktime,
    min_delta_ns: u64,
    max_delta_ns: u64,
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBuilder {
    pub const fn new() -> Self {
        Self {
            clocksource_rating: 300,
            high_resolution: true,
            tick_period: KTIME_LOW_RES,
            min_delta_ns: 1_000,
            max_delta_ns: 1_000_000_000,
        }
    }

    /// Set the rating of the host clocksource.
    pub const fn clocksource_rating(self, rating: i32) -> Self {
        Self {
            clocksource_rating: rating,
            ..self
        }
    }

    /// Choose between one-shot clockevent devices driving each timer base
    /// (`true`) and a periodic tick (`false`). High-resolution mode also
    /// requires a continuous clocksource.
    pub const fn high_resolution(self, high_resolution: bool) -> Self {
        Self {
            high_resolution,
            ..self
        }
    }

    /// Set the tick period, which is also the timer resolution in
    /// low-resolution mode.
    pub const fn tick_period(self, tick_period: Ktime) -> Self {
        Self { tick_period, ..self }
    }

    /// Set the programmable range of the simulated clockevent devices.
    pub const fn delta_range(self, min_delta_ns: u64, max_delta_ns: u64) -> Self {
        Self {
            min_delta_ns,
            max_delta_ns,
            ..self
        }
    }

    /// Create the kernel objects and start the timer threads.
    ///
    /// The objects are leaked because the kernel refers to them by `'static`
    /// references.
    pub fn build(self) -> Result<System, BuildError> {
        let registry: &'static ClockSourceRegistry = leak(ClockSourceRegistry::new());
        let clocksource: &'static ClockSource =
            leak(instant_clocksource("instant", self.clocksource_rating));
        registry.register(clocksource)?;

        let timekeeper: &'static Timekeeper = leak(Timekeeper::new(registry));
        timekeeper.init();

        let hres = self.high_resolution && timekeeper.is_hres_capable();
        let resolution = if hres {
            Ktime::from_ns(1)
        } else {
            self.tick_period
        };
        let tick_period = Duration::try_from(self.tick_period).unwrap_or(Duration::from_millis(1));

        let monotonic: &'static Base = leak(KtimerBase::new(
            ClockId::Monotonic,
            "monotonic",
            resolution,
            leak(MonotonicClock(timekeeper)) as &dyn GetTime,
        ));
        let realtime: &'static Base = leak(KtimerBase::new(
            ClockId::Realtime,
            "realtime",
            resolution,
            leak(RealtimeClock(timekeeper)) as &dyn GetTime,
        ));

        let mut system = System {
            registry,
            timekeeper,
            monotonic,
            realtime,
            drivers: Vec::new(),
            tick_timer: None,
        };

        if hres {
            log::debug!("starting in high-resolution mode");
            for base in [monotonic, realtime] {
                let dev = system.start_device(base.name(), tick_period, &self)?;
                dev.set_mode(ClockEventMode::Oneshot)?;
                base.bind_clockevent(dev);
            }

            // Fold the clocksource regularly
            let tick_timer: &'static Timer<'static> = leak(
                Ktimer::new(monotonic, periodic_hook, timekeeper as *const Timekeeper as usize)
                    .with_interval(self.tick_period),
            );
            let tick_timer = Pin::static_ref(tick_timer);
            tick_timer.start(self.tick_period, KtimerMode::Rel, StartFlags::empty())?;
            system.tick_timer = Some(tick_timer);
        } else {
            log::debug!("starting in low-resolution mode, tick = {:?}", self.tick_period);
            let dev = system.start_device("tick", tick_period, &self)?;
            dev.set_handler(leak(TickHandler {
                timekeeper,
                bases: [monotonic, realtime],
            }));
            dev.set_mode(ClockEventMode::Periodic)?;
        }

        Ok(system)
    }
}

fn leak<T>(x: T) -> &'static T {
    Box::leak(Box::new(x))
}

fn periodic_hook(data: usize) {
    // Safety: `data` is the leaked `Timekeeper`
    let timekeeper = unsafe { &*(data as *const Timekeeper) };
    timekeeper.periodic_hook();
}

/// Services everything from a periodic tick in low-resolution mode.
struct TickHandler {
    timekeeper: &'static Timekeeper,
    bases: [&'static Base; 2],
}

impl ClockEventHandler for TickHandler {
    fn event_handler(&self, _: &ClockEvent) {
        self.timekeeper.periodic_hook();
        for base in self.bases {
            base.run_queues();
        }
    }
}

/// The clocks and timer bases of a running system. Dropping it stops the
/// timer threads.
pub struct System {
    registry: &'static ClockSourceRegistry,
    timekeeper: &'static Timekeeper,
    monotonic: &'static Base,
    realtime: &'static Base,
    drivers: Vec<(&'static SimEventDriver, &'static ClockEvent)>,
    tick_timer: Option<Pin<&'static Timer<'static>>>,
}

impl System {
    fn start_device(
        &mut self,
        name: &'static str,
        period: Duration,
        builder: &SystemBuilder,
    ) -> Result<&'static ClockEvent, BuildError> {
        let driver: &'static SimEventDriver = leak(SimEventDriver::new(name, period));
        let dev: &'static ClockEvent =
            leak(driver.device(builder.min_delta_ns, builder.max_delta_ns));
        driver.start(dev)?;
        self.drivers.push((driver, dev));
        Ok(dev)
    }

    pub fn registry(&self) -> &'static ClockSourceRegistry {
        self.registry
    }

    pub fn timekeeper(&self) -> &'static Timekeeper {
        self.timekeeper
    }

    /// Get the timer base measuring the monotonic time.
    pub fn monotonic(&self) -> &'static Base {
        self.monotonic
    }

    /// Get the timer base measuring the wall-clock time.
    pub fn realtime(&self) -> &'static Base {
        self.realtime
    }

    /// Get the base for `clock`.
    pub fn base(&self, clock: ClockId) -> &'static Base {
        match clock {
            ClockId::Monotonic => self.monotonic,
            ClockId::Realtime => self.realtime,
        }
    }

    /// Return `true` if the bases are driven by one-shot clockevent devices.
    pub fn is_hres(&self) -> bool {
        self.monotonic.is_hres()
    }

    /// Register another clocksource. The timekeeper switches to it at the
    /// next fold point if it's rated higher than the current one.
    pub fn register_clocksource(
        &self,
        cs: &'static ClockSource,
    ) -> Result<bool, RegisterClockSourceError> {
        let outranks = self.registry.register(cs)?;
        if outranks {
            log::debug!("clocksource {:?} will take over at the next tick", cs.name);
        }
        Ok(outranks)
    }

    /// Set the wall-clock time. Timers on the realtime base are re-evaluated.
    pub fn settimeofday(&self, realtime: Ktime) {
        self.timekeeper.settimeofday(realtime);
        self.realtime.clock_was_set();
    }

    /// Block the calling thread for `duration` on the monotonic base.
    pub fn sleep(&self, duration: Ktime) {
        // A relative start never fails
        let _ = self.monotonic.nanosleep(duration, KtimerMode::Rel);
    }
}

impl Drop for System {
    fn drop(&mut self) {
        if let Some(tick_timer) = self.tick_timer.take() {
            tick_timer.cancel();
        }
        self.monotonic.unbind_clockevent();
        self.realtime.unbind_clockevent();
        for (driver, dev) in self.drivers.drain(..) {
            let _ = dev.set_mode(ClockEventMode::Shutdown);
            dev.clear_handler();
            driver.stop();
        }
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("System")
            .field("timekeeper", self.timekeeper)
            .field("monotonic", self.monotonic)
            .field("realtime", self.realtime)
            .field("hres", &self.is_hres())
            .finish()
    }
}
