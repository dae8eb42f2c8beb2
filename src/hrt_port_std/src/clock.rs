//! Simulated clock hardware
use hrt_kernel::{
    clockevent::{ClockEvent, ClockEventDriver, ClockEventFeatures, ClockEventMode},
    clocksource::{clocksource_mask, ClockSource, Cycle},
};
use once_cell::sync::Lazy;
use spin::Mutex as SpinMutex;
use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

/// The frequency of the simulated counters. One cycle is one nanosecond.
pub const SIM_CLOCK_HZ: u32 = 1_000_000_000;

const SIM_CLOCK_SHIFT: u32 = 20;

static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Read the host's monotonic clock, in nanoseconds since the first call.
pub fn read_instant() -> Cycle {
    ORIGIN.elapsed().as_nanos() as Cycle
}

/// Construct a clocksource reading [`read_instant`].
pub const fn instant_clocksource(name: &'static str, rating: i32) -> ClockSource {
    ClockSource::new(name, rating, read_instant, clocksource_mask(64))
        .with_frequency(SIM_CLOCK_HZ, SIM_CLOCK_SHIFT)
        .with_continuous(true)
}

enum TimerCmd {
    SetTimeout { at: Instant },
    SetPeriod { period: Duration },
    Stop,
}

/// A clockevent device backed by a host thread. The thread sleeps until the
/// programmed deadline and then calls [`ClockEvent::handle_event`], playing
/// the role of the interrupt handler.
pub struct SimEventDriver {
    name: &'static str,
    period: Duration,
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
    join_handle: SpinMutex<Option<thread::JoinHandle<()>>>,
}

impl SimEventDriver {
    /// Construct a driver. `period` is the interval of the events in
    /// [`ClockEventMode::Periodic`].
    pub const fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            timer_cmd_send: SpinMutex::new(None),
            join_handle: SpinMutex::new(None),
        }
    }

    /// Construct a [`ClockEvent`] for this driver, supporting both modes.
    pub fn device(
        &'static self,
        min_delta_ns: u64,
        max_delta_ns: u64,
    ) -> ClockEvent {
        ClockEvent::new(
            self.name,
            ClockEventFeatures::TICK | ClockEventFeatures::NEXTEVT,
            self,
        )
        .with_delta_range(min_delta_ns, max_delta_ns)
        .with_frequency(SIM_CLOCK_HZ as u64, SIM_CLOCK_SHIFT)
    }

    /// Start the timer thread delivering events to `dev`. `dev` must be the
    /// device constructed by [`Self::device`].
    pub fn start(&'static self, dev: &'static ClockEvent) -> std::io::Result<()> {
        let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();
        log::trace!("{}: starting the timer thread", self.name);
        let join_handle = thread::Builder::new()
            .name(format!("{} irq", self.name))
            .spawn(move || {
                let mut next_deadline: Option<Instant> = None;
                let mut period: Option<Duration> = None;
                loop {
                    let recv_result = if let Some(deadline) = next_deadline {
                        timer_cmd_recv
                            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    } else {
                        timer_cmd_recv
                            .recv()
                            .map_err(|_| mpsc::RecvTimeoutError::Disconnected)
                    };
                    match recv_result {
                        Err(mpsc::RecvTimeoutError::Disconnected) | Ok(TimerCmd::Stop) => {
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            // The handler may program the next event, which
                            // overrides this
                            next_deadline = match (next_deadline, period) {
                                (Some(deadline), Some(period)) => Some(deadline + period),
                                _ => None,
                            };
                            dev.handle_event();
                        }
                        Ok(TimerCmd::SetTimeout { at }) => {
                            period = None;
                            next_deadline = Some(at);
                        }
                        Ok(TimerCmd::SetPeriod { period: p }) => {
                            period = (!p.is_zero()).then_some(p);
                            next_deadline = period.map(|p| Instant::now() + p);
                        }
                    }
                }
            })?;

        *self.timer_cmd_send.lock() = Some(timer_cmd_send);
        *self.join_handle.lock() = Some(join_handle);
        Ok(())
    }

    /// Stop the timer thread and wait for it to exit.
    pub fn stop(&self) {
        log::trace!("{}: stopping the timer thread", self.name);
        // `recv` returns `Err(_)` when the sender is dropped
        if let Some(send) = self.timer_cmd_send.lock().take() {
            let _ = send.send(TimerCmd::Stop);
        }
        let join_handle = self.join_handle.lock().take();
        if let Some(join_handle) = join_handle {
            if join_handle.thread().id() == thread::current().id() {
                // Called by the handler; the thread exits on its own
                return;
            }
            if let Err(e) = join_handle.join() {
                std::panic::resume_unwind(e);
            }
        }
        log::trace!("{}: stopped the timer thread", self.name);
    }

    fn send(&self, cmd: TimerCmd) {
        match &*self.timer_cmd_send.lock() {
            Some(send) => {
                let _ = send.send(cmd);
            }
            None => log::trace!("{}: not started, command dropped", self.name),
        }
    }
}

impl ClockEventDriver for SimEventDriver {
    fn set_next_event(&self, cycles: u64) {
        // One cycle is one nanosecond
        let at = Instant::now() + Duration::from_nanos(cycles);
        self.send(TimerCmd::SetTimeout { at });
    }

    fn set_mode(&self, mode: ClockEventMode) {
        let period = match mode {
            ClockEventMode::Periodic => self.period,
            ClockEventMode::Oneshot | ClockEventMode::Shutdown | ClockEventMode::Unused => {
                Duration::ZERO
            }
        };
        self.send(TimerCmd::SetPeriod { period });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrt_kernel::{clockevent::ClockEventHandler, ktime::Ktime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leak<T>(x: T) -> &'static T {
        Box::leak(Box::new(x))
    }

    struct Counter(AtomicUsize);

    impl ClockEventHandler for Counter {
        fn event_handler(&self, _: &ClockEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn instant_counts_nanoseconds() {
        let cs = leak(instant_clocksource("instant", 10));
        let a = cs.read();
        thread::sleep(Duration::from_millis(2));
        let b = cs.read();
        let ns = cs.cyc2ns(0, cs.delta(b, a));
        assert!(ns >= 2_000_000, "{ns}");
    }

    #[test]
    fn oneshot_and_periodic() {
        let _ = env_logger::builder().is_test(true).try_init();
        let driver = leak(SimEventDriver::new("sim", Duration::from_millis(1)));
        let dev = leak(driver.device(1_000, u64::MAX));
        let counter = leak(Counter(AtomicUsize::new(0)));
        dev.set_handler(counter);
        driver.start(dev).unwrap();

        dev.set_mode(ClockEventMode::Oneshot).unwrap();
        let now = Ktime::from_ns(read_instant() as i64);
        dev.program(now + Ktime::from_millis(1), now).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert_eq!(dev.next_event(), Ktime::MAX);

        dev.set_mode(ClockEventMode::Periodic).unwrap();
        thread::sleep(Duration::from_millis(20));
        dev.set_mode(ClockEventMode::Shutdown).unwrap();
        let n = counter.0.load(Ordering::Relaxed);
        assert!(n > 2, "{n}");

        driver.stop();
    }
}
