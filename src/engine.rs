// src/engine.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::drivers::{unit_for_mode, EventSender, Mode, Multimeter, Rate};
use crate::types::{AcquisitionCommand, Event, Sample};

/// Poll rates below this are raised to it so the loop keeps producing.
pub const MIN_POLL_HZ: f64 = 0.5;
pub const RANGE_REFRESH_INTERVAL: Duration = Duration::from_secs(3);
const JOIN_SLACK: Duration = Duration::from_millis(100);

/// Time between cycle starts for a requested rate, floored at [`MIN_POLL_HZ`].
pub fn poll_period(requested_hz: f64) -> Duration {
    let hz = if requested_hz.is_nan() {
        MIN_POLL_HZ
    } else {
        requested_hz.max(MIN_POLL_HZ)
    };
    Duration::from_secs_f64(1.0 / hz)
}

pub fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Wall-clock seconds that advance with the monotonic clock, so sample
/// timestamps never step backwards within a run.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    wall_origin: f64,
    mono_origin: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            wall_origin: wall_clock_seconds(),
            mono_origin: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.wall_origin + self.mono_origin.elapsed().as_secs_f64()
    }
}

/// Flags the consumer raises for the worker. Either one wakes it from an
/// idle wait.
#[derive(Debug, Default)]
struct Signals {
    stop: AtomicBool,
    commands: AtomicBool,
}

/// Queued commands folded into their net effect: only the latest of each kind
/// survives, so a burst of mode selections costs a single settle delay.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct PendingSettings {
    mode: Option<Mode>,
    rate: Option<Rate>,
    poll_hz: Option<f64>,
}

impl PendingSettings {
    fn collect(rx_cmd: &Receiver<AcquisitionCommand>, signals: &Signals) -> Self {
        signals.commands.store(false, Ordering::Release);
        let mut pending = Self::default();
        while let Ok(cmd) = rx_cmd.try_recv() {
            match cmd {
                AcquisitionCommand::SetMode(mode) => pending.mode = Some(mode),
                AcquisitionCommand::SetRate(rate) => pending.rate = Some(rate),
                AcquisitionCommand::SetPollHz(hz) => pending.poll_hz = Some(hz),
            }
        }
        pending
    }

    /// Writes mode and rate without waiting for the meter to settle. Returns
    /// whether the function was changed.
    fn write_to(&self, meter: &mut Multimeter) -> bool {
        if let Some(mode) = self.mode {
            meter.configure_mode(mode);
        }
        if let Some(rate) = self.rate {
            meter.set_rate(rate);
        }
        self.mode.is_some()
    }
}

/// Handle to the background polling worker. At most one exists per session.
pub struct Acquisition {
    signals: Arc<Signals>,
    commands: Sender<AcquisitionCommand>,
    finished: Receiver<Multimeter>,
    worker: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl Acquisition {
    /// Moves the meter onto a new worker thread which polls it at `poll_hz`
    /// until [`Acquisition::stop`] is called.
    pub fn start(meter: Multimeter, events: EventSender, poll_hz: f64) -> Self {
        let signals = Arc::new(Signals::default());
        let (commands, rx_cmd) = channel();
        let (done_tx, finished) = channel();
        let join_timeout = meter.transport().timeout() + meter.settle_delay() + JOIN_SLACK;
        let shared = Arc::clone(&signals);
        let worker = thread::spawn(move || {
            let meter = run(meter, &events, &rx_cmd, &shared, poll_period(poll_hz));
            done_tx.send(meter).ok();
        });
        info!("acquisition started at {poll_hz} Hz");
        Self {
            signals,
            commands,
            finished,
            worker: Some(worker),
            join_timeout,
        }
    }

    /// Queues a command and wakes the worker, which applies it at the start
    /// of its next cycle, or on the way out if it is stopping.
    pub fn send(&self, command: AcquisitionCommand) -> bool {
        if self.commands.send(command).is_err() {
            return false;
        }
        self.signals.commands.store(true, Ordering::Release);
        self.wake();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Raises the stop signal and waits a bounded time for the worker. Gives
    /// the meter back if the worker exited in time, otherwise it is abandoned
    /// along with the detached thread.
    pub fn stop(mut self) -> Option<Multimeter> {
        self.raise_stop();
        match self.finished.recv_timeout(self.join_timeout) {
            Ok(meter) => {
                if let Some(worker) = self.worker.take() {
                    if worker.join().is_err() {
                        warn!("acquisition worker panicked after handing back the meter");
                    }
                }
                info!("acquisition stopped");
                Some(meter)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "acquisition worker did not stop within {:?}; detaching it",
                    self.join_timeout
                );
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("acquisition worker exited without returning the meter");
                None
            }
        }
    }

    fn raise_stop(&self) {
        self.signals.stop.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.raise_stop();
    }
}

fn run(
    mut meter: Multimeter,
    events: &EventSender,
    rx_cmd: &Receiver<AcquisitionCommand>,
    signals: &Signals,
    mut period: Duration,
) -> Multimeter {
    let clock = Clock::start();
    let stopped = || signals.stop.load(Ordering::Acquire);
    let mut last_mode: Option<String> = None;
    let mut next_range_refresh = Instant::now();

    while !stopped() {
        let cycle_start = Instant::now();

        let pending = PendingSettings::collect(rx_cmd, signals);
        if let Some(hz) = pending.poll_hz {
            period = poll_period(hz);
            debug!("poll period now {period:?}");
        }
        if pending.write_to(&mut meter) {
            wait(signals, meter.settle_delay(), false);
        }
        if stopped() {
            break;
        }

        let mode = meter.query_mode();
        if stopped() {
            break;
        }
        let value = meter.read_value();
        let timestamp = clock.now();
        let unit = mode.as_deref().map(unit_for_mode).unwrap_or("").to_owned();

        // The change notice goes first so the consumer's clear keeps this reading.
        if let Some(current) = &mode {
            if last_mode.as_ref() != Some(current) {
                info!("instrument mode is now {current}");
                if !events.emit(Event::ModeChanged(current.clone())) {
                    break;
                }
                last_mode = Some(current.clone());
            }
        }
        let sample = Sample {
            timestamp,
            mode,
            value,
            unit,
        };
        if !events.emit(Event::Sample(sample)) {
            debug!("event consumer gone; acquisition exiting");
            break;
        }

        if cycle_start >= next_range_refresh {
            next_range_refresh += RANGE_REFRESH_INTERVAL;
            if next_range_refresh <= cycle_start {
                next_range_refresh = cycle_start + RANGE_REFRESH_INTERVAL;
            }
            if let Some(range) = meter.probe_range(|| !stopped()) {
                events.emit(Event::RangeUpdated(range));
            }
        }

        if let Some(remaining) = period.checked_sub(cycle_start.elapsed()) {
            wait(signals, remaining, true);
        }
    }

    // Selections queued since the last cycle still reach the meter, without
    // the settle wait.
    let pending = PendingSettings::collect(rx_cmd, signals);
    if pending.mode.is_some() || pending.rate.is_some() {
        debug!("writing settings queued before stop");
        pending.write_to(&mut meter);
    }
    meter
}

/// Sleeps up to `duration`. Returns early once stop is raised, and also when a
/// command is queued if `wake_on_command` is set.
fn wait(signals: &Signals, duration: Duration, wake_on_command: bool) {
    let deadline = Instant::now() + duration;
    loop {
        if signals.stop.load(Ordering::Acquire)
            || (wake_on_command && signals.commands.load(Ordering::Acquire))
        {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{
        event_pipeline, ScriptedLink, Transport, RANGE_PLACEHOLDER, SETTLE_DELAY,
    };
    use std::sync::Mutex;

    fn scripted_meter(
        responder: impl FnMut(&str) -> Option<String> + Send + 'static,
    ) -> (Multimeter, Arc<Mutex<Vec<String>>>) {
        let link = ScriptedLink::new(responder);
        let journal = link.journal();
        let transport = Transport::from_link("scripted", link, Duration::from_millis(50));
        (Multimeter::new(transport), journal)
    }

    fn volt_meter(cmd: &str) -> Option<String> {
        match cmd {
            "FUNC?" => Some("\"VOLT\"".into()),
            "MEAS?" => Some("1.25".into()),
            "RANG?" => Some("5V".into()),
            _ => None,
        }
    }

    #[test]
    fn poll_period_is_floored() {
        assert_eq!(poll_period(2.0), Duration::from_millis(500));
        assert_eq!(poll_period(0.01), Duration::from_secs(2));
        assert_eq!(poll_period(-5.0), Duration::from_secs(2));
        assert_eq!(poll_period(f64::NAN), Duration::from_secs(2));
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::start();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 1.0e9);
    }

    #[test]
    fn emits_mode_change_then_samples_and_range() {
        let (meter, _) = scripted_meter(volt_meter);
        let (tx, rx) = event_pipeline();
        let acquisition = Acquisition::start(meter, tx, 50.0);
        thread::sleep(Duration::from_millis(300));
        let meter = acquisition.stop();
        assert!(meter.is_some());

        let events = rx.drain();
        assert_eq!(events[0], Event::ModeChanged("VOLT".into()));
        let samples: Vec<&Sample> = events
            .iter()
            .filter_map(|e| match e {
                Event::Sample(s) => Some(s),
                _ => None,
            })
            .collect();
        assert!(samples.len() >= 2);
        assert!(samples.iter().all(|s| s.value == Some(1.25) && s.unit == "V"));
        assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        let mode_changes = events
            .iter()
            .filter(|e| matches!(e, Event::ModeChanged(_)))
            .count();
        assert_eq!(mode_changes, 1);
        assert!(events.contains(&Event::RangeUpdated("5V".into())));
    }

    #[test]
    fn silent_meter_still_produces_empty_samples() {
        let (meter, _) = scripted_meter(|_| None);
        let (tx, rx) = event_pipeline();
        let acquisition = Acquisition::start(meter, tx, 20.0);
        thread::sleep(Duration::from_millis(200));
        assert!(!acquisition.is_finished());
        assert!(acquisition.stop().is_some());

        let events = rx.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Sample(Sample { value: None, mode: None, .. })
        )));
        assert!(!events.iter().any(|e| matches!(e, Event::ModeChanged(_))));
        assert!(events.contains(&Event::RangeUpdated(RANGE_PLACEHOLDER.into())));
    }

    fn mode_writes(journal: &Mutex<Vec<String>>) -> Vec<String> {
        journal
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("CONF:") && !c.ends_with('?'))
            .cloned()
            .collect()
    }

    #[test]
    fn queued_commands_collapse_to_the_latest() {
        let (tx, rx) = channel();
        let signals = Signals::default();
        signals.commands.store(true, Ordering::Release);
        for cmd in [
            AcquisitionCommand::SetMode(Mode::Resistance),
            AcquisitionCommand::SetRate(Rate::Fast),
            AcquisitionCommand::SetMode(Mode::Capacitance),
            AcquisitionCommand::SetPollHz(5.0),
            AcquisitionCommand::SetMode(Mode::Frequency),
        ] {
            tx.send(cmd).unwrap();
        }
        let pending = PendingSettings::collect(&rx, &signals);
        assert_eq!(
            pending,
            PendingSettings {
                mode: Some(Mode::Frequency),
                rate: Some(Rate::Fast),
                poll_hz: Some(5.0),
            }
        );
        assert!(!signals.commands.load(Ordering::Acquire));
        assert_eq!(PendingSettings::collect(&rx, &signals), PendingSettings::default());
    }

    #[test]
    fn commands_wake_an_idle_worker() {
        let (meter, journal) = scripted_meter(volt_meter);
        let (tx, _rx) = event_pipeline();
        let acquisition = Acquisition::start(meter, tx, MIN_POLL_HZ);
        thread::sleep(Duration::from_millis(100));
        assert!(acquisition.send(AcquisitionCommand::SetMode(Mode::Capacitance)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(mode_writes(&journal), vec!["CONF:CAP"]);
        assert!(acquisition.stop().is_some());
    }

    #[test]
    fn selection_queued_just_before_stop_reaches_the_meter() {
        let (meter, journal) = scripted_meter(volt_meter);
        let (tx, _rx) = event_pipeline();
        let acquisition = Acquisition::start(meter, tx, MIN_POLL_HZ);
        thread::sleep(Duration::from_millis(100));
        acquisition.send(AcquisitionCommand::SetMode(Mode::Resistance));
        assert!(acquisition.stop().is_some());
        assert_eq!(mode_writes(&journal).last().map(String::as_str), Some("CONF:RES"));
    }

    #[test]
    fn burst_of_mode_selections_does_not_delay_stop() {
        let (meter, journal) = scripted_meter(volt_meter);
        let (tx, _rx) = event_pipeline();
        let acquisition = Acquisition::start(meter, tx, 1000.0);
        thread::sleep(Duration::from_millis(30));
        for mode in [Mode::Resistance, Mode::Capacitance, Mode::Frequency] {
            acquisition.send(AcquisitionCommand::SetMode(mode));
        }

        let started = Instant::now();
        let meter = acquisition.stop();
        assert!(meter.is_some());
        assert!(started.elapsed() <= Duration::from_millis(50) + SETTLE_DELAY + JOIN_SLACK);
        let writes = mode_writes(&journal);
        assert!(writes.len() <= 3);
        assert_eq!(writes.last().map(String::as_str), Some("CONF:FREQ"));
    }

    #[test]
    fn stop_is_bounded_by_timeout_and_settle_delay() {
        let link = ScriptedLink::new(|_| None).with_silence_delay(Duration::from_millis(40));
        let transport = Transport::from_link("hung", link, Duration::from_millis(40));
        let meter = Multimeter::new(transport);
        let (tx, _rx) = event_pipeline();
        let acquisition = Acquisition::start(meter, tx, MIN_POLL_HZ);
        acquisition.send(AcquisitionCommand::SetMode(Mode::VoltDc));
        thread::sleep(Duration::from_millis(60));

        let started = Instant::now();
        let meter = acquisition.stop();
        assert!(meter.is_some());
        assert!(started.elapsed() <= Duration::from_millis(40) + SETTLE_DELAY + JOIN_SLACK);
    }

    #[test]
    fn dropped_consumer_ends_the_worker() {
        let (meter, _) = scripted_meter(volt_meter);
        let (tx, rx) = event_pipeline();
        drop(rx);
        let acquisition = Acquisition::start(meter, tx, 50.0);
        thread::sleep(Duration::from_millis(100));
        assert!(acquisition.is_finished());
        assert!(acquisition.stop().is_some());
    }
}
