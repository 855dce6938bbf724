// src/session.rs
use std::time::Duration;

use log::{info, warn};

use crate::config::{effective_ceiling, parse_user_number, ScopeConfig, DEFAULT_POLL_HZ};
use crate::drivers::{
    allows_negative, event_pipeline, format_value, list_ports, unit_for_mode, EventReceiver,
    EventSender, Identity, IntervalStats, Mode, Multimeter, Rate, ScopeError, TimeSeries,
    Transport, VisibleWindow, RANGE_PLACEHOLDER,
};
use crate::engine::{wall_clock_seconds, Acquisition};
use crate::simulator::SimulatedMeter;
use crate::types::{AcquisitionCommand, ConnectionMode, Event};

/// How often the consumer should call [`Session::tick`].
pub const CONSUMER_TICK: Duration = Duration::from_millis(50);

enum Device {
    Disconnected,
    Idle(Multimeter),
    Acquiring(Acquisition),
}

/// What one [`Session::tick`] applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub events: usize,
    pub samples: usize,
}

/// Consumer-side state: owns the instrument while idle, the acquisition
/// handle while running, and the series with its markers.
pub struct Session {
    device: Device,
    connection: Option<ConnectionMode>,
    identity: Option<Identity>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    series: TimeSeries,
    current_mode: Option<String>,
    selected_mode: Option<Mode>,
    selected_rate: Option<Rate>,
    range_text: String,
    latest_value: Option<f64>,
    poll_hz: f64,
    window_seconds: f64,
    value_ceiling: Option<f64>,
    timeout: Duration,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(&ScopeConfig::default())
    }
}

impl Session {
    pub fn new(config: &ScopeConfig) -> Self {
        let (events_tx, events_rx) = event_pipeline();
        Self {
            device: Device::Disconnected,
            connection: None,
            identity: None,
            events_tx,
            events_rx,
            series: TimeSeries::new(),
            current_mode: None,
            selected_mode: None,
            selected_rate: None,
            range_text: RANGE_PLACEHOLDER.to_owned(),
            latest_value: None,
            poll_hz: config.poll_hz,
            window_seconds: config.window_seconds,
            value_ceiling: config.effective_ceiling(),
            timeout: config.timeout(),
        }
    }

    // ---- connection ----

    /// Opens `port` and checks the peer's identity. An unexpected identity is
    /// returned, not rejected. Connecting twice returns the current identity.
    pub fn connect(&mut self, port: &str, baud_rate: u32) -> Result<Identity, ScopeError> {
        if let Some(identity) = self.connected_identity() {
            info!("already connected");
            return Ok(identity);
        }
        let transport = Transport::open_with_timeout(port, baud_rate, self.timeout)?;
        Ok(self.attach(Multimeter::new(transport), ConnectionMode::Hardware))
    }

    pub fn connect_simulated(&mut self) -> Identity {
        if let Some(identity) = self.connected_identity() {
            return identity;
        }
        let meter = Multimeter::new(SimulatedMeter::new().into_transport());
        self.attach(meter, ConnectionMode::Simulation)
    }

    /// Adopts an already opened transport.
    pub fn connect_transport(&mut self, transport: Transport) -> Identity {
        if let Some(identity) = self.connected_identity() {
            return identity;
        }
        self.attach(Multimeter::new(transport), ConnectionMode::Hardware)
    }

    /// Tries every serial port and keeps the first that identifies as an
    /// XDM meter.
    pub fn auto_connect(&mut self, baud_rate: u32) -> Result<Identity, ScopeError> {
        if let Some(identity) = self.connected_identity() {
            return Ok(identity);
        }
        let ports = list_ports();
        if ports.is_empty() {
            return Err(ScopeError::NoPortsFound);
        }
        for port in ports {
            let transport = match Transport::open_with_timeout(&port, baud_rate, self.timeout) {
                Ok(transport) => transport,
                Err(err) => {
                    info!("skipping {port}: {err}");
                    continue;
                }
            };
            let mut meter = Multimeter::new(transport);
            let identity = meter.identify();
            if identity.is_recognized() {
                info!("multimeter detected on {port}");
                self.device = Device::Idle(meter);
                self.connection = Some(ConnectionMode::Hardware);
                self.identity = Some(identity.clone());
                return Ok(identity);
            }
            meter.close();
        }
        Err(ScopeError::NoInstrumentFound)
    }

    fn attach(&mut self, mut meter: Multimeter, mode: ConnectionMode) -> Identity {
        let identity = meter.identify();
        info!("connected to {} ({mode:?})", meter.transport().label());
        self.device = Device::Idle(meter);
        self.connection = Some(mode);
        self.identity = Some(identity.clone());
        identity
    }

    fn connected_identity(&self) -> Option<Identity> {
        if self.is_connected() {
            self.identity.clone()
        } else {
            None
        }
    }

    /// Stops acquisition first, then closes the transport.
    pub fn disconnect(&mut self) {
        self.stop();
        if let Device::Idle(mut meter) = std::mem::replace(&mut self.device, Device::Disconnected) {
            meter.close();
            info!("disconnected");
        }
        self.connection = None;
        self.identity = None;
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.device, Device::Disconnected)
    }

    pub fn connection_mode(&self) -> Option<ConnectionMode> {
        self.connection
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    // ---- acquisition ----

    pub fn is_acquiring(&self) -> bool {
        matches!(self.device, Device::Acquiring(_))
    }

    /// Starts a fresh run: pending events are applied, then the series is
    /// cleared before the worker takes the meter.
    pub fn start(&mut self) -> Result<(), ScopeError> {
        match std::mem::replace(&mut self.device, Device::Disconnected) {
            Device::Idle(meter) => {
                self.tick();
                self.clear();
                let acquisition = Acquisition::start(meter, self.events_tx.clone(), self.poll_hz);
                self.device = Device::Acquiring(acquisition);
                Ok(())
            }
            Device::Acquiring(acquisition) => {
                self.device = Device::Acquiring(acquisition);
                Err(ScopeError::AlreadyRunning)
            }
            Device::Disconnected => Err(ScopeError::NotConnected),
        }
    }

    /// Stops and joins the worker. If it does not stop in time the meter is
    /// lost and the session ends up disconnected.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.device, Device::Disconnected) {
            Device::Acquiring(acquisition) => match acquisition.stop() {
                Some(meter) => self.device = Device::Idle(meter),
                None => {
                    warn!("instrument handle lost while stopping; session disconnected");
                    self.connection = None;
                    self.identity = None;
                }
            },
            other => self.device = other,
        }
    }

    /// Start when idle, stop when running.
    pub fn toggle(&mut self) -> Result<bool, ScopeError> {
        if self.is_acquiring() {
            self.stop();
            Ok(false)
        } else {
            self.start()?;
            Ok(true)
        }
    }

    // ---- instrument settings ----

    /// Switches the meter's function and starts a new series. Readings
    /// already queued are applied first so none of them lands in the new one.
    pub fn select_mode(&mut self, mode: Mode) -> Result<(), ScopeError> {
        if !self.is_connected() {
            return Err(ScopeError::NotConnected);
        }
        self.tick();
        match &mut self.device {
            Device::Disconnected => return Err(ScopeError::NotConnected),
            Device::Idle(meter) => {
                meter.set_mode(mode);
            }
            Device::Acquiring(acquisition) => {
                acquisition.send(AcquisitionCommand::SetMode(mode));
            }
        }
        self.clear();
        self.selected_mode = Some(mode);
        self.current_mode = Some(mode.label().to_owned());
        Ok(())
    }

    pub fn select_rate(&mut self, rate: Rate) -> Result<(), ScopeError> {
        match &mut self.device {
            Device::Disconnected => return Err(ScopeError::NotConnected),
            Device::Idle(meter) => {
                meter.set_rate(rate);
            }
            Device::Acquiring(acquisition) => {
                acquisition.send(AcquisitionCommand::SetRate(rate));
            }
        }
        self.selected_rate = Some(rate);
        Ok(())
    }

    pub fn selected_mode(&self) -> Option<Mode> {
        self.selected_mode
    }

    pub fn selected_rate(&self) -> Option<Rate> {
        self.selected_rate
    }

    pub fn poll_hz(&self) -> f64 {
        self.poll_hz
    }

    /// Takes effect on the running worker's next cycle.
    pub fn set_poll_hz(&mut self, hz: f64) {
        self.poll_hz = hz;
        if let Device::Acquiring(acquisition) = &self.device {
            acquisition.send(AcquisitionCommand::SetPollHz(hz));
        }
    }

    /// Unparsable input falls back to the default rate.
    pub fn set_poll_hz_text(&mut self, text: &str) {
        let hz = parse_user_number("poll_hz", text).unwrap_or(DEFAULT_POLL_HZ);
        self.set_poll_hz(hz);
    }

    // ---- display parameters ----

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    pub fn set_window_seconds(&mut self, seconds: f64) -> Result<(), ScopeError> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(ScopeError::OutOfRange {
                field: "window_seconds",
                value: seconds,
            });
        }
        self.window_seconds = seconds;
        Ok(())
    }

    pub fn set_window_text(&mut self, text: &str) -> Result<(), ScopeError> {
        let seconds = parse_user_number("window_seconds", text)?;
        self.set_window_seconds(seconds)
    }

    pub fn value_ceiling(&self) -> Option<f64> {
        self.value_ceiling
    }

    pub fn set_value_ceiling(&mut self, ceiling: Option<f64>) {
        self.value_ceiling = effective_ceiling(ceiling);
    }

    /// Blank or unparsable text removes the ceiling.
    pub fn set_ceiling_text(&mut self, text: &str) {
        let ceiling = if text.trim().is_empty() {
            None
        } else {
            parse_user_number("value_ceiling", text).ok()
        };
        self.set_value_ceiling(ceiling);
    }

    // ---- event consumption ----

    /// Applies every event queued since the last tick, in arrival order.
    /// Never waits for more.
    pub fn tick(&mut self) -> TickSummary {
        let mut pending = Vec::new();
        self.events_rx.drain_with(|event| pending.push(event));
        let mut summary = TickSummary::default();
        for event in pending {
            if matches!(event, Event::Sample(_)) {
                summary.samples += 1;
            }
            summary.events += 1;
            self.apply_event(event);
        }
        summary
    }

    pub fn apply_event(&mut self, event: Event) {
        match event {
            Event::Sample(sample) => {
                self.series.apply_sample(&sample);
                self.latest_value = self.series.latest().and_then(|p| p.value);
                self.current_mode = sample.mode;
            }
            Event::ModeChanged(mode) => {
                info!("mode change to {mode}; clearing series");
                self.clear();
                self.current_mode = Some(mode);
            }
            Event::RangeUpdated(range) => {
                self.range_text = if range.is_empty() {
                    RANGE_PLACEHOLDER.to_owned()
                } else {
                    range
                };
            }
        }
    }

    // ---- series, markers, statistics ----

    pub fn clear(&mut self) {
        self.series.clear(wall_clock_seconds());
    }

    pub fn series(&self) -> &TimeSeries {
        &self.series
    }

    pub fn set_marker_a(&mut self, t: f64) {
        self.series.set_marker_a(t);
    }

    pub fn set_marker_b(&mut self, t: f64) {
        self.series.set_marker_b(t);
    }

    pub fn clear_markers(&mut self) {
        self.series.clear_markers();
    }

    pub fn marker_span(&self) -> Option<f64> {
        self.series.marker_span()
    }

    pub fn allow_negative(&self) -> bool {
        allows_negative(self.current_mode.as_deref())
    }

    pub fn visible_window(&self) -> VisibleWindow {
        self.series
            .visible_window(self.window_seconds, self.value_ceiling, self.allow_negative())
    }

    pub fn interval_stats(&self) -> IntervalStats {
        self.series.interval_stats(&self.visible_window())
    }

    pub fn stats_summary(&self) -> String {
        self.interval_stats().summary(self.unit())
    }

    // ---- readout ----

    pub fn current_mode(&self) -> Option<&str> {
        self.current_mode.as_deref()
    }

    pub fn unit(&self) -> &'static str {
        self.current_mode.as_deref().map(unit_for_mode).unwrap_or("")
    }

    pub fn range_text(&self) -> &str {
        &self.range_text
    }

    pub fn latest_value(&self) -> Option<f64> {
        self.latest_value
    }

    pub fn value_text(&self) -> String {
        format_value(self.latest_value, self.unit())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
