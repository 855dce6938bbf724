use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::drivers::error::ScopeError;
use crate::drivers::transport::Transport;

/// Pause after a function change before the meter's readings can be trusted.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);
/// Range text used when no range query got an answer.
pub const RANGE_PLACEHOLDER: &str = "Auto / —";

const IDENTITY_TOKENS: [&str; 2] = ["OWON", "XDM"];

/// Range reporting differs between functions and firmware revisions, so these
/// are tried in order until one answers.
const RANGE_QUERIES: [&str; 9] = [
    "CONF?",
    "CONF:VOLT?",
    "CONF:CURR?",
    "CONF:RES?",
    "CONF:CAP?",
    "CONF:FREQ?",
    "RANG?",
    "RANGE?",
    "AUTO?",
];

/// Reported function names and their units. Order matters for the
/// substring fallback in [`unit_for_mode`].
const MODE_UNITS: [(&str, &str); 14] = [
    ("VOLT", "V"),
    ("VOLT AC", "V"),
    ("CURR", "A"),
    ("CURR AC", "A"),
    ("CURR DC", "A"),
    ("RES", "Ω"),
    ("FRES", "Ω"),
    ("CONT", "Ω"),
    ("DIODE", "V"),
    ("DIOD", "V"),
    ("CAP", "F"),
    ("FREQ", "Hz"),
    ("PER", "s"),
    ("TEMP", "°C"),
];

/// Measurement functions that can be selected on the meter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    VoltDc,
    VoltAc,
    CurrDc,
    CurrAc,
    Resistance,
    Continuity,
    Capacitance,
    Diode,
    Frequency,
    Temperature,
}

impl Mode {
    pub const ALL: [Mode; 10] = [
        Mode::VoltDc,
        Mode::VoltAc,
        Mode::CurrDc,
        Mode::CurrAc,
        Mode::Resistance,
        Mode::Continuity,
        Mode::Capacitance,
        Mode::Diode,
        Mode::Frequency,
        Mode::Temperature,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Mode::VoltDc => "VOLT DC",
            Mode::VoltAc => "VOLT AC",
            Mode::CurrDc => "CURR DC",
            Mode::CurrAc => "CURR AC",
            Mode::Resistance => "RES",
            Mode::Continuity => "CONT",
            Mode::Capacitance => "CAP",
            Mode::Diode => "DIOD",
            Mode::Frequency => "FREQ",
            Mode::Temperature => "TEMP",
        }
    }

    pub fn configure_command(self) -> &'static str {
        match self {
            Mode::VoltDc => "CONF:VOLT:DC",
            Mode::VoltAc => "CONF:VOLT:AC",
            Mode::CurrDc => "CONF:CURR:DC",
            Mode::CurrAc => "CONF:CURR:AC",
            Mode::Resistance => "CONF:RES",
            Mode::Continuity => "CONF:CONT",
            Mode::Capacitance => "CONF:CAP",
            Mode::Diode => "CONF:DIOD",
            Mode::Frequency => "CONF:FREQ",
            Mode::Temperature => "CONF:TEMP",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Mode::VoltDc | Mode::VoltAc | Mode::Diode => "V",
            Mode::CurrDc | Mode::CurrAc => "A",
            Mode::Resistance | Mode::Continuity => "Ω",
            Mode::Capacitance => "F",
            Mode::Frequency => "Hz",
            Mode::Temperature => "°C",
        }
    }

    /// Only the voltage and current families may go below zero.
    pub fn allows_negative(self) -> bool {
        matches!(
            self,
            Mode::VoltDc | Mode::VoltAc | Mode::CurrDc | Mode::CurrAc
        )
    }

    pub fn from_label(label: &str) -> Option<Mode> {
        let wanted = label.trim();
        Mode::ALL
            .into_iter()
            .find(|mode| mode.label().eq_ignore_ascii_case(wanted))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Mode {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::from_label(s).ok_or_else(|| ScopeError::UnknownMode(s.to_owned()))
    }
}

/// Reading rate of the meter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rate {
    Slow,
    Medium,
    Fast,
}

impl Rate {
    pub fn code(self) -> &'static str {
        match self {
            Rate::Slow => "S",
            Rate::Medium => "M",
            Rate::Fast => "F",
        }
    }

    pub fn command(self) -> String {
        format!("RATE {}", self.code())
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Rate {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "S" | "SLOW" => Ok(Rate::Slow),
            "M" | "MEDIUM" => Ok(Rate::Medium),
            "F" | "FAST" => Ok(Rate::Fast),
            _ => Err(ScopeError::UnknownRate(s.to_owned())),
        }
    }
}

/// Unit for a function name as reported by `FUNC?`. Exact table hit first,
/// then the first table key contained in the upper-cased name ("VOLT DC" -> V).
pub fn unit_for_mode(reported: &str) -> &'static str {
    if reported.is_empty() {
        return "";
    }
    if let Some((_, unit)) = MODE_UNITS.iter().find(|(key, _)| *key == reported) {
        return *unit;
    }
    let upper = reported.to_uppercase();
    MODE_UNITS
        .iter()
        .find(|(key, _)| upper.contains(*key))
        .map(|(_, unit)| *unit)
        .unwrap_or("")
}

/// Sign policy for a reported function name. Unknown functions are not clamped.
pub fn allows_negative(reported: Option<&str>) -> bool {
    match reported {
        None => true,
        Some(mode) => {
            let upper = mode.to_uppercase();
            upper.contains("VOLT") || upper.contains("CURR")
        }
    }
}

/// Parses a `MEAS?` reply. Garbage and non-finite values count as no reading.
pub fn parse_reading(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn looks_like_xdm(idn: &str) -> bool {
    let upper = idn.to_uppercase();
    IDENTITY_TOKENS.iter().any(|token| upper.contains(*token))
}

/// Result of `*IDN?`. An unexpected peer is only advisory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Recognized(String),
    Unexpected(String),
}

impl Identity {
    pub fn classify(idn: Option<String>) -> Self {
        match idn {
            Some(text) if looks_like_xdm(&text) => Identity::Recognized(text),
            Some(text) => Identity::Unexpected(text),
            None => Identity::Unexpected(String::new()),
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, Identity::Recognized(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Identity::Recognized(text) | Identity::Unexpected(text) => text,
        }
    }
}

/// SCPI driver for OWON XDM bench multimeters.
pub struct Multimeter {
    transport: Transport,
    settle_delay: Duration,
}

impl Multimeter {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn into_transport(self) -> Transport {
        self.transport
    }

    pub fn identify(&mut self) -> Identity {
        let identity = Identity::classify(self.transport.query("*IDN?"));
        match &identity {
            Identity::Recognized(idn) => info!("instrument identified: {idn}"),
            Identity::Unexpected(idn) => {
                warn!("unexpected identity on {}: {idn:?}", self.transport.label())
            }
        }
        identity
    }

    pub fn query_mode(&mut self) -> Option<String> {
        self.transport
            .query("FUNC?")
            .map(|raw| raw.trim_matches('"').to_owned())
            .filter(|mode| !mode.is_empty())
    }

    pub fn query_value(&mut self) -> Option<String> {
        self.transport.query("MEAS?")
    }

    pub fn read_value(&mut self) -> Option<f64> {
        self.query_value().as_deref().and_then(parse_reading)
    }

    pub fn query_range(&mut self) -> String {
        self.probe_range(|| true)
            .unwrap_or_else(|| RANGE_PLACEHOLDER.to_owned())
    }

    /// Walks the candidate range queries while `proceed` holds. Returns `None`
    /// only when abandoned; exhausting the list yields the placeholder.
    pub fn probe_range(&mut self, mut proceed: impl FnMut() -> bool) -> Option<String> {
        for command in RANGE_QUERIES {
            if !proceed() {
                return None;
            }
            if let Some(range) = self.transport.query(command) {
                return Some(range);
            }
        }
        debug!("no range query answered on {}", self.transport.label());
        Some(RANGE_PLACEHOLDER.to_owned())
    }

    /// Switches function and waits for the meter to settle. Returns whether
    /// the command was delivered.
    pub fn set_mode(&mut self, mode: Mode) -> bool {
        let sent = self.configure_mode(mode);
        thread::sleep(self.settle_delay);
        sent
    }

    /// Writes the function change only. The caller owns the settle wait.
    pub fn configure_mode(&mut self, mode: Mode) -> bool {
        let sent = self.transport.write(mode.configure_command());
        info!("mode set to {mode} (delivered: {sent})");
        sent
    }

    pub fn set_rate(&mut self, rate: Rate) -> bool {
        let sent = self.transport.write(&rate.command());
        info!("rate set to {rate} (delivered: {sent})");
        sent
    }

    pub fn close(&mut self) {
        self.transport.close();
    }
}
