// src/types.rs
use crate::drivers::{Mode, Rate};

/// How the session reaches an instrument.
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ConnectionMode {
    Simulation,
    Hardware,
}

/// One poll cycle's reading. `value` is `None` when the meter gave no
/// parsable answer.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub mode: Option<String>,
    pub value: Option<f64>,
    pub unit: String,
}

/// What the acquisition worker hands to the consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Sample(Sample),
    ModeChanged(String),
    RangeUpdated(String),
}

/// Requests the consumer forwards to a running acquisition worker, which
/// owns the transport while it runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AcquisitionCommand {
    SetMode(Mode),
    SetRate(Rate),
    SetPollHz(f64),
}
