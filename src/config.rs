// src/config.rs
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::{Mode, Rate, ScopeError, DEFAULT_BAUD};

pub const DEFAULT_POLL_HZ: f64 = 2.0;
pub const DEFAULT_WINDOW_SECONDS: f64 = 30.0;
pub const DEFAULT_TIMEOUT_MS: u64 = 200;

/// Settings the acquisition core consumes. Every field has a default so a
/// partial JSON file is enough.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub poll_hz: f64,
    pub window_seconds: f64,
    pub value_ceiling: Option<f64>,
    pub mode: Option<String>,
    pub rate: Option<String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_hz: DEFAULT_POLL_HZ,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            value_ceiling: None,
            mode: None,
            rate: None,
        }
    }
}

impl ScopeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScopeError> {
        let text = fs::read_to_string(path)?;
        let config: ScopeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        if !(self.window_seconds.is_finite() && self.window_seconds > 0.0) {
            return Err(ScopeError::OutOfRange {
                field: "window_seconds",
                value: self.window_seconds,
            });
        }
        if self.baud_rate == 0 {
            return Err(ScopeError::OutOfRange {
                field: "baud_rate",
                value: 0.0,
            });
        }
        if self.timeout_ms == 0 {
            return Err(ScopeError::OutOfRange {
                field: "timeout_ms",
                value: 0.0,
            });
        }
        self.selected_mode()?;
        self.selected_rate()?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Ceiling actually applied to the plot; zero or negative means none.
    pub fn effective_ceiling(&self) -> Option<f64> {
        effective_ceiling(self.value_ceiling)
    }

    pub fn selected_mode(&self) -> Result<Option<Mode>, ScopeError> {
        self.mode.as_deref().map(str::parse::<Mode>).transpose()
    }

    pub fn selected_rate(&self) -> Result<Option<Rate>, ScopeError> {
        self.rate.as_deref().map(str::parse::<Rate>).transpose()
    }
}

pub fn effective_ceiling(ceiling: Option<f64>) -> Option<f64> {
    ceiling.filter(|c| c.is_finite() && *c > 0.0)
}

/// Parses a number typed by the user; a comma is accepted as decimal separator.
pub fn parse_user_number(field: &'static str, input: &str) -> Result<f64, ScopeError> {
    input
        .trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ScopeError::InvalidNumber {
            field,
            input: input.to_owned(),
        })
}
