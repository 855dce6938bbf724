// src/lib.rs
//! Acquisition core for OWON XDM bench multimeters: serial transport, SCPI
//! driver, background polling, and the time-windowed series with markers.
pub mod config;
pub mod drivers;
pub mod engine;
pub mod session;
pub mod simulator;
pub mod types;

pub use config::ScopeConfig;
pub use drivers::{format_value, Identity, Mode, Rate, ScopeError};
pub use engine::Acquisition;
pub use session::{Session, TickSummary, CONSUMER_TICK};
pub use types::{AcquisitionCommand, ConnectionMode, Event, Sample};
