// src/drivers/mod.rs
pub mod buffer;
pub mod error;
pub mod format;
pub mod instrument;
pub mod pipeline;
pub mod stats;
pub mod transport;

pub use buffer::{Point, TimeSeries, VisibleWindow};
pub use error::{ScopeError, TransportError};
pub use format::format_value;
pub use instrument::{
    allows_negative, looks_like_xdm, parse_reading, unit_for_mode, Identity, Mode, Multimeter,
    Rate, RANGE_PLACEHOLDER, SETTLE_DELAY,
};
pub use pipeline::{event_pipeline, EventReceiver, EventSender};
pub use stats::IntervalStats;
pub use transport::{list_ports, Link, ScriptedLink, Transport, DEFAULT_BAUD, DEFAULT_TIMEOUT};
