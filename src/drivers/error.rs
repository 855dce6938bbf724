use thiserror::Error;

/// Fault of a single protocol exchange. Never leaves the acquisition path as an
/// error; `Transport::query`/`Transport::write` turn it into "no data".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial link is not open")]
    NotOpen,
    #[error("no response before the read timeout")]
    Timeout,
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("cannot open {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("no serial port detected")]
    NoPortsFound,
    #[error("no OWON/XDM instrument answered *IDN?")]
    NoInstrumentFound,
    #[error("not connected to an instrument")]
    NotConnected,
    #[error("acquisition is already running")]
    AlreadyRunning,
    #[error("invalid number for {field}: {input:?}")]
    InvalidNumber { field: &'static str, input: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("unknown mode label {0:?}")]
    UnknownMode(String),
    #[error("unknown rate code {0:?}")]
    UnknownRate(String),
    #[error("failed to read config file: {0}")]
    ConfigRead(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
