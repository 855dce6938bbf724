use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::drivers::error::{ScopeError, TransportError};

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
const COMMAND_TERMINATOR: &str = "\r";
const MAX_LINE_BYTES: usize = 256;

/// Byte stream to an instrument. Implemented by real serial ports and by
/// in-memory links used for simulation and tests.
pub trait Link: Read + Write + Send {
    /// Drops anything buffered in either direction.
    fn discard_buffers(&mut self) -> Result<(), TransportError>;

    /// Upper bound for the next blocking read.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;
}

impl Link for Box<dyn SerialPort> {
    fn discard_buffers(&mut self) -> Result<(), TransportError> {
        self.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        SerialPort::set_timeout(self.as_mut(), timeout)?;
        Ok(())
    }
}

/// Names of the serial ports currently present on the host.
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(err) => {
            debug!("serial port enumeration failed: {err}");
            Vec::new()
        }
    }
}

/// Line-oriented request/response channel to one instrument.
pub struct Transport {
    label: String,
    link: Option<Box<dyn Link>>,
    timeout: Duration,
}

impl Transport {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, ScopeError> {
        Self::open_with_timeout(port, baud_rate, DEFAULT_TIMEOUT)
    }

    /// Opens `port` as 8N1 with `timeout` applied to both reads and writes.
    pub fn open_with_timeout(
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self, ScopeError> {
        let serial = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()
            .map_err(|source| ScopeError::Connection {
                port: port.to_owned(),
                source,
            })?;
        debug!("opened {port} @ {baud_rate} bps");
        Ok(Self::from_link(format!("{port} @ {baud_rate} bps"), serial, timeout))
    }

    pub fn from_link(label: impl Into<String>, link: impl Link + 'static, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            link: Some(Box::new(link)),
            timeout,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!("closed {}", self.label);
        }
    }

    pub fn try_write(&mut self, command: &str) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        link.write_all(format!("{command}{COMMAND_TERMINATOR}").as_bytes())?;
        link.flush()?;
        Ok(())
    }

    /// Clears stale input/output, sends `command` and reads one line back.
    pub fn try_query(&mut self, command: &str) -> Result<String, TransportError> {
        let timeout = self.timeout;
        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        link.discard_buffers()?;
        link.write_all(format!("{command}{COMMAND_TERMINATOR}").as_bytes())?;
        link.flush()?;
        let line = read_line(&mut **link, timeout);
        link.set_read_timeout(timeout)?;
        line
    }

    /// Fire-and-forget write. Returns whether the bytes went out.
    pub fn write(&mut self, command: &str) -> bool {
        match self.try_write(command) {
            Ok(()) => {
                debug!("[{}] -> {command}", self.label);
                true
            }
            Err(err) => {
                debug!("[{}] write {command:?} dropped: {err}", self.label);
                false
            }
        }
    }

    /// `None` when the exchange failed or the instrument answered with an empty line.
    pub fn query(&mut self, command: &str) -> Option<String> {
        match self.try_query(command) {
            Ok(line) if line.is_empty() => {
                debug!("[{}] {command} -> (empty)", self.label);
                None
            }
            Ok(line) => {
                debug!("[{}] {command} -> {line}", self.label);
                Some(line)
            }
            Err(err) => {
                debug!("[{}] {command} failed: {err}", self.label);
                None
            }
        }
    }
}

fn read_line(link: &mut dyn Link, timeout: Duration) -> Result<String, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            if line.is_empty() {
                return Err(TransportError::Timeout);
            }
            break;
        }
        link.set_read_timeout(remaining)?;
        match link.read(&mut byte) {
            Ok(0) => {}
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => {
                line.push(byte[0]);
                if line.len() >= MAX_LINE_BYTES {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                if line.is_empty() {
                    return Err(TransportError::Timeout);
                }
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(String::from_utf8_lossy(&line).trim().to_owned())
}

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// In-memory link that answers each terminated command through a responder
/// closure. Every command received is appended to a shared journal.
pub struct ScriptedLink {
    responder: Responder,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    journal: Arc<Mutex<Vec<String>>>,
    silence_delay: Duration,
    read_timeout: Option<Duration>,
}

impl ScriptedLink {
    pub fn new(responder: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            journal: Arc::new(Mutex::new(Vec::new())),
            silence_delay: Duration::ZERO,
            read_timeout: None,
        }
    }

    /// How long a read blocks before reporting a timeout when nothing is pending,
    /// mimicking a serial port's read timeout. Capped by the link's read timeout.
    pub fn with_silence_delay(mut self, delay: Duration) -> Self {
        self.silence_delay = delay;
        self
    }

    pub fn journal(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.journal)
    }

    fn dispatch(&mut self, command: String) {
        if let Some(reply) = (self.responder)(&command) {
            self.outbound.extend(reply.bytes());
            self.outbound.extend(b"\r\n");
        }
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(command);
        }
    }
}

impl Read for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbound.is_empty() {
            let delay = match self.read_timeout {
                Some(limit) => self.silence_delay.min(limit),
                None => self.silence_delay,
            };
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no pending reply"));
        }
        let mut count = 0;
        while count < buf.len() {
            match self.outbound.pop_front() {
                Some(b) => {
                    buf[count] = b;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Write for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if b == b'\r' || b == b'\n' {
                if !self.inbound.is_empty() {
                    let command = String::from_utf8_lossy(&self.inbound).into_owned();
                    self.inbound.clear();
                    self.dispatch(command);
                }
            } else {
                self.inbound.push(b);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for ScriptedLink {
    fn discard_buffers(&mut self) -> Result<(), TransportError> {
        self.inbound.clear();
        self.outbound.clear();
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.read_timeout = Some(timeout);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenLink;

    impl Read for BrokenLink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }
    }

    impl Write for BrokenLink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link for BrokenLink {
        fn discard_buffers(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn set_read_timeout(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Releases each byte at a fixed offset from creation. A read blocks until
    /// the next byte is due or the read timeout runs out, like a serial port.
    struct TimedLink {
        created: Instant,
        bytes: VecDeque<(Duration, u8)>,
        read_timeout: Duration,
    }

    impl Read for TimedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let due = self.bytes.front().map(|(due, _)| *due);
            let now = self.created.elapsed();
            match due {
                Some(due) if due.saturating_sub(now) <= self.read_timeout => {
                    thread::sleep(due.saturating_sub(now));
                    let (_, b) = self.bytes.pop_front().unwrap();
                    buf[0] = b;
                    Ok(1)
                }
                _ => {
                    thread::sleep(self.read_timeout);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "nothing yet"))
                }
            }
        }
    }

    impl Write for TimedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link for TimedLink {
        fn discard_buffers(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
            self.read_timeout = timeout;
            Ok(())
        }
    }

    fn echo_transport() -> Transport {
        let link = ScriptedLink::new(|cmd| match cmd {
            "*IDN?" => Some("OWON,XDM1041,2218,V3.9.0".into()),
            "BLANK?" => Some(String::new()),
            _ => None,
        });
        Transport::from_link("scripted", link, DEFAULT_TIMEOUT)
    }

    #[test]
    fn query_appends_terminator_and_strips_line_ending() {
        let link = ScriptedLink::new(|cmd| Some(format!("got {cmd}")));
        let journal = link.journal();
        let mut transport = Transport::from_link("scripted", link, DEFAULT_TIMEOUT);
        assert_eq!(transport.query("FUNC?").as_deref(), Some("got FUNC?"));
        assert_eq!(*journal.lock().unwrap(), vec!["FUNC?".to_string()]);
    }

    #[test]
    fn silent_or_empty_reply_is_no_data() {
        let mut transport = echo_transport();
        assert!(transport.query("MEAS?").is_none());
        assert!(transport.query("BLANK?").is_none());
        assert!(matches!(
            transport.try_query("MEAS?"),
            Err(TransportError::Timeout)
        ));
        assert!(transport.query("*IDN?").unwrap().contains("XDM"));
    }

    #[test]
    fn io_faults_are_contained() {
        let mut transport = Transport::from_link("broken", BrokenLink, DEFAULT_TIMEOUT);
        assert!(!transport.write("CONF:RES"));
        assert!(transport.query("MEAS?").is_none());
        assert!(matches!(transport.try_query("MEAS?"), Err(TransportError::Io(_))));
    }

    #[test]
    fn closed_transport_reports_not_open() {
        let mut transport = echo_transport();
        transport.close();
        assert!(!transport.is_open());
        assert!(matches!(transport.try_write("RATE F"), Err(TransportError::NotOpen)));
        assert!(transport.query("*IDN?").is_none());
    }

    #[test]
    fn stale_reply_is_discarded_before_next_query() {
        let link = ScriptedLink::new(|cmd| Some(cmd.to_lowercase()));
        let mut transport = Transport::from_link("scripted", link, DEFAULT_TIMEOUT);
        assert!(transport.write("CONF:VOLT:DC"));
        assert_eq!(transport.query("FUNC?").as_deref(), Some("func?"));
    }

    #[test]
    fn late_byte_does_not_extend_the_deadline() {
        let timeout = Duration::from_millis(100);
        let link = TimedLink {
            created: Instant::now(),
            bytes: VecDeque::from([
                (Duration::from_millis(90), b'1'),
                (Duration::from_secs(10), b'\n'),
            ]),
            read_timeout: timeout,
        };
        let mut transport = Transport::from_link("trickle", link, timeout);
        let started = Instant::now();
        assert_eq!(transport.query("MEAS?").as_deref(), Some("1"));
        assert!(started.elapsed() < Duration::from_millis(160));
    }

    #[test]
    fn opening_a_missing_port_is_a_connection_error() {
        let err = Transport::open("/dev/does-not-exist-xdm", DEFAULT_BAUD)
            .err()
            .unwrap();
        assert!(matches!(err, ScopeError::Connection { .. }));
    }
}
