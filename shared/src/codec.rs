//! Line codec for the control socket
//!
//! Every message is a single UTF-8 line:
//! ```text
//! CONNECT AA:BB:CC:DD:EE:FF\n
//! WRITE AA:BB:CC:DD:EE:FF 68656c6c6f0a\n
//! EVENT CONNECTION_ESTABLISHED AA:BB:CC:DD:EE:FF\n
//! ```
//!
//! Requests flow from clients to the daemon; responses (replies, listings and
//! asynchronously pushed events) flow back.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    BondState, Command, DeviceId, DeviceRecord, LinkState, Notification, Request, ServiceEvent,
};

/// Maximum line length (8 KiB) to prevent memory exhaustion
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Line too long: {0} bytes (max: {MAX_LINE_LEN})")]
    LineTooLong(usize),

    #[error("Line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Empty line")]
    Empty,

    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid hex payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// A line sent from the daemon to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The request was accepted
    Ok,
    /// The request was rejected
    Err(String),
    /// One entry of a device listing
    Device(DeviceRecord),
    /// Link state of one device
    State {
        device: DeviceId,
        state: LinkState,
        connected: bool,
    },
    /// An asynchronously pushed service event
    Event(ServiceEvent),
}

impl Response {
    /// Whether this line terminates the reply to a request
    pub fn is_terminal(&self) -> bool {
        matches!(self, Response::Ok | Response::Err(_))
    }
}

/// Split off the first whitespace-separated word
fn split_word(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], line[idx..].trim_start()),
        None => (line, ""),
    }
}

fn require<'a>(word: &'a str, name: &'static str) -> Result<&'a str, CodecError> {
    if word.is_empty() {
        Err(CodecError::MissingArgument(name))
    } else {
        Ok(word)
    }
}

/// Keep free text on a single line
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

fn optional_text(rest: &str) -> Option<String> {
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Encode a request as a line (without the terminator)
pub fn encode_request(request: &Request) -> String {
    match request {
        Request::Command(command) => match command {
            Command::Discover => "DISCOVER".to_string(),
            Command::Pair(id) => format!("PAIR {id}"),
            Command::Unpair(id) => format!("UNPAIR {id}"),
            Command::Connect(id) => format!("CONNECT {id}"),
            Command::Disconnect(id) => format!("DISCONNECT {id}"),
            Command::Write(id, data) => format!("WRITE {id} {}", hex::encode(data)),
            Command::Monitor(id) => format!("MONITOR {id}"),
            Command::StopMonitor(id) => format!("UNMONITOR {id}"),
            Command::Teardown => "TEARDOWN".to_string(),
        },
        Request::Paired => "PAIRED".to_string(),
        Request::Devices => "DEVICES".to_string(),
        Request::Status(id) => format!("STATUS {id}"),
    }
}

/// Parse a request line
pub fn parse_request(line: &str) -> Result<Request, CodecError> {
    let (verb, rest) = split_word(line);
    if verb.is_empty() {
        return Err(CodecError::Empty);
    }

    let device = |rest: &str| -> Result<DeviceId, CodecError> {
        let (id, _) = split_word(rest);
        Ok(DeviceId::from(require(id, "device")?))
    };

    let request: Request = match verb.to_ascii_uppercase().as_str() {
        "DISCOVER" => Command::Discover.into(),
        "PAIR" => Command::Pair(device(rest)?).into(),
        "UNPAIR" => Command::Unpair(device(rest)?).into(),
        "CONNECT" => Command::Connect(device(rest)?).into(),
        "DISCONNECT" => Command::Disconnect(device(rest)?).into(),
        "MONITOR" => Command::Monitor(device(rest)?).into(),
        "UNMONITOR" => Command::StopMonitor(device(rest)?).into(),
        "TEARDOWN" => Command::Teardown.into(),
        "WRITE" => {
            let (id, payload) = split_word(rest);
            let id = DeviceId::from(require(id, "device")?);
            let payload = hex::decode(require(payload.trim(), "payload")?)?;
            Command::Write(id, Bytes::from(payload)).into()
        }
        "PAIRED" => Request::Paired,
        "DEVICES" => Request::Devices,
        "STATUS" => Request::Status(device(rest)?),
        _ => return Err(CodecError::UnknownVerb(verb.to_string())),
    };

    Ok(request)
}

fn encode_record(record: &DeviceRecord) -> String {
    match &record.name {
        Some(name) => format!("{} {} {}", record.id, record.bond_state, single_line(name)),
        None => format!("{} {}", record.id, record.bond_state),
    }
}

fn parse_record(rest: &str) -> Result<DeviceRecord, CodecError> {
    let (id, rest) = split_word(rest);
    let (bond, name) = split_word(rest);
    let bond_state = BondState::parse(require(bond, "bond state")?)
        .ok_or_else(|| CodecError::InvalidValue(bond.to_string()))?;
    Ok(DeviceRecord::new(
        require(id, "device")?,
        optional_text(name),
        bond_state,
    ))
}

fn encode_event(event: &ServiceEvent) -> String {
    let kind = event.kind();
    match event {
        ServiceEvent::DiscoveryStarted
        | ServiceEvent::DiscoveryFinished
        | ServiceEvent::Notification(Notification::AllConnectionsTornDown) => kind.to_string(),
        ServiceEvent::DeviceFound(record) => format!("{kind} {}", encode_record(record)),
        ServiceEvent::ConnectionError { device, reason }
        | ServiceEvent::WriteError { device, reason } => {
            format!("{kind} {device} {}", single_line(reason))
        }
        ServiceEvent::WriteFinished { device, bytes } => format!("{kind} {device} {bytes}"),
        other => match other.device() {
            Some(device) => format!("{kind} {device}"),
            None => kind.to_string(),
        },
    }
}

fn parse_event(line: &str) -> Result<ServiceEvent, CodecError> {
    let (kind, rest) = split_word(line);
    let (id, detail) = split_word(rest);
    let device = || -> Result<DeviceId, CodecError> { Ok(DeviceId::from(require(id, "device")?)) };

    let event: ServiceEvent = match kind {
        "DISCOVERY_STARTED" => ServiceEvent::DiscoveryStarted,
        "DISCOVERY_FINISHED" => ServiceEvent::DiscoveryFinished,
        "DEVICE_FOUND" => ServiceEvent::DeviceFound(parse_record(rest)?),
        "BONDED" => ServiceEvent::Bonded(device()?),
        "UNBONDED" => ServiceEvent::Unbonded(device()?),
        "CONNECTION_STARTED" => ServiceEvent::ConnectionStarted(device()?),
        "CONNECTION_ERROR" => ServiceEvent::ConnectionError {
            device: device()?,
            reason: detail.to_string(),
        },
        "CONNECTION_ESTABLISHED" => ServiceEvent::ConnectionEstablished(device()?),
        "DISCONNECTED" => ServiceEvent::Disconnected(device()?),
        "WRITE_STARTED" => ServiceEvent::WriteStarted(device()?),
        "WRITE_FINISHED" => ServiceEvent::WriteFinished {
            device: device()?,
            bytes: detail
                .trim()
                .parse()
                .map_err(|_| CodecError::InvalidValue(detail.to_string()))?,
        },
        "WRITE_ERROR" => ServiceEvent::WriteError {
            device: device()?,
            reason: detail.to_string(),
        },
        "NOTIFY_CONNECTED" => Notification::Connected(device()?).into(),
        "NOTIFY_DISCONNECTED" => Notification::Disconnected(device()?).into(),
        "NOTIFY_TORN_DOWN" => Notification::AllConnectionsTornDown.into(),
        _ => return Err(CodecError::UnknownVerb(kind.to_string())),
    };

    Ok(event)
}

/// Encode a response as a line (without the terminator)
pub fn encode_response(response: &Response) -> String {
    match response {
        Response::Ok => "OK".to_string(),
        Response::Err(message) => format!("ERR {}", single_line(message)),
        Response::Device(record) => format!("DEVICE {}", encode_record(record)),
        Response::State {
            device,
            state,
            connected,
        } => format!("STATE {device} {state} {connected}"),
        Response::Event(event) => format!("EVENT {}", encode_event(event)),
    }
}

/// Parse a response line
pub fn parse_response(line: &str) -> Result<Response, CodecError> {
    let (verb, rest) = split_word(line);

    let response = match verb {
        "" => return Err(CodecError::Empty),
        "OK" => Response::Ok,
        "ERR" => Response::Err(rest.trim().to_string()),
        "DEVICE" => Response::Device(parse_record(rest)?),
        "STATE" => {
            let (id, rest) = split_word(rest);
            let (state, connected) = split_word(rest);
            Response::State {
                device: DeviceId::from(require(id, "device")?),
                state: LinkState::parse(state)
                    .ok_or_else(|| CodecError::InvalidValue(state.to_string()))?,
                connected: connected
                    .trim()
                    .parse()
                    .map_err(|_| CodecError::InvalidValue(connected.to_string()))?,
            }
        }
        "EVENT" => Response::Event(parse_event(rest)?),
        _ => return Err(CodecError::UnknownVerb(verb.to_string())),
    };

    Ok(response)
}

/// Append a line and its terminator to a buffer
pub fn encode_line_into(line: &str, buf: &mut BytesMut) {
    buf.reserve(line.len() + 1);
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
}

/// Encode a line with its terminator
pub fn encode_line(line: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(line.len() + 1);
    encode_line_into(line, &mut buf);
    buf.freeze()
}

/// Try to take one complete line from a buffer
///
/// Returns:
/// - `Ok(Some(line))` if a complete line was found (terminator stripped)
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid
pub fn decode_line(buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
    let Some(end) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_LINE_LEN {
            return Err(CodecError::LineTooLong(buf.len()));
        }
        return Ok(None);
    };

    if end > MAX_LINE_LEN {
        return Err(CodecError::LineTooLong(end));
    }

    let mut line = buf.split_to(end);
    buf.advance(1);

    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }

    Ok(Some(std::str::from_utf8(&line)?.to_string()))
}

/// Decoder state machine for streaming line decoding
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Partial line data being accumulated
    buffer: BytesMut,
}

impl LineDecoder {
    /// Create a new line decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next line from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete lines
    pub fn decode_next(&mut self) -> Result<Option<String>, CodecError> {
        decode_line(&mut self.buffer)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
