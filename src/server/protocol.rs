//! Dispatch wire protocol
//!
//! Every request and every response is one dispatch frame:
//!
//! ```text
//! ┌───────────┬──────────┬──────────────┬─────────────────────┐
//! │ ver │ typ │  object  │  body_size   │  body               │
//! │ 4b  │ 4b  │  1 byte  │  2 bytes BE  │  body_size bytes    │
//! └───────────┴──────────┴──────────────┴─────────────────────┘
//! ```
//!
//! The body is a run of UTF-8 fields, each terminated by ETX (0x03). The
//! number of fields is the number of ETX bytes; anything after the last ETX
//! is not a field.

use std::fmt;
use std::io::{self, Read, Write};

/// Protocol version spoken by this server
pub const PROTOCOL_VERSION: u8 = 1;

/// Field terminator
pub const ETX: u8 = 0x03;

/// Header size in bytes
pub const HEADER_LEN: usize = 4;

/// Largest body the 16-bit size field can describe
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

/// Default ceiling applied when reading bodies from the network
pub const DEFAULT_BODY_LIMIT: usize = 8192;

/// Operation codes (low nibble of the first header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Create,
    Read,
    Update,
    Destroy,
    PingUser,
    PingChannel,
    /// A code with no named variant
    ///
    /// Built by hand with a named code (`Other(9)`), it goes out on the wire
    /// as that code and decodes as the named variant.
    Other(u8),
}

impl OpType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => OpType::Create,
            2 => OpType::Read,
            3 => OpType::Update,
            4 => OpType::Destroy,
            9 => OpType::PingUser,
            10 => OpType::PingChannel,
            other => OpType::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            OpType::Create => 1,
            OpType::Read => 2,
            OpType::Update => 3,
            OpType::Destroy => 4,
            OpType::PingUser => 9,
            OpType::PingChannel => 10,
            OpType::Other(code) => code,
        }
    }

    /// Parse a symbolic name such as `create` or `ping-user`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "create" => Some(OpType::Create),
            "read" => Some(OpType::Read),
            "update" => Some(OpType::Update),
            "destroy" => Some(OpType::Destroy),
            "ping-user" | "ping_user" => Some(OpType::PingUser),
            "ping-channel" | "ping_channel" => Some(OpType::PingChannel),
            _ => None,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpType::Create => write!(f, "CREATE"),
            OpType::Read => write!(f, "READ"),
            OpType::Update => write!(f, "UPDATE"),
            OpType::Destroy => write!(f, "DESTROY"),
            OpType::PingUser => write!(f, "PING_USER"),
            OpType::PingChannel => write!(f, "PING_CHANNEL"),
            OpType::Other(code) => write!(f, "TYPE({})", code),
        }
    }
}

/// Entity codes (second header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    User,
    Channel,
    Message,
    Auth,
    /// A code with no named variant; named codes decode as their variant
    Other(u8),
}

impl ObjectType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ObjectType::User,
            2 => ObjectType::Channel,
            3 => ObjectType::Message,
            4 => ObjectType::Auth,
            other => ObjectType::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ObjectType::User => 1,
            ObjectType::Channel => 2,
            ObjectType::Message => 3,
            ObjectType::Auth => 4,
            ObjectType::Other(code) => code,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "user" => Some(ObjectType::User),
            "channel" => Some(ObjectType::Channel),
            "message" => Some(ObjectType::Message),
            "auth" => Some(ObjectType::Auth),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::User => write!(f, "USER"),
            ObjectType::Channel => write!(f, "CHANNEL"),
            ObjectType::Message => write!(f, "MESSAGE"),
            ObjectType::Auth => write!(f, "AUTH"),
            ObjectType::Other(code) => write!(f, "OBJECT({})", code),
        }
    }
}

/// Errors raised while reading, writing or splitting dispatches
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Peer closed the connection before sending a header byte
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Peer closed the connection in the middle of a frame
    #[error("truncated dispatch: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("dispatch body too large: {size} bytes (limit {limit})")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("version {0} does not fit in 4 bits")]
    BadVersion(u8),

    #[error("type code {0} does not fit in 4 bits")]
    BadType(u8),

    /// A field holds NUL or is not valid UTF-8
    #[error("field {index} is not a valid text field")]
    InvalidField { index: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the error is the peer going away cleanly
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed)
    }
}

/// One request or response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub version: u8,
    pub op: OpType,
    pub object: ObjectType,
    pub body: Vec<u8>,
}

impl Dispatch {
    pub fn new(op: OpType, object: ObjectType, body: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            op,
            object,
            body,
        }
    }

    /// Build a dispatch whose body is the given fields, each ETX-terminated
    pub fn with_fields<S: AsRef<str>>(op: OpType, object: ObjectType, fields: &[S]) -> Self {
        Self::new(op, object, join_fields(fields))
    }

    /// Response to `request`: `status ETX payload... ETX`
    pub fn response<S: AsRef<str>>(request: &Dispatch, status: u16, payload: &[S]) -> Self {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(status.to_string().as_bytes());
        body.push(ETX);
        body.extend_from_slice(&join_fields(payload));
        Self::new(request.op, request.object, body)
    }

    /// Split the body into fields
    pub fn fields(&self) -> Result<Vec<String>, ProtocolError> {
        split_fields(&self.body)
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}

/// Pack the header of `dispatch` into its 4 wire bytes
pub fn encode_header(dispatch: &Dispatch) -> Result<[u8; HEADER_LEN], ProtocolError> {
    if dispatch.version > 0x0f {
        return Err(ProtocolError::BadVersion(dispatch.version));
    }
    let op = dispatch.op.code();
    if op > 0x0f {
        return Err(ProtocolError::BadType(op));
    }
    let size = dispatch.body.len();
    if size > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge {
            size,
            limit: MAX_BODY_SIZE,
        });
    }
    let size = (size as u16).to_be_bytes();
    Ok([
        (dispatch.version << 4) | op,
        dispatch.object.code(),
        size[0],
        size[1],
    ])
}

/// Encode a dispatch into one contiguous frame
pub fn encode_dispatch(dispatch: &Dispatch) -> Result<Vec<u8>, ProtocolError> {
    let header = encode_header(dispatch)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + dispatch.body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&dispatch.body);
    Ok(frame)
}

/// Unpack a 4-byte header into (version, type, object, body_size)
pub fn decode_header(header: [u8; HEADER_LEN]) -> (u8, OpType, ObjectType, usize) {
    let version = header[0] >> 4;
    let op = OpType::from_code(header[0] & 0x0f);
    let object = ObjectType::from_code(header[1]);
    let size = u16::from_be_bytes([header[2], header[3]]) as usize;
    (version, op, object, size)
}

/// Read exactly `buf.len()` bytes, reporting how far we got on EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(filled)
}

/// Read one dispatch, rejecting bodies larger than `body_limit`
pub fn read_dispatch<R: Read>(reader: &mut R, body_limit: usize) -> Result<Dispatch, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];

    // A zero-length read on the very first byte is an orderly close
    let got = read_full(reader, &mut header[..1])?;
    if got == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    let got = read_full(reader, &mut header[1..])?;
    if got < HEADER_LEN - 1 {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            got: got + 1,
        });
    }

    let (version, op, object, size) = decode_header(header);
    let limit = body_limit.min(MAX_BODY_SIZE);
    if size > limit {
        return Err(ProtocolError::BodyTooLarge { size, limit });
    }

    let mut body = vec![0u8; size];
    let got = read_full(reader, &mut body)?;
    if got < size {
        return Err(ProtocolError::Truncated {
            expected: size,
            got,
        });
    }

    Ok(Dispatch {
        version,
        op,
        object,
        body,
    })
}

/// Write one dispatch as a single frame
pub fn write_dispatch<W: Write>(writer: &mut W, dispatch: &Dispatch) -> Result<(), ProtocolError> {
    let frame = encode_dispatch(dispatch)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Split an ETX-delimited body into owned text fields
///
/// The field count equals the number of ETX bytes: `"a\x03b\x03"` has two
/// fields, `"\x03"` has one empty field, `""` has none, and trailing bytes
/// without a terminator are dropped.
pub fn split_fields(body: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let count = body.iter().filter(|&&b| b == ETX).count();
    let mut fields = Vec::with_capacity(count);
    for (index, raw) in body.split(|&b| b == ETX).take(count).enumerate() {
        if raw.contains(&0) {
            return Err(ProtocolError::InvalidField { index });
        }
        let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidField { index })?;
        fields.push(text.to_string());
    }
    Ok(fields)
}

/// Join fields, terminating each with ETX
pub fn join_fields<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
    let len = fields.iter().map(|f| f.as_ref().len() + 1).sum();
    let mut body = Vec::with_capacity(len);
    for field in fields {
        body.extend_from_slice(field.as_ref().as_bytes());
        body.push(ETX);
    }
    body
}
