use std::fmt::{Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::message::Message;

/// Error codes shared with the native proxy implementation. They are carried in the `error`
///  field of a [Message] and as the code of a [SocketException], so the numbering must not
///  change.
#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum SocketError {
    Success = 0,
    Fatal = -1,
    Arg = -2,
    Fault = -3,
    BadState = -4,
    OutOfMemory = -5,
    AlreadyExists = -6,
    NotFound = -7,
    NotSupported = -8,
    NotImpl = -9,
    Permission = -10,
    Retry = -11,
    Nomore = -12,
    Network = -13,
    Connecting = -14,
    Busy = -15,
    Writing = -16,
    Reading = -17,
    Waiting = -18,
    Timeout = -19,
    Aborted = -20,
    Closed = -21,
    Shutdown = -22,
    Refused = -23,
    NoAddress = -24,
    NoHost = -25,
    HostUnknown = -26,
    AddressFamily = -27,
    Duplicate = -28,
    BadFlags = -29,
    InvalidFormat = -30,
    DiskIo = -31,
    Missing = -32,
    PropGet = -33,
    PropSet = -34,
    Reset = -35,
    Undelivered = -36,
    Crypto = -37,
    Comm = -38,
}

impl SocketError {
    /// Codes received from a peer that this build does not know are treated as fatal.
    pub fn from_code(code: i32) -> SocketError {
        SocketError::try_from_primitive(code)
            .unwrap_or(SocketError::Fatal)
    }

    pub fn code(self) -> i32 {
        self.into()
    }
}

impl Display for SocketError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}


/// The error type of all socket level failures. It travels inside `anyhow::Error`, and
///  [socket_error_of] recovers the code from an arbitrary error chain.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{message} : {code}")]
pub struct SocketException {
    pub code: SocketError,
    pub message: String,
}

impl SocketException {
    pub fn new(code: SocketError, message: impl Into<String>) -> SocketException {
        SocketException {
            code,
            message: message.into(),
        }
    }

    pub fn from_code(code: SocketError) -> SocketException {
        Self::new(code, format!("{:?}", code))
    }

    /// Keeps the code of a [SocketException] somewhere in the error's chain, wrapping anything
    ///  else as [SocketError::Fatal].
    pub fn from_error(message: &str, e: &anyhow::Error) -> SocketException {
        match find_socket_exception(e) {
            Some(s) => s.clone(),
            None => Self::new(SocketError::Fatal, format!("{}: {:#}", message, e)),
        }
    }
}

/// Malformed wire data. This is always fatal for the decode operation that encountered it.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("unexpected number of properties {actual} (expected {expected})")]
    FieldCount { expected: String, actual: usize },
    #[error("bad message version {0:#010x}")]
    Version(u32),
    #[error("unknown content type {type_id} (response: {is_response})")]
    UnknownContentType { type_id: u32, is_response: bool },
    #[error("content type {type_id} does not match content (response: {is_response})")]
    ContentMismatch { type_id: u32, is_response: bool },
    #[error("bad address family {0}")]
    AddressFamily(i32),
    #[error("address family {0} can not be encoded")]
    NotEncodable(i32),
    #[error("bad {what} size {actual}")]
    FixedSize { what: &'static str, actual: usize },
    #[error("unexpected marker {marker:#04x} reading {expected}")]
    Marker { marker: u8, expected: &'static str },
    #[error("integer out of range for {0}")]
    OutOfRange(&'static str),
    #[error("bad property type {0}")]
    PropertyType(u32),
    #[error("buffer underflow reading {0}")]
    Underflow(&'static str),
    #[error("invalid utf-8 string")]
    Utf8,
}


pub fn find_socket_exception(e: &anyhow::Error) -> Option<&SocketException> {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<SocketException>())
}

/// The socket error code of the first [SocketException] in an error chain, or
///  [SocketError::Fatal] if there is none.
pub fn socket_error_of(e: &anyhow::Error) -> SocketError {
    find_socket_exception(e)
        .map(|s| s.code)
        .unwrap_or(SocketError::Fatal)
}

pub fn is_format_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| cause.is::<FormatError>())
}

/// Turns a response carrying a nonzero error code into an error
pub fn check_response(response: &Message) -> anyhow::Result<()> {
    if response.error == SocketError::Success.code() {
        return Ok(());
    }
    let code = SocketError::from_code(response.error);
    Err(SocketException::new(code, format!("remote side returned {} for {:?}", code, response.content.kind())).into())
}
