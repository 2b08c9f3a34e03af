//! Error types for the connection core.

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying byte stream
    Io(io::Error),
    /// Peer violated RFC 6455; the connection closes with status 1002
    Protocol(&'static str),
    /// Invalid UTF-8 in a text message; the connection closes with status 1007
    InvalidUtf8,
    /// Message exceeded the configured size limit; closes with status 1009
    MessageTooLarge,
    /// The bound cancellation token fired before the operation completed
    Canceled,
    /// Operation on an already-closed connection, carrying the close cause
    Closed(Option<CloseReason>),
    /// Write or close on a message writer that was already closed
    UseClosedWriter,
    /// Invalid use of the API
    InvalidState(&'static str),
    /// Deflate error on the write path
    Compression(String),
}

/// Close frame status code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear in a close frame per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl Error {
    /// Wrap an I/O error with a short context string for diagnosability.
    pub(crate) fn io_context(what: &'static str, e: io::Error) -> Error {
        Error::Io(io::Error::new(e.kind(), format!("{what}: {e}")))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::InvalidUtf8 => write!(f, "invalid UTF-8 in text message"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::Canceled => write!(f, "operation canceled"),
            Error::Closed(reason) => {
                if let Some(r) = reason {
                    write!(f, "connection closed: {} ({})", r.code, r.reason)
                } else {
                    write!(f, "connection closed")
                }
            }
            Error::UseClosedWriter => write!(f, "cannot use closed message writer"),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::Compression(msg) => write!(f, "compression error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
