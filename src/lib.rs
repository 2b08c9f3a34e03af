//! # Riptide-WS: WebSocket framing and message engine
//!
//! The core of an RFC 6455 endpoint: frame encoding and decoding over a
//! full-duplex byte stream, protocol invariant enforcement, and
//! coordination of concurrent readers, writers, and control-frame traffic
//! on a single established connection. The RFC 7692 permessage-deflate
//! extension is applied on the write path with stateless per-message
//! compression and an explicit sliding-window dictionary.
//!
//! The opening HTTP handshake, TLS, and message routing are collaborators:
//! this crate consumes an already-upgraded `AsyncRead + AsyncWrite` stream
//! plus the negotiated [`Options`] record.
//!
//! ## Concurrency
//!
//! - One logical writer and one logical reader at a time, enforced by
//!   context-aware locks whose guards live in the returned handles.
//! - Control frames (ping/pong/close) are handled inline on the read path
//!   and written on a dedicated path that can interleave between data
//!   frames of a message in progress, but never inside one frame.
//! - Every suspension point observes the operation's
//!   `CancellationToken` and the connection's close signal.
//!
//! ## Example
//!
//! ```ignore
//! use riptide_ws::{Conn, MessageType, Options, Role};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn echo(stream: tokio::net::TcpStream) -> riptide_ws::Result<()> {
//!     let conn = Conn::new(stream, Options::new(Role::Server));
//!     let cancel = CancellationToken::new();
//!     loop {
//!         let (typ, msg) = conn.read(&cancel).await?;
//!         conn.write(&cancel, typ, &msg).await?;
//!     }
//! }
//! ```

pub mod conn;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod mask;
pub mod read;
pub mod utf8;
pub mod write;

mod sync;
mod trim;
mod window;

pub use conn::Conn;
pub use deflate::{parse_deflate_params, DeflateParams};
pub use error::{CloseReason, Error, Result};
pub use frame::{FrameHeader, MessageType, OpCode};
pub use read::{MessageReader, ReadStatus};
pub use write::MessageWriter;

/// Staging buffer size for outgoing frames (16KB)
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Buffered reader size for incoming frames (64KB)
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default minimum first-fragment size at which a message is compressed
pub const DEFAULT_FLATE_THRESHOLD: usize = 128;

/// Default DEFLATE compression level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Default maximum incoming message size (64MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask outgoing frames)
    Client,
    /// Server (must not mask outgoing frames)
    Server,
}

/// Options negotiated at handshake time, consumed by the connection core.
#[derive(Debug, Clone)]
pub struct Options {
    /// Which side of the connection this endpoint is
    pub role: Role,
    /// Whether permessage-deflate was negotiated
    pub flate_enabled: bool,
    /// If set, the client resets its compressor dictionary after each message
    pub client_no_context_takeover: bool,
    /// If set, the server resets its compressor dictionary after each message
    pub server_no_context_takeover: bool,
    /// Minimum first-fragment payload size at which a message is compressed
    pub flate_threshold: usize,
    /// DEFLATE compression level (0-9)
    pub compression_level: u32,
    /// Incoming messages above this size fail the connection with 1009
    pub max_message_size: usize,
}

impl Options {
    /// Options with compression disabled.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            flate_enabled: false,
            client_no_context_takeover: false,
            server_no_context_takeover: false,
            flate_threshold: DEFAULT_FLATE_THRESHOLD,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Options with permessage-deflate negotiated with default parameters.
    pub fn with_flate(role: Role) -> Self {
        Self {
            flate_enabled: true,
            ..Self::new(role)
        }
    }

    /// Options from the negotiated `permessage-deflate` extension header
    /// value agreed on by the handshake, e.g.
    /// `"permessage-deflate; client_no_context_takeover"`.
    pub fn from_deflate_params(role: Role, value: &str) -> Result<Self> {
        let params = deflate::parse_deflate_params(value)?;
        Ok(Self {
            flate_enabled: true,
            client_no_context_takeover: params.client_no_context_takeover,
            server_no_context_takeover: params.server_no_context_takeover,
            ..Self::new(role)
        })
    }
}
