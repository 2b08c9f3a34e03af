//! WebSocket frame headers (RFC 6455 §5.2).
//!
//! Encoding stages the 2..14 header bytes into a `BytesMut`; decoding reads
//! exactly the bytes the length discriminator calls for from a buffered
//! reader and enforces every header invariant before any payload byte is
//! touched.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{CloseReason, Error, Result};

/// Largest payload expressible with the 7-bit inline length.
pub const LEN_7_MAX: u64 = 125;

/// Largest payload expressible with the 16-bit extended length.
pub const LEN_16_MAX: u64 = 65535;

/// Maximum control frame payload (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Maximum close reason length: control payload minus the status code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control opcode
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data opcode
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// The type of a logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// UTF-8 text
    Text,
    /// Arbitrary bytes
    Binary,
}

impl MessageType {
    #[inline]
    pub(crate) fn opcode(self) -> OpCode {
        match self {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
        }
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1: compressed payload when permessage-deflate was negotiated
    pub rsv1: bool,
    /// RSV2 (reserved, always zero)
    pub rsv2: bool,
    /// RSV3 (reserved, always zero)
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (true for client->server frames)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Encode the header into a buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        buf.put_u8(b0);

        let mask_bit = if self.masked { 0x80 } else { 0x00 };
        if self.payload_len <= LEN_7_MAX {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= LEN_16_MAX {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// Read and validate one frame header.
///
/// `expect_masked` is true on the server side (client frames must be
/// masked) and false on the client side. `allow_rsv1` is true when
/// permessage-deflate was negotiated.
pub(crate) async fn read_header<R>(
    r: &mut R,
    expect_masked: bool,
    allow_rsv1: bool,
) -> Result<FrameHeader>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    r.read_exact(&mut head)
        .await
        .map_err(|e| Error::io_context("failed to read frame header", e))?;

    let fin = head[0] & 0x80 != 0;
    let rsv1 = head[0] & 0x40 != 0;
    let rsv2 = head[0] & 0x20 != 0;
    let rsv3 = head[0] & 0x10 != 0;

    if rsv1 && !allow_rsv1 {
        return Err(Error::Protocol("rsv1 set but compression not negotiated"));
    }
    if rsv2 || rsv3 {
        return Err(Error::Protocol("rsv2 and rsv3 must be zero"));
    }

    let opcode = OpCode::from_u8(head[0] & 0x0F).ok_or(Error::Protocol("reserved opcode"))?;

    let masked = head[1] & 0x80 != 0;
    if expect_masked && !masked {
        return Err(Error::Protocol("client frames must be masked"));
    }
    if !expect_masked && masked {
        return Err(Error::Protocol("server frames must not be masked"));
    }

    let payload_len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            r.read_exact(&mut ext)
                .await
                .map_err(|e| Error::io_context("failed to read frame header", e))?;
            let len = u16::from_be_bytes(ext) as u64;
            if len <= LEN_7_MAX {
                return Err(Error::Protocol("payload length not minimally encoded"));
            }
            len
        }
        127 => {
            let mut ext = [0u8; 8];
            r.read_exact(&mut ext)
                .await
                .map_err(|e| Error::io_context("failed to read frame header", e))?;
            let len = u64::from_be_bytes(ext);
            if len <= LEN_16_MAX {
                return Err(Error::Protocol("payload length not minimally encoded"));
            }
            if len >> 63 != 0 {
                return Err(Error::Protocol("payload length high bit must be zero"));
            }
            len
        }
        n => n as u64,
    };

    if opcode.is_control() {
        if !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("control frame payload too large"));
        }
        if rsv1 {
            return Err(Error::Protocol("control frame must not set rsv1"));
        }
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        r.read_exact(&mut key)
            .await
            .map_err(|e| Error::io_context("failed to read frame header", e))?;
        Some(key)
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        masked,
        payload_len,
        mask,
    })
}

/// Encode a close frame payload: 2-byte big-endian status code followed by
/// a UTF-8 reason, truncated at a character boundary to fit the control
/// payload limit.
pub(crate) fn encode_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// Parse a close frame payload into its status code and reason.
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.len() == 1 {
        return Err(Error::Protocol("close frame with one byte payload"));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !CloseReason::is_valid_code(code) {
        return Err(Error::Protocol("invalid close status code"));
    }
    if !crate::utf8::validate_utf8(&payload[2..]) {
        return Err(Error::Protocol("close reason is not valid utf-8"));
    }
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Ok(Some(CloseReason::new(code, reason)))
}
