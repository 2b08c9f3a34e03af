//! Byte-sink adapter that withholds the trailing four bytes of a burst.
//!
//! A sync-flushed DEFLATE block ends with the bytes `00 00 FF FF`, which
//! RFC 7692 §7.2.1 requires to be removed before framing. Rather than
//! scanning for the marker, the writer keeps the last four bytes of the
//! cumulative output out of the downstream buffer at all times.

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Trailer emitted by every sync-flushed DEFLATE block.
pub(crate) const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[derive(Debug, Default)]
pub(crate) struct TrimWriter {
    out: BytesMut,
    tail: [u8; 4],
    tail_len: usize,
}

impl TrimWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `p`, keeping the last four bytes of everything written so far
    /// in the tail instead of the downstream buffer.
    pub fn write(&mut self, p: &[u8]) {
        if p.len() >= 4 {
            self.out.extend_from_slice(&self.tail[..self.tail_len]);
            self.out.extend_from_slice(&p[..p.len() - 4]);
            self.tail.copy_from_slice(&p[p.len() - 4..]);
            self.tail_len = 4;
            return;
        }
        let total = self.tail_len + p.len();
        if total > 4 {
            let spill = total - 4;
            self.out.extend_from_slice(&self.tail[..spill]);
            self.tail.copy_within(spill..self.tail_len, 0);
            self.tail_len -= spill;
        }
        self.tail[self.tail_len..self.tail_len + p.len()].copy_from_slice(p);
        self.tail_len += p.len();
    }

    /// Drain the bytes released to the downstream buffer so far.
    pub fn take(&mut self) -> BytesMut {
        self.out.split()
    }

    /// Validate that the withheld tail is the DEFLATE sync trailer and
    /// discard it. Called once per message, after the final flush.
    pub fn finish(&mut self) -> Result<()> {
        if self.tail_len != 4 || self.tail != DEFLATE_TRAILER {
            return Err(Error::Compression(
                "deflate block does not end with the sync trailer".into(),
            ));
        }
        self.tail_len = 0;
        Ok(())
    }

    /// Clear the withheld tail and any undrained downstream bytes.
    pub fn reset(&mut self) {
        self.tail_len = 0;
        self.out.clear();
    }
}
