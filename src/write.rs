//! The message write path: writer handle, one-shot writes, and the
//! compression pipeline.
//!
//! Compression is stateless per pass: each `write` runs a fresh DEFLATE
//! encoder primed with the sliding window as preset dictionary, and the
//! trim writer strips the four sync-trailer bytes the extension forbids on
//! the wire. No compressor object outlives a message, which makes context
//! takeover a matter of keeping or discarding the window.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::conn::{Conn, WriterSlot};
use crate::deflate::stateless_deflate;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{MessageType, OpCode};
use crate::window::WINDOW_CAPACITY;

/// Streaming access to one outgoing message.
///
/// Obtained from [`Conn::writer`]. Holds the writer lock until [`close`]
/// emits the final frame. Dropping the handle without closing releases the
/// lock but leaves the message unterminated on the wire.
///
/// [`close`]: MessageWriter::close
pub struct MessageWriter<'c, S> {
    conn: &'c Conn<S>,
    cancel: CancellationToken,
    slot: Option<OwnedMutexGuard<WriterSlot>>,
    opcode: OpCode,
    flate: bool,
}

impl<S> std::fmt::Debug for MessageWriter<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("opcode", &self.opcode)
            .field("flate", &self.flate)
            .finish_non_exhaustive()
    }
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Begin a message of the given type, acquiring the writer lock.
    ///
    /// Fails with [`Error::Canceled`] if the token fires first and with
    /// [`Error::Closed`] once the connection has closed.
    pub async fn writer(
        &self,
        cancel: &CancellationToken,
        typ: MessageType,
    ) -> Result<MessageWriter<'_, S>> {
        let mut slot = self.writer_slot.lock(cancel, &self.closed).await?;
        slot.trim.reset();
        Ok(MessageWriter {
            conn: self,
            cancel: cancel.clone(),
            slot: Some(slot),
            opcode: typ.opcode(),
            flate: false,
        })
    }

    /// Write a whole message at once.
    ///
    /// Below the compression threshold (or with compression disabled) this
    /// emits a single FIN frame directly, skipping the message writer's
    /// per-frame state transitions. Above it, the payload is compressed in
    /// one pass and still goes out as a single FIN frame.
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        typ: MessageType,
        p: &[u8],
    ) -> Result<()> {
        let mut slot = self.writer_slot.lock(cancel, &self.closed).await?;
        if !self.flate() || p.is_empty() || p.len() < self.opts.flate_threshold {
            return self.write_frame(cancel, true, false, typ.opcode(), p).await;
        }

        slot.trim.reset();
        slot.dict.init(WINDOW_CAPACITY);
        let payload = {
            let WriterSlot { trim, dict } = &mut *slot;
            stateless_deflate(trim, p, dict.bytes(), self.opts.compression_level)?;
            trim.finish()?;
            dict.write(p);
            trim.take()
        };
        let res = self.write_frame(cancel, true, true, typ.opcode(), &payload).await;
        if res.is_err() {
            // The dictionary has advanced past what the peer saw; there is
            // no recovering the compressed stream.
            self.abort(CloseReason::new(
                CloseReason::ABNORMAL,
                "compressed message aborted",
            ));
        }
        if !self.flate_context_takeover() {
            slot.dict.close();
        }
        res
    }
}

impl<'c, S> MessageWriter<'c, S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Stream bytes into the message as zero or more non-final frames.
    ///
    /// The first write of at least `flate_threshold` bytes activates
    /// compression for the whole message when permessage-deflate was
    /// negotiated. While compression is active a zero-byte write emits no
    /// frame at all.
    pub async fn write(&mut self, p: &[u8]) -> Result<usize> {
        if self.slot.is_none() {
            return Err(Error::UseClosedWriter);
        }
        if self.conn.flate()
            && self.opcode != OpCode::Continuation
            && p.len() >= self.conn.opts.flate_threshold
        {
            let slot = self.slot.as_mut().ok_or(Error::UseClosedWriter)?;
            slot.dict.init(WINDOW_CAPACITY);
            self.flate = true;
        }

        if !self.flate {
            self.write_data_frame(p).await?;
            return Ok(p.len());
        }
        if p.is_empty() {
            return Ok(0);
        }
        let burst = {
            let slot = self.slot.as_mut().ok_or(Error::UseClosedWriter)?;
            let WriterSlot { trim, dict } = &mut **slot;
            stateless_deflate(trim, p, dict.bytes(), self.conn.opts.compression_level)?;
            dict.write(p);
            trim.take()
        };
        if !burst.is_empty() {
            if let Err(e) = self.write_data_frame(&burst).await {
                self.conn.abort(CloseReason::new(
                    CloseReason::ABNORMAL,
                    "compressed message aborted",
                ));
                return Err(e);
            }
        }
        Ok(p.len())
    }

    /// Emit the final frame (FIN=1) and release the writer lock.
    ///
    /// Under compression this flushes the final DEFLATE block, validates
    /// and discards the withheld `00 00 FF FF` trailer, and carries
    /// whatever the trim writer still holds in the FIN frame.
    pub async fn close(&mut self) -> Result<()> {
        let mut slot = self.slot.take().ok_or(Error::UseClosedWriter)?;
        if !self.flate {
            return self
                .conn
                .write_frame(&self.cancel, true, false, self.opcode, &[])
                .await;
        }

        let payload = {
            let trim = &mut slot.trim;
            stateless_deflate(trim, &[], &[], self.conn.opts.compression_level)?;
            trim.finish()?;
            trim.take()
        };
        if let Err(e) = self
            .conn
            .write_frame(&self.cancel, true, true, self.opcode, &payload)
            .await
        {
            self.conn.abort(CloseReason::new(
                CloseReason::ABNORMAL,
                "compressed message aborted",
            ));
            return Err(e);
        }
        if !self.conn.flate_context_takeover() {
            slot.dict.close();
        }
        Ok(())
    }

    async fn write_data_frame(&mut self, p: &[u8]) -> Result<()> {
        self.conn
            .write_frame(&self.cancel, false, self.flate, self.opcode, p)
            .await?;
        self.opcode = OpCode::Continuation;
        Ok(())
    }
}
