//! The message read path: fragment reassembly and inline control handling.
//!
//! Reads are per-call and gated by the reader lock. Control frames that
//! arrive between data frames are answered on the spot, without surfacing
//! to the caller; only text/binary payload bytes reach the application.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::conn::{Conn, FrameInProgress, MsgInProgress, ReadState};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{self, FrameHeader, MessageType, OpCode, MAX_CONTROL_PAYLOAD};
use crate::mask::{apply_mask, apply_mask_offset};
use crate::utf8::Utf8Validator;

/// Whether a read returned mid-message or consumed the final bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// More of the message remains.
    More,
    /// The message is complete; the reader handle is spent.
    End,
}

/// Streaming access to one incoming message.
///
/// Obtained from [`Conn::reader`]. Holds the reader lock until the final
/// frame has been consumed; dropping it mid-message leaves the read side
/// unusable, since the remaining frame bytes were never drained.
pub struct MessageReader<'c, S> {
    conn: &'c Conn<S>,
    cancel: CancellationToken,
    state: Option<OwnedMutexGuard<ReadState<S>>>,
    typ: MessageType,
    flate: bool,
}

impl<S> std::fmt::Debug for MessageReader<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader")
            .field("typ", &self.typ)
            .field("flate", &self.flate)
            .finish_non_exhaustive()
    }
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wait for the next message and return its type and a reader for it.
    ///
    /// Control frames encountered while waiting are handled internally.
    pub async fn reader(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(MessageType, MessageReader<'_, S>)> {
        let mut st = self.read.lock(cancel, &self.closed).await?;
        if st.msg.is_some() {
            return Err(Error::InvalidState("previous message not read to completion"));
        }
        loop {
            let hdr = self.read_frame_header(cancel, &mut st).await?;
            if hdr.opcode.is_control() {
                self.handle_control(cancel, &mut st, &hdr).await?;
                continue;
            }
            let typ = match hdr.opcode {
                OpCode::Text => MessageType::Text,
                OpCode::Binary => MessageType::Binary,
                _ => {
                    return Err(self
                        .fail(
                            CloseReason::PROTOCOL_ERROR,
                            "unexpected continuation frame",
                            Error::Protocol("unexpected continuation frame"),
                        )
                        .await);
                }
            };
            if hdr.payload_len > self.opts.max_message_size as u64 {
                return Err(self
                    .fail(CloseReason::TOO_BIG, "message too large", Error::MessageTooLarge)
                    .await);
            }
            let flate = hdr.rsv1;
            st.msg = Some(MsgInProgress {
                typ,
                flate,
                total: 0,
                utf8: Utf8Validator::new(),
            });
            st.frame = FrameInProgress {
                remaining: hdr.payload_len,
                fin: hdr.fin,
                mask: hdr.mask,
                mask_offset: 0,
            };
            return Ok((
                typ,
                MessageReader {
                    conn: self,
                    cancel: cancel.clone(),
                    state: Some(st),
                    typ,
                    flate,
                },
            ));
        }
    }

    /// One-shot read: assemble a whole message.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<(MessageType, Vec<u8>)> {
        let (typ, mut reader) = self.reader(cancel).await?;
        let mut msg = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let (n, status) = reader.read(&mut chunk).await?;
            msg.extend_from_slice(&chunk[..n]);
            if status == ReadStatus::End {
                return Ok((typ, msg));
            }
        }
    }

    async fn read_frame_header(
        &self,
        cancel: &CancellationToken,
        st: &mut ReadState<S>,
    ) -> Result<FrameHeader> {
        let expect_masked = !self.client;
        let allow_rsv1 = self.flate();
        let res = tokio::select! {
            biased;
            _ = self.closed.wait() => return Err(self.closed.close_error()),
            _ = cancel.cancelled() => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "context canceled"));
                return Err(Error::Canceled);
            }
            r = frame::read_header(&mut st.br, expect_masked, allow_rsv1) => r,
        };
        match res {
            Ok(hdr) => Ok(hdr),
            Err(Error::Protocol(msg)) => {
                Err(self
                    .fail(CloseReason::PROTOCOL_ERROR, msg, Error::Protocol(msg))
                    .await)
            }
            Err(e) => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "read failed"));
                Err(e)
            }
        }
    }

    async fn read_payload_chunk(
        &self,
        cancel: &CancellationToken,
        st: &mut ReadState<S>,
        buf: &mut [u8],
    ) -> Result<usize> {
        let res = tokio::select! {
            biased;
            _ = self.closed.wait() => return Err(self.closed.close_error()),
            _ = cancel.cancelled() => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "context canceled"));
                return Err(Error::Canceled);
            }
            r = st.br.read(buf) => r,
        };
        match res {
            Ok(0) => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "unexpected eof"));
                Err(Error::io_context(
                    "failed to read frame payload",
                    io::ErrorKind::UnexpectedEof.into(),
                ))
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "read failed"));
                Err(Error::io_context("failed to read frame payload", e))
            }
        }
    }

    async fn read_control_payload(
        &self,
        cancel: &CancellationToken,
        st: &mut ReadState<S>,
        buf: &mut [u8],
    ) -> Result<()> {
        let res = tokio::select! {
            biased;
            _ = self.closed.wait() => return Err(self.closed.close_error()),
            _ = cancel.cancelled() => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "context canceled"));
                return Err(Error::Canceled);
            }
            r = st.br.read_exact(buf) => r,
        };
        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "read failed"));
                Err(Error::io_context("failed to read control payload", e))
            }
        }
    }

    /// Respond to a control frame: pong a ping, resolve a ping waiter, or
    /// run the close handshake.
    pub(crate) async fn handle_control(
        &self,
        cancel: &CancellationToken,
        st: &mut ReadState<S>,
        hdr: &FrameHeader,
    ) -> Result<()> {
        let n = hdr.payload_len as usize;
        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        self.read_control_payload(cancel, st, &mut payload[..n]).await?;
        if let Some(key) = hdr.mask {
            apply_mask(&mut payload[..n], key);
        }
        let payload = &payload[..n];

        match hdr.opcode {
            OpCode::Ping => {
                tracing::trace!(len = n, "ping received, replying with pong");
                self.write_control(cancel, OpCode::Pong, payload).await?;
            }
            OpCode::Pong => self.acknowledge_pong(payload),
            OpCode::Close => {
                let reason = match frame::parse_close_payload(payload) {
                    Ok(reason) => reason,
                    Err(Error::Protocol(msg)) => {
                        return Err(self
                            .fail(CloseReason::PROTOCOL_ERROR, msg, Error::Protocol(msg))
                            .await);
                    }
                    Err(e) => return Err(e),
                };
                tracing::debug!(?reason, "close frame received");
                if self.closed.record_cause(reason.clone()) {
                    let (code, text) = match &reason {
                        Some(r) => (r.code, r.reason.as_str()),
                        None => (CloseReason::NORMAL, ""),
                    };
                    let payload = frame::encode_close_payload(code, text);
                    let _ = self
                        .write_control(&CancellationToken::new(), OpCode::Close, &payload)
                        .await;
                    self.closed.finish();
                }
                return Err(self.closed.close_error());
            }
            _ => unreachable!("not a control opcode"),
        }
        Ok(())
    }
}

impl<'c, S> MessageReader<'c, S>
where
    S: AsyncRead + AsyncWrite,
{
    /// The type of the message being read.
    pub fn message_type(&self) -> MessageType {
        self.typ
    }

    /// True when the message arrived compressed (RSV1 on its first frame).
    /// The payload is surfaced as raw DEFLATE bytes for a decompressing
    /// collaborator.
    pub fn compressed(&self) -> bool {
        self.flate
    }

    /// Copy up to `buf.len()` bytes of the message into `buf`.
    ///
    /// Returns the bytes copied and whether the message is complete. After
    /// [`ReadStatus::End`] the reader lock is released and further calls
    /// return `(0, End)`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        let Some(guard) = self.state.as_mut() else {
            return Ok((0, ReadStatus::End));
        };
        let (n, status) = read_message_bytes(self.conn, &self.cancel, guard, buf).await?;
        if status == ReadStatus::End {
            guard.msg = None;
            self.state = None;
        }
        Ok((n, status))
    }
}

async fn read_message_bytes<S>(
    conn: &Conn<S>,
    cancel: &CancellationToken,
    st: &mut ReadState<S>,
    buf: &mut [u8],
) -> Result<(usize, ReadStatus)>
where
    S: AsyncRead + AsyncWrite,
{
    loop {
        if st.frame.remaining == 0 {
            if st.frame.fin {
                finish_text_validation(conn, st).await?;
                return Ok((0, ReadStatus::End));
            }
            let hdr = conn.read_frame_header(cancel, st).await?;
            if hdr.opcode.is_control() {
                conn.handle_control(cancel, st, &hdr).await?;
                continue;
            }
            if hdr.opcode != OpCode::Continuation {
                return Err(conn
                    .fail(
                        CloseReason::PROTOCOL_ERROR,
                        "expected continuation frame",
                        Error::Protocol("expected continuation frame"),
                    )
                    .await);
            }
            if hdr.rsv1 {
                return Err(conn
                    .fail(
                        CloseReason::PROTOCOL_ERROR,
                        "rsv1 set on continuation frame",
                        Error::Protocol("rsv1 set on continuation frame"),
                    )
                    .await);
            }
            let total = st.msg.as_ref().map(|m| m.total).unwrap_or(0);
            if total + hdr.payload_len > conn.opts.max_message_size as u64 {
                return Err(conn
                    .fail(CloseReason::TOO_BIG, "message too large", Error::MessageTooLarge)
                    .await);
            }
            st.frame = FrameInProgress {
                remaining: hdr.payload_len,
                fin: hdr.fin,
                mask: hdr.mask,
                mask_offset: 0,
            };
            continue;
        }

        if buf.is_empty() {
            return Ok((0, ReadStatus::More));
        }
        let want = buf.len().min(st.frame.remaining.min(usize::MAX as u64) as usize);
        let n = conn.read_payload_chunk(cancel, st, &mut buf[..want]).await?;
        if let Some(key) = st.frame.mask {
            st.frame.mask_offset = apply_mask_offset(&mut buf[..n], key, st.frame.mask_offset);
        }
        st.frame.remaining -= n as u64;

        let msg = st.msg.as_mut().expect("reader exists only with a message in progress");
        msg.total += n as u64;
        if msg.typ == MessageType::Text && !msg.flate && !msg.utf8.feed(&buf[..n]) {
            return Err(conn
                .fail(
                    CloseReason::INVALID_PAYLOAD,
                    "invalid utf-8 in text message",
                    Error::InvalidUtf8,
                )
                .await);
        }

        if st.frame.remaining == 0 && st.frame.fin {
            finish_text_validation(conn, st).await?;
            return Ok((n, ReadStatus::End));
        }
        return Ok((n, ReadStatus::More));
    }
}

async fn finish_text_validation<S>(conn: &Conn<S>, st: &mut ReadState<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let Some(msg) = st.msg.as_mut() else {
        return Ok(());
    };
    if msg.typ == MessageType::Text && !msg.flate && !msg.utf8.finish() {
        return Err(conn
            .fail(
                CloseReason::INVALID_PAYLOAD,
                "invalid utf-8 in text message",
                Error::InvalidUtf8,
            )
            .await);
    }
    Ok(())
}
