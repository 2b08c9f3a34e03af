//! A single established WebSocket connection.
//!
//! The connection owns the byte stream exclusively: the read half behind a
//! buffered reader, the write half behind a staging buffer. Three
//! context-aware locks coordinate concurrent use: the writer lock (logical
//! ownership of the write side, held from `writer` until the message
//! closes), the frame lock (one frame's bytes reach the wire without
//! interleaving), and the reader lock (logical ownership of the read
//! side). Control frames take only the frame lock, so ping/pong and close
//! replies slot in between data frames of a message in progress.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CloseReason, Error, Result};
use crate::frame::{self, FrameHeader, MessageType, OpCode};
use crate::mask::{apply_mask, generate_mask};
use crate::sync::{CloseState, CtxMutex};
use crate::trim::TrimWriter;
use crate::utf8::Utf8Validator;
use crate::window::SlidingWindow;
use crate::{Options, Role, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};

/// Hard deadline for control frame writes.
pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// An established WebSocket connection over an upgraded byte stream.
///
/// Created by the handshake collaborator once the HTTP upgrade has
/// completed and the extension options are known. All methods take
/// `&self`; reading and writing may proceed concurrently from different
/// tasks.
pub struct Conn<S> {
    pub(crate) client: bool,
    pub(crate) opts: Options,
    pub(crate) write: CtxMutex<WriteState<S>>,
    pub(crate) writer_slot: CtxMutex<WriterSlot>,
    pub(crate) read: CtxMutex<ReadState<S>>,
    pub(crate) closed: CloseState,
    pings: parking_lot::Mutex<HashMap<Vec<u8>, oneshot::Sender<()>>>,
    ping_counter: AtomicU64,
}

/// Write half plus the staging buffer one frame is assembled in.
pub(crate) struct WriteState<S> {
    half: WriteHalf<S>,
    buf: BytesMut,
}

/// Per-connection compression state, guarded by the writer lock and reused
/// across messages so the dictionary can survive message boundaries when
/// context takeover is allowed.
pub(crate) struct WriterSlot {
    pub(crate) trim: TrimWriter,
    pub(crate) dict: SlidingWindow,
}

/// Decode progress within the current frame.
#[derive(Debug, Default)]
pub(crate) struct FrameInProgress {
    pub(crate) remaining: u64,
    pub(crate) fin: bool,
    pub(crate) mask: Option<[u8; 4]>,
    pub(crate) mask_offset: usize,
}

/// Decode progress within the current message.
pub(crate) struct MsgInProgress {
    pub(crate) typ: MessageType,
    pub(crate) flate: bool,
    pub(crate) total: u64,
    pub(crate) utf8: Utf8Validator,
}

pub(crate) struct ReadState<S> {
    pub(crate) br: BufReader<ReadHalf<S>>,
    pub(crate) frame: FrameInProgress,
    pub(crate) msg: Option<MsgInProgress>,
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap an already-upgraded byte stream.
    pub fn new(stream: S, opts: Options) -> Self {
        let (rh, wh) = tokio::io::split(stream);
        Self {
            client: opts.role == Role::Client,
            write: CtxMutex::new(WriteState {
                half: wh,
                buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            }),
            writer_slot: CtxMutex::new(WriterSlot {
                trim: TrimWriter::new(),
                dict: SlidingWindow::new(),
            }),
            read: CtxMutex::new(ReadState {
                br: BufReader::with_capacity(READ_BUFFER_SIZE, rh),
                frame: FrameInProgress::default(),
                msg: None,
            }),
            closed: CloseState::new(),
            pings: parking_lot::Mutex::new(HashMap::new()),
            ping_counter: AtomicU64::new(0),
            opts,
        }
    }

    /// The options this connection was built with.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    #[inline]
    pub(crate) fn flate(&self) -> bool {
        self.opts.flate_enabled
    }

    /// Whether this side may carry its dictionary across messages.
    pub(crate) fn flate_context_takeover(&self) -> bool {
        if self.client {
            !self.opts.client_no_context_takeover
        } else {
            !self.opts.server_no_context_takeover
        }
    }

    /// Emit one frame: header, payload, and flush on FIN, all under the
    /// frame lock so nothing can split it on the wire.
    pub(crate) async fn write_frame(
        &self,
        cancel: &CancellationToken,
        fin: bool,
        flate: bool,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<()> {
        let mut ws = self.write.lock(cancel, &self.closed).await?;

        let mask = if self.client {
            Some(generate_mask())
        } else {
            None
        };
        let header = FrameHeader {
            fin,
            rsv1: flate && matches!(opcode, OpCode::Text | OpCode::Binary),
            rsv2: false,
            rsv3: false,
            opcode,
            masked: self.client,
            payload_len: payload.len() as u64,
            mask,
        };

        let WriteState { half, buf } = &mut *ws;
        buf.clear();
        header.encode(buf);
        let payload_start = buf.len();
        buf.extend_from_slice(payload);
        if let Some(key) = mask {
            // The staged bytes are masked in place and then go to the wire
            // untouched.
            apply_mask(&mut buf[payload_start..], key);
        }

        let io = async {
            half.write_all(&buf[..]).await?;
            if fin {
                half.flush().await?;
            }
            Ok::<_, io::Error>(())
        };
        let res = tokio::select! {
            biased;
            _ = self.closed.wait() => Err(self.closed.close_error()),
            _ = cancel.cancelled() => Err(Error::Canceled),
            r = io => r.map_err(|e| Error::io_context("failed to write frame payload", e)),
        };
        match &res {
            // A frame abandoned mid-write leaves the boundary indeterminate;
            // the connection cannot continue.
            Err(Error::Canceled) => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "context canceled"));
            }
            Err(Error::Io(_)) => {
                self.abort(CloseReason::new(CloseReason::ABNORMAL, "write failed"));
            }
            _ => {}
        }
        res
    }

    /// Write a control frame under the hard control deadline.
    pub(crate) async fn write_control(
        &self,
        cancel: &CancellationToken,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<()> {
        debug_assert!(payload.len() <= frame::MAX_CONTROL_PAYLOAD);
        let write = self.write_frame(cancel, true, false, opcode, payload);
        match tokio::time::timeout(CONTROL_TIMEOUT, write).await {
            Ok(res) => res,
            Err(_) => {
                self.abort(CloseReason::new(
                    CloseReason::ABNORMAL,
                    "control frame write timed out",
                ));
                Err(Error::io_context(
                    "failed to write control frame",
                    io::ErrorKind::TimedOut.into(),
                ))
            }
        }
    }

    /// Send a ping and wait for the matching pong.
    ///
    /// The pong is observed by the read path, so a reader must be running
    /// concurrently for this to resolve.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let id = self.ping_counter.fetch_add(1, Ordering::Relaxed);
        let payload = id.to_string().into_bytes();
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(payload.clone(), tx);

        let res = self.wait_for_pong(cancel, &payload, rx).await;
        self.pings.lock().remove(&payload);
        res
    }

    async fn wait_for_pong(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        self.write_control(cancel, OpCode::Ping, payload).await?;
        tokio::select! {
            biased;
            _ = self.closed.wait() => Err(self.closed.close_error()),
            _ = cancel.cancelled() => Err(Error::Canceled),
            r = rx => r.map_err(|_| self.closed.close_error()),
        }
    }

    /// Resolve the waiter for a pong with this payload, if any.
    pub(crate) fn acknowledge_pong(&self, payload: &[u8]) {
        if let Some(tx) = self.pings.lock().remove(payload) {
            let _ = tx.send(());
        }
    }

    /// Close the connection with the given status code and reason.
    ///
    /// The first call writes the close frame and wins; every later call
    /// returns the identical [`Error::Closed`].
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !self
            .closed
            .record_cause(Some(CloseReason::new(code, reason)))
        {
            return Err(self.closed.close_error());
        }
        tracing::debug!(code, reason, "closing connection");
        let payload = frame::encode_close_payload(code, reason);
        let res = self
            .write_control(&CancellationToken::new(), OpCode::Close, &payload)
            .await;
        self.closed.finish();
        res
    }

    /// The close cause, once the connection has closed.
    pub fn close_err(&self) -> Option<Error> {
        if self.closed.is_closed() {
            Some(self.closed.close_error())
        } else {
            None
        }
    }

    /// Record a protocol-level failure, send the close frame for it, and
    /// hand the triggering error back to the caller.
    pub(crate) async fn fail(&self, code: u16, msg: &'static str, err: Error) -> Error {
        if self.closed.record_cause(Some(CloseReason::new(code, msg))) {
            tracing::debug!(code, msg, "failing connection");
            let payload = frame::encode_close_payload(code, msg);
            let _ = self
                .write_control(&CancellationToken::new(), OpCode::Close, &payload)
                .await;
            self.closed.finish();
        }
        err
    }

    /// Tear the connection down without a close frame.
    pub(crate) fn abort(&self, reason: CloseReason) {
        self.closed.record_cause(Some(reason));
        self.closed.finish();
    }
}
