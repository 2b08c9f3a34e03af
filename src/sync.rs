//! Context-aware locking and the shared close state.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{CloseReason, Error, Result};

/// A mutex whose acquisition observes a cancellation token and the
/// connection's close broadcast.
///
/// Acquisition races the lock against both signals; once the close
/// broadcast has fired, every new acquisition fails immediately with the
/// close error. Guards are owned so handles can keep the lock across
/// method calls.
#[derive(Debug)]
pub(crate) struct CtxMutex<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> CtxMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub async fn lock(
        &self,
        cancel: &CancellationToken,
        closed: &CloseState,
    ) -> Result<OwnedMutexGuard<T>> {
        if closed.is_closed() {
            return Err(closed.close_error());
        }
        tokio::select! {
            guard = self.inner.clone().lock_owned() => {
                if closed.is_closed() {
                    return Err(closed.close_error());
                }
                Ok(guard)
            }
            _ = cancel.cancelled() => Err(Error::Canceled),
            _ = closed.wait() => Err(closed.close_error()),
        }
    }
}

/// Why and whether the connection is closing.
///
/// Set in two phases, mirroring the close handshake: `record_cause` pins
/// the close cause first (the close frame itself still has to go out over
/// the write path), and `finish` fires the broadcast that fails all
/// waiters and future operations.
#[derive(Debug, Default)]
pub(crate) struct CloseState {
    cause: parking_lot::Mutex<Option<Option<CloseReason>>>,
    token: CancellationToken,
}

impl CloseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the close cause. Returns true if this call was first; later
    /// callers must not write a close frame of their own.
    pub fn record_cause(&self, reason: Option<CloseReason>) -> bool {
        let mut cause = self.cause.lock();
        if cause.is_some() {
            return false;
        }
        *cause = Some(reason);
        true
    }

    /// Fire the close broadcast. Idempotent.
    pub fn finish(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// The error every operation returns once the connection has closed.
    pub fn close_error(&self) -> Error {
        Error::Closed(self.cause.lock().clone().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_respects_cancellation() {
        let mu = CtxMutex::new(());
        let closed = CloseState::new();
        let cancel = CancellationToken::new();

        let held = mu.lock(&cancel, &closed).await.unwrap();

        let waiter = CancellationToken::new();
        waiter.cancel();
        let err = mu.lock(&waiter, &closed).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));

        drop(held);
        assert!(mu.lock(&cancel, &closed).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiters_fail_on_close() {
        let mu = Arc::new(CtxMutex::new(()));
        let closed = Arc::new(CloseState::new());
        let cancel = CancellationToken::new();

        let held = mu.lock(&cancel, &closed).await.unwrap();

        let waiter = {
            let mu = mu.clone();
            let closed = closed.clone();
            tokio::spawn(async move { mu.lock(&CancellationToken::new(), &closed).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        closed.record_cause(Some(CloseReason::new(CloseReason::NORMAL, "done")));
        closed.finish();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed(Some(r)) if r.code == CloseReason::NORMAL));

        // New acquisitions fail immediately, even with the lock free.
        drop(held);
        assert!(mu.lock(&cancel, &closed).await.is_err());
    }

    #[test]
    fn test_first_cause_wins() {
        let closed = CloseState::new();
        assert!(closed.record_cause(Some(CloseReason::new(1000, "first"))));
        assert!(!closed.record_cause(Some(CloseReason::new(1011, "second"))));
        closed.finish();
        closed.finish();

        match closed.close_error() {
            Error::Closed(Some(r)) => assert_eq!(r.reason, "first"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
