//! Per-connection session state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use messenger_common::id::{prefix, prefixed_ulid};
use messenger_common::UserId;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::events::Frame;

/// Opaque metadata about the remote peer, captured at upgrade time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("sessions require an authenticated user")]
    Anonymous,
    #[error("outbound queue is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

/// State for a single authenticated WebSocket connection.
///
/// The outbound sender sits behind a mutex and is taken exactly once by
/// [`Session::close`]. Dropping it ends the write loop, and the `closed`
/// watch wakes the read loop, so teardown is idempotent from either side.
pub struct Session {
    /// Unique connection handle (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Authenticated user ID.
    pub user_id: UserId,
    pub client: ClientInfo,
    pub connected_at: DateTime<Utc>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    closed: watch::Sender<bool>,
    last_seen: Mutex<Instant>,
}

impl Session {
    /// Create a session for an already-authenticated user. Returns the
    /// receiving half of the bounded outbound queue for the write loop.
    pub fn new(
        user_id: UserId,
        client: ClientInfo,
        capacity: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Frame>), SessionError> {
        if user_id <= 0 {
            return Err(SessionError::Anonymous);
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let session = Self {
            connection_id: prefixed_ulid(prefix::CONNECTION),
            user_id,
            client,
            connected_at: Utc::now(),
            outbound: Mutex::new(Some(tx)),
            closed,
            last_seen: Mutex::new(Instant::now()),
        };

        Ok((Arc::new(session), rx))
    }

    /// Queue a frame without waiting. A full queue is reported, not awaited.
    pub fn enqueue(&self, frame: Frame) -> Result<(), SessionError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(SessionError::Closed)?;
        tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SessionError::Full,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Close the outbound queue and signal both loops. Returns `true` only for
    /// the call that actually performed the close.
    pub fn close(&self) -> bool {
        let Some(tx) = self.outbound.lock().take() else {
            return false;
        };
        drop(tx);
        self.closed.send_replace(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Session::close`] has run.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Record inbound activity from the peer.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
