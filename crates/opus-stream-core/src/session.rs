//! Per-client playback session.
//!
//! All lifecycle changes go through one session-local lock. "Closed" is simply
//! a terminal [`SessionState`], so force-close and connection attach cannot race:
//! attach checks the state under the same lock force-close takes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use opus_stream_types::{SessionState, SessionSummary};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{CloseCode, Connection};
use crate::error::StreamError;

/// Close reason sent to clients dropped by policy.
pub const SLOW_CONSUMER_REASON: &str = "connection too slow to keep up with messages";

struct SessionInner {
    state: SessionState,
    conn: Option<Arc<dyn Connection>>,
}

/// State for one client's playback.
pub struct Session {
    id: Uuid,
    asset: String,
    created_at: Instant,
    inner: Mutex<SessionInner>,
    next_sequence: AtomicU64,
    bytes_sent: AtomicU64,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session whose cancellation is a child of `parent`.
    pub fn new(asset: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset: asset.into(),
            created_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                conn: None,
            }),
            next_sequence: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            cancel: parent.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Fires on force-close, peer disconnect or server shutdown.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Move to `next` unless the session already reached a terminal state.
    ///
    /// Returns `false` when the transition was refused.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        tracing::debug!(session_id = %self.id, from = ?inner.state, to = ?next, "session state");
        inner.state = next;
        true
    }

    /// Attach the client connection.
    ///
    /// Fails with the blocking terminal state if the session was closed first;
    /// the caller owns closing the rejected connection.
    pub fn attach(&self, conn: Arc<dyn Connection>) -> Result<(), SessionState> {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return Err(inner.state);
        }
        inner.conn = Some(conn);
        Ok(())
    }

    /// Drop the connection handle so later force-closes leave it alone.
    pub fn detach(&self) -> Option<Arc<dyn Connection>> {
        self.lock().conn.take()
    }

    /// Terminate the session from outside its own task.
    ///
    /// Marks the session `ForceClosed`, cancels its pipeline and closes an
    /// attached connection with a policy-violation status. Returns `false` if
    /// the session had already ended.
    pub async fn force_close(&self) -> bool {
        let conn = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = SessionState::ForceClosed;
            inner.conn.clone()
        };
        self.cancel.cancel();
        tracing::info!(session_id = %self.id, "session force-closed");
        if let Some(conn) = conn {
            conn.close(CloseCode::PolicyViolation, SLOW_CONSUMER_REASON).await;
        }
        true
    }

    /// Settle the terminal state for `outcome` and return it.
    ///
    /// A state that is already terminal (for example after a force-close) wins.
    pub fn finish(&self, outcome: &Result<(), StreamError>) -> SessionState {
        let mut inner = self.lock();
        if !inner.state.is_terminal() {
            inner.state = terminal_state(outcome);
        }
        inner.state
    }

    pub(crate) fn record_delivery(&self, seq: u64, len: usize) {
        self.next_sequence.store(seq + 1, Ordering::Release);
        self.bytes_sent.fetch_add(len as u64, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.to_string(),
            asset: self.asset.clone(),
            state: self.state(),
            next_sequence: self.next_sequence(),
            bytes_sent: self.bytes_sent(),
            age_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("asset", &self.asset)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Terminal state reached for a session outcome.
pub fn terminal_state(outcome: &Result<(), StreamError>) -> SessionState {
    match outcome {
        Ok(()) => SessionState::Completed,
        Err(StreamError::PeerDisconnect { .. } | StreamError::ShuttingDown) => {
            SessionState::Disconnected
        }
        Err(StreamError::ForceClosed) => SessionState::ForceClosed,
        Err(_) => SessionState::Errored,
    }
}
