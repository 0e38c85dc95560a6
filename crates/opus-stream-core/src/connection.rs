//! Client connection seam.
//!
//! The HTTP layer owns the actual socket. The core only needs to push binary
//! frames, close with a status, and learn when the peer went away.

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// WebSocket-style close status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1006, connection dropped without a close frame.
    Abnormal,
    /// 1008, used by the core to drop slow consumers.
    PolicyViolation,
    /// 1011
    InternalError,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Abnormal => 1006,
            CloseCode::PolicyViolation => 1008,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1006 => CloseCode::Abnormal,
            1008 => CloseCode::PolicyViolation,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }

    /// Normal and going-away closes are not errors.
    pub fn is_clean(self) -> bool {
        matches!(self, CloseCode::Normal | CloseCode::GoingAway)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseCode::Normal => "normal",
            CloseCode::GoingAway => "going away",
            CloseCode::Abnormal => "abnormal",
            CloseCode::PolicyViolation => "policy violation",
            CloseCode::InternalError => "internal error",
            CloseCode::Other(_) => "other",
        };
        write!(f, "{} {label}", self.as_u16())
    }
}

/// Returned by [`Connection::send_frame`] once the connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionClosed;

impl fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection closed")
    }
}

impl std::error::Error for ConnectionClosed {}

/// Write half of a client connection.
///
/// Implementations must tolerate `close` being called more than once and
/// concurrently with an in-flight `send_frame`.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Deliver one chunk as a single binary frame.
    async fn send_frame(&self, frame: Bytes) -> Result<(), ConnectionClosed>;
    /// Close the connection with a status and short reason.
    async fn close(&self, code: CloseCode, reason: &str);
}

/// Read-side close signal for one connection.
///
/// The HTTP layer calls [`PeerClose::notify`] when it sees a close frame or the
/// stream ends; the writer loop waits on [`PeerClose::closed`].
#[derive(Clone, Debug, Default)]
pub struct PeerClose {
    token: CancellationToken,
    code: Arc<OnceLock<CloseCode>>,
}

impl PeerClose {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first observed close status and wake waiters.
    pub fn notify(&self, code: CloseCode) {
        let _ = self.code.set(code);
        self.token.cancel();
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close status reported by the peer, if it has gone away.
    pub fn code(&self) -> Option<CloseCode> {
        self.code.get().copied()
    }
}
