//! Consumer side of a session: drains the hand-off channel into the connection.

use std::time::Duration;

use opus_stream_types::SessionState;

use crate::chunker::ChunkReceiver;
use crate::connection::{CloseCode, Connection, PeerClose};
use crate::error::StreamError;
use crate::session::Session;

/// What the writer delivered before the channel closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub chunks: u64,
    pub bytes: u64,
}

/// Deliver chunks from `rx` to `conn` until the producer closes the channel.
///
/// Each write is bounded by `write_timeout`; an expired write is abandoned and
/// ends the session. Waiting for the next chunk races peer close and session
/// cancellation, first ready wins. `Ok` means the channel was closed; the
/// producer's own result still has to be checked by the caller.
pub async fn run(
    session: &Session,
    conn: &dyn Connection,
    peer: &PeerClose,
    mut rx: ChunkReceiver,
    write_timeout: Duration,
) -> Result<WriterReport, StreamError> {
    let cancel = session.cancel_token();
    let mut report = WriterReport::default();

    loop {
        let next = tokio::select! {
            biased;
            () = peer.closed() => return Err(termination_cause(session, peer)),
            () = cancel.cancelled() => return Err(termination_cause(session, peer)),
            chunk = rx.recv() => chunk,
        };
        let Some(chunk) = next else {
            return Ok(report);
        };

        let len = chunk.data.len();
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(termination_cause(session, peer)),
            res = tokio::time::timeout(write_timeout, conn.send_frame(chunk.data)) => res,
        };
        match sent {
            Ok(Ok(())) => {
                session.record_delivery(chunk.seq, len);
                report.chunks += 1;
                report.bytes += len as u64;
            }
            Ok(Err(_closed)) => {
                if cancel.is_cancelled() {
                    return Err(termination_cause(session, peer));
                }
                return Err(StreamError::PeerDisconnect {
                    code: peer.code().unwrap_or(CloseCode::Abnormal),
                });
            }
            Err(_elapsed) => {
                tracing::debug!(
                    session_id = %session.id(),
                    seq = chunk.seq,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "chunk write timed out"
                );
                return Err(StreamError::DeliveryTimeout { timeout: write_timeout });
            }
        }
    }
}

/// Explain why a session stopped without the channel closing.
pub(crate) fn termination_cause(session: &Session, peer: &PeerClose) -> StreamError {
    if session.state() == SessionState::ForceClosed {
        return StreamError::ForceClosed;
    }
    match peer.code() {
        Some(code) => StreamError::PeerDisconnect { code },
        None => StreamError::ShuttingDown,
    }
}
