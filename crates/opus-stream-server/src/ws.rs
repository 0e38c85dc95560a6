//! WebSocket adapter between actix-ws and the streaming core.

use actix_web::web::Bytes;
use actix_ws::{CloseReason, Message, MessageStream, Session};
use async_trait::async_trait;
use opus_stream_core::{CloseCode, Connection, ConnectionClosed, PeerClose};
use tokio_util::sync::CancellationToken;

/// Write half of a `/play` socket.
pub struct WsConnection {
    session: Session,
}

impl WsConnection {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_frame(&self, frame: Bytes) -> Result<(), ConnectionClosed> {
        self.session
            .clone()
            .binary(frame)
            .await
            .map_err(|_| ConnectionClosed)
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        let reason = CloseReason {
            code: actix_ws::CloseCode::from(code.as_u16()),
            description: (!reason.is_empty()).then(|| reason.to_string()),
        };
        let _ = self.session.clone().close(Some(reason)).await;
    }
}

/// Peer status implied by a received close frame.
///
/// A close frame without a status is treated as a normal close.
pub fn peer_code(reason: Option<&CloseReason>) -> CloseCode {
    reason
        .map(|r| CloseCode::from_u16(u16::from(r.code)))
        .unwrap_or(CloseCode::Normal)
}

/// Read side of a `/play` socket.
///
/// Answers pings, ignores client payloads and reports how the peer went away
/// through `peer`. Stops once `done` fires.
pub async fn read_loop(
    mut session: Session,
    mut stream: MessageStream,
    peer: PeerClose,
    done: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            () = done.cancelled() => return,
            msg = stream.recv() => msg,
        };
        match msg {
            Some(Ok(Message::Ping(bytes))) => {
                if session.pong(&bytes).await.is_err() {
                    peer.notify(CloseCode::Abnormal);
                    return;
                }
            }
            Some(Ok(Message::Close(reason))) => {
                peer.notify(peer_code(reason.as_ref()));
                let _ = session.close(reason).await;
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::debug!(error = %err, "websocket protocol error");
                peer.notify(CloseCode::Other(1002));
                return;
            }
            None => {
                peer.notify(CloseCode::Abnormal);
                return;
            }
        }
    }
}
