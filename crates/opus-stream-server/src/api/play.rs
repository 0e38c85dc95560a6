//! `/play` WebSocket endpoint.

use std::sync::Arc;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use opus_stream_core::{PeerClose, StreamError};

use crate::api::{ApiError, SESSION_ID_HEADER};
use crate::state::AppState;
use crate::ws::{read_loop, WsConnection};

#[utoipa::path(
    get,
    path = "/play",
    responses(
        (status = 101, description = "Switching to WebSocket; encoded audio follows as binary messages",
            headers(("x-session-id" = String, description = "Id of the session serving this connection"))),
        (status = 400, description = "Not a WebSocket upgrade request"),
        (status = 503, description = "Server is shutting down")
    )
)]
#[get("/play")]
/// Stream the configured asset to a WebSocket client, one binary message per chunk.
pub async fn play_socket(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let open = match state.streamer.open(state.asset.clone()) {
        Ok(open) => open,
        Err(StreamError::ShuttingDown) => {
            return Ok(ApiError::Unavailable("server shutting down".to_string()).into_response());
        }
        Err(err) => return Ok(ApiError::Internal(err.to_string()).into_response()),
    };
    let (mut response, ws, stream) = actix_ws::handle(&req, body)?;

    let session_id = open.session.id();
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    let peer = PeerClose::new();
    let done = open.session.cancel_token().clone();
    tracing::debug!(session_id = %session_id, "play connection accepted");

    actix_web::rt::spawn(read_loop(ws.clone(), stream, peer.clone(), done));
    let conn = Arc::new(WsConnection::new(ws));
    let streamer = state.streamer.clone();
    actix_web::rt::spawn(async move {
        let _ = streamer.run(open, conn, peer).await;
    });

    Ok(response)
}
