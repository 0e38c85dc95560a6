//! Session inspection and force-close handlers.

use actix_web::{get, post, web, HttpResponse, Responder};
use opus_stream_types::{CloseSessionResponse, SessionsResponse};
use uuid::Uuid;

use crate::api::ApiError;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live streaming sessions", body = SessionsResponse)
    )
)]
#[get("/sessions")]
/// List live sessions, oldest first.
pub async fn sessions_list(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.streamer.registry().snapshot())
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/close",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Close request handled", body = CloseSessionResponse),
        (status = 400, description = "Malformed session id"),
        (status = 404, description = "Session not found")
    )
)]
#[post("/sessions/{id}/close")]
/// Force-close a session; its client is disconnected with a policy-violation status.
pub async fn sessions_close(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    let raw = id.into_inner();
    let Ok(session_id) = Uuid::parse_str(raw.trim()) else {
        return ApiError::BadRequest(format!("invalid session id: {raw}")).into_response();
    };
    match state.streamer.force_close(&session_id).await {
        Some(closed) => HttpResponse::Ok().json(CloseSessionResponse {
            id: session_id.to_string(),
            closed,
        }),
        None => ApiError::NotFound("session not found".to_string()).into_response(),
    }
}
