use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health::health_check,
        api::play::play_socket,
        api::sessions::sessions_list,
        api::sessions::sessions_close,
    ),
    components(
        schemas(
            opus_stream_types::HealthResponse,
            opus_stream_types::SessionState,
            opus_stream_types::SessionSummary,
            opus_stream_types::SessionsResponse,
            opus_stream_types::CloseSessionResponse,
        )
    ),
    tags(
        (name = "opus-stream-server", description = "Opus WebSocket streaming server")
    )
)]
pub struct ApiDoc;
