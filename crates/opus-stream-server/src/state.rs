//! Shared application state.

use std::sync::Arc;

use opus_stream_core::Streamer;

/// Handed to every handler through `web::Data`.
pub struct AppState {
    pub streamer: Arc<Streamer>,
    /// Asset transcoded for every `/play` connection.
    pub asset: String,
}

impl AppState {
    pub fn new(streamer: Arc<Streamer>, asset: impl Into<String>) -> Self {
        Self {
            streamer,
            asset: asset.into(),
        }
    }
}
