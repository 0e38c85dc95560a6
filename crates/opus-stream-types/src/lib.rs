use serde::{Deserialize, Serialize};

/// Lifecycle state of a playback session.
///
/// `Completed`, `Errored`, `Disconnected` and `ForceClosed` are terminal: once a
/// session reaches one of them it never changes state again.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, waiting for an admission token.
    Created,
    /// Admission granted, transcoder not started yet.
    Admitted,
    /// Transcoder running and chunks flowing to the client.
    Streaming,
    /// Transcoder output fully delivered.
    Completed,
    /// Transcoder failure or delivery deadline exceeded.
    Errored,
    /// Client went away or the server shut down.
    Disconnected,
    /// Terminated by an external policy.
    ForceClosed,
}

impl SessionState {
    /// Returns `true` for the four terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Errored
                | SessionState::Disconnected
                | SessionState::ForceClosed
        )
    }
}

/// Snapshot of a live session exposed by the inspection API.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionSummary {
    /// Session id (UUID).
    pub id: String,
    /// Input asset being transcoded.
    pub asset: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Sequence number of the next chunk the writer expects.
    pub next_sequence: u64,
    /// Bytes delivered to the client so far.
    pub bytes_sent: u64,
    /// Milliseconds since the session was created.
    pub age_ms: u64,
}

/// Registry snapshot returned by `GET /sessions`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionsResponse {
    /// Number of currently registered sessions.
    pub active: usize,
    /// Sessions registered since startup.
    pub opened_total: u64,
    /// Sessions deregistered since startup.
    pub closed_total: u64,
    /// Live sessions, oldest first.
    pub sessions: Vec<SessionSummary>,
}

/// Result of an external force-close request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CloseSessionResponse {
    pub id: String,
    /// `false` when the session had already reached a terminal state.
    pub closed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
