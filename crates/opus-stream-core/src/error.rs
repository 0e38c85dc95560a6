use std::time::Duration;

use thiserror::Error;

use crate::connection::CloseCode;

/// Errors that terminate a single streaming session.
///
/// Every variant is local to its session: none of them touch other sessions or
/// the admission limiter.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No admission token could be granted within the bounded wait.
    #[error("admission not granted within {limit:?}")]
    AdmissionTimeout { limit: Duration },

    /// The transcoder process could not be spawned.
    #[error("failed to launch transcoder {program}: {source}")]
    TranscoderLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The transcoder exited unsuccessfully.
    #[error("transcoder failed: {reason}")]
    TranscoderRuntime { reason: String },

    /// Reading the transcoder output failed mid-stream.
    #[error("transcoder output read failed: {0}")]
    TranscoderOutput(#[source] std::io::Error),

    /// A chunk could not be delivered within the per-write deadline.
    #[error("chunk delivery exceeded {timeout:?}")]
    DeliveryTimeout { timeout: Duration },

    /// The client closed or reset the connection.
    #[error("peer disconnected ({code})")]
    PeerDisconnect { code: CloseCode },

    /// An external policy terminated the session.
    #[error("session force-closed")]
    ForceClosed,

    /// The server cancelled the session while shutting down.
    #[error("server shutting down")]
    ShuttingDown,
}

impl StreamError {
    /// Returns `true` for terminations that must not be reported as errors.
    ///
    /// Normal and going-away closes from the client, plus shutdown
    /// cancellation, are clean. Everything else is surfaced.
    pub fn is_clean(&self) -> bool {
        match self {
            StreamError::PeerDisconnect { code } => code.is_clean(),
            StreamError::ShuttingDown => true,
            _ => false,
        }
    }

    /// Returns `true` when the transcoder is at fault.
    pub fn is_transcoder_failure(&self) -> bool {
        matches!(
            self,
            StreamError::TranscoderLaunch { .. }
                | StreamError::TranscoderRuntime { .. }
                | StreamError::TranscoderOutput(_)
        )
    }
}
