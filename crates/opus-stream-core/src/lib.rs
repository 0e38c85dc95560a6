//! Per-connection audio streaming pipeline.
//!
//! A session is admitted through a process-wide [`limiter::AdmissionLimiter`],
//! launches its own transcoder process, and moves encoded bytes to the client
//! through a bounded hand-off channel:
//!
//! ```text
//! transcoder stdout -> chunker (producer task) -> bounded channel -> writer loop -> connection
//! ```

pub mod chunker;
pub mod config;
pub mod connection;
pub mod error;
pub mod limiter;
pub mod registry;
pub mod session;
pub mod streamer;
pub mod transcoder;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use connection::{CloseCode, Connection, ConnectionClosed, PeerClose};
pub use error::StreamError;
pub use streamer::{OpenSession, Streamer};
pub use opus_stream_types::SessionState;
