//! Drives sessions from admission to teardown.
//!
//! The [`Streamer`] owns the process-wide pieces (admission limiter, session
//! registry, transcoder launcher) and is handed to the HTTP layer by reference.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opus_stream_types::SessionState;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunker::{self, ChunkerStats};
use crate::config::{AdmissionConfig, StreamConfig};
use crate::connection::{CloseCode, Connection, PeerClose};
use crate::error::StreamError;
use crate::limiter::AdmissionLimiter;
use crate::registry::{Registration, SessionRegistry};
use crate::session::{Session, SLOW_CONSUMER_REASON};
use crate::transcoder::{Transcode, TranscodeParams};
use crate::writer;

/// How long cancelled sessions get to tear down once the grace period is over.
const CANCEL_DRAIN: Duration = Duration::from_secs(1);

/// Process-wide streaming service.
pub struct Streamer {
    registry: Arc<SessionRegistry>,
    limiter: Arc<AdmissionLimiter>,
    transcoder: Arc<dyn Transcode>,
    params: TranscodeParams,
    stream: StreamConfig,
    admission_timeout: Option<Duration>,
    shutdown: CancellationToken,
    draining: AtomicBool,
}

/// A registered session waiting for its connection.
pub struct OpenSession {
    pub session: Arc<Session>,
    registration: Registration,
}

impl Streamer {
    pub fn new(
        transcoder: Arc<dyn Transcode>,
        params: TranscodeParams,
        stream: StreamConfig,
        admission: &AdmissionConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            limiter: Arc::new(AdmissionLimiter::from_config(admission)),
            transcoder,
            params,
            stream: stream.normalized(),
            admission_timeout: admission.timeout,
            shutdown: CancellationToken::new(),
            draining: AtomicBool::new(false),
        }
    }

    /// Share an existing limiter instead of the one built from config.
    pub fn with_limiter(mut self, limiter: Arc<AdmissionLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn is_shutting_down(&self) -> bool {
        self.draining.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    /// Create and register a session for `asset`.
    pub fn open(&self, asset: impl Into<String>) -> Result<OpenSession, StreamError> {
        if self.is_shutting_down() {
            return Err(StreamError::ShuttingDown);
        }
        let session = Arc::new(Session::new(asset, &self.shutdown));
        let registration = self
            .registry
            .register(session.clone())
            .ok_or(StreamError::ShuttingDown)?;
        tracing::debug!(session_id = %session.id(), asset = %session.asset(), "session opened");
        Ok(OpenSession {
            session,
            registration,
        })
    }

    /// Open a session for `asset` and stream it to `conn`.
    pub async fn serve(
        &self,
        asset: impl Into<String>,
        conn: Arc<dyn Connection>,
        peer: PeerClose,
    ) -> Result<(), StreamError> {
        let open = match self.open(asset) {
            Ok(open) => open,
            Err(err) => {
                conn.close(CloseCode::GoingAway, "server shutting down").await;
                return Err(err);
            }
        };
        self.run(open, conn, peer).await
    }

    /// Drive an opened session to a terminal state.
    ///
    /// On every exit path the session is cancelled, its producer stopped, the
    /// connection closed and the registry entry removed exactly once.
    pub async fn run(
        &self,
        open: OpenSession,
        conn: Arc<dyn Connection>,
        peer: PeerClose,
    ) -> Result<(), StreamError> {
        let OpenSession {
            session,
            registration,
        } = open;
        let _cancel_on_exit = session.cancel_token().clone().drop_guard();

        let outcome = self.drive(&session, &conn, &peer).await;
        session.cancel_token().cancel();
        let state = session.finish(&outcome);
        session.detach();
        close_for_outcome(conn.as_ref(), &outcome).await;
        log_outcome(&session, state, &outcome, &peer);
        drop(registration);
        outcome
    }

    async fn drive(
        &self,
        session: &Arc<Session>,
        conn: &Arc<dyn Connection>,
        peer: &PeerClose,
    ) -> Result<(), StreamError> {
        if let Err(state) = session.attach(conn.clone()) {
            return Err(error_for_state(state));
        }

        self.admit(session, peer).await?;
        if !session.transition(SessionState::Admitted) {
            return Err(writer::termination_cause(session, peer));
        }

        let job = self
            .transcoder
            .start(Path::new(session.asset()), &self.params)?;
        if !session.transition(SessionState::Streaming) {
            return Err(writer::termination_cause(session, peer));
        }

        let (tx, rx) = chunker::hand_off(self.stream.channel_capacity);
        let producer = ProducerTask(tokio::spawn(chunker::produce(
            job,
            self.stream.packet_size,
            tx,
            session.cancel_token().clone(),
        )));

        let report = writer::run(session, conn.as_ref(), peer, rx, self.stream.write_timeout).await?;
        // The encoder can outlive its stdout; dropping the producer kills it.
        let stats = tokio::select! {
            biased;
            () = peer.closed() => return Err(writer::termination_cause(session, peer)),
            res = producer.join() => res?,
        };
        if stats.cancelled {
            return Err(writer::termination_cause(session, peer));
        }
        tracing::debug!(
            session_id = %session.id(),
            chunks = report.chunks,
            bytes = report.bytes,
            "stream drained"
        );
        Ok(())
    }

    async fn admit(&self, session: &Session, peer: &PeerClose) -> Result<(), StreamError> {
        let acquire = async {
            match self.admission_timeout {
                Some(limit) => self.limiter.acquire_timeout(limit).await,
                None => {
                    self.limiter.acquire().await;
                    Ok(())
                }
            }
        };
        tokio::select! {
            biased;
            () = peer.closed() => Err(writer::termination_cause(session, peer)),
            () = session.cancel_token().cancelled() => Err(writer::termination_cause(session, peer)),
            res = acquire => res,
        }
    }

    /// Force-close the session with `id`. Returns `None` if it is not registered.
    pub async fn force_close(&self, id: &Uuid) -> Option<bool> {
        let session = self.registry.get(id)?;
        Some(session.force_close().await)
    }

    /// Stop accepting sessions, wait up to `grace` for live ones to finish,
    /// then cancel the rest.
    ///
    /// Returns `true` if every session ended on its own within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.draining.store(true, Ordering::Release);
        let active = self.registry.len();
        if active > 0 {
            tracing::info!(active, grace_ms = grace.as_millis() as u64, "waiting for sessions to finish");
        }
        let idle = tokio::time::timeout(grace, self.registry.wait_idle())
            .await
            .is_ok();
        if !idle {
            tracing::warn!(remaining = self.registry.len(), "grace period elapsed, cancelling sessions");
        }
        self.shutdown.cancel();
        if tokio::time::timeout(CANCEL_DRAIN, self.registry.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(remaining = self.registry.len(), "sessions still tearing down");
        }
        idle
    }
}

/// Producer task handle that aborts the task when dropped.
struct ProducerTask(JoinHandle<Result<ChunkerStats, StreamError>>);

impl ProducerTask {
    async fn join(mut self) -> Result<ChunkerStats, StreamError> {
        match (&mut self.0).await {
            Ok(res) => res,
            Err(err) => Err(StreamError::TranscoderRuntime {
                reason: format!("producer task failed: {err}"),
            }),
        }
    }
}

impl Drop for ProducerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn error_for_state(state: SessionState) -> StreamError {
    match state {
        SessionState::ForceClosed => StreamError::ForceClosed,
        _ => StreamError::ShuttingDown,
    }
}

async fn close_for_outcome(conn: &dyn Connection, outcome: &Result<(), StreamError>) {
    match outcome {
        Ok(()) => conn.close(CloseCode::Normal, "").await,
        Err(StreamError::PeerDisconnect { .. }) => {}
        Err(StreamError::ForceClosed | StreamError::DeliveryTimeout { .. }) => {
            conn.close(CloseCode::PolicyViolation, SLOW_CONSUMER_REASON).await
        }
        Err(StreamError::ShuttingDown) => conn.close(CloseCode::GoingAway, "server shutting down").await,
        Err(StreamError::AdmissionTimeout { .. }) => {
            conn.close(CloseCode::Other(1013), "try again later").await
        }
        Err(_) => conn.close(CloseCode::InternalError, "transcoding failed").await,
    }
}

fn log_outcome(
    session: &Session,
    state: SessionState,
    outcome: &Result<(), StreamError>,
    peer: &PeerClose,
) {
    let id = session.id();
    let bytes_sent = session.bytes_sent();
    match outcome {
        Ok(()) => tracing::info!(session_id = %id, bytes_sent, "session completed"),
        Err(err) if is_quiet_end(err, peer) => {
            tracing::info!(session_id = %id, bytes_sent, reason = %err, "session ended")
        }
        Err(err) => {
            tracing::warn!(session_id = %id, bytes_sent, state = ?state, error = %err, "session failed")
        }
    }
}

/// Clean closes, plus a reset the read side saw before any write failed.
fn is_quiet_end(err: &StreamError, peer: &PeerClose) -> bool {
    match err {
        StreamError::PeerDisconnect {
            code: CloseCode::Abnormal,
        } => peer.code() == Some(CloseCode::Abnormal),
        err => err.is_clean(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{MockConnection, ScriptTranscoder};
    use crate::transcoder::FfmpegTranscoder;

    fn streamer_with(transcoder: Arc<dyn Transcode>) -> Streamer {
        Streamer::new(
            transcoder,
            TranscodeParams::default(),
            StreamConfig::default(),
            &AdmissionConfig::default(),
        )
    }

    async fn wait_for_frames(conn: &MockConnection, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.frame_count() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames did not arrive");
    }

    #[tokio::test]
    async fn thousand_bytes_arrive_as_two_chunks() {
        let streamer = streamer_with(Arc::new(ScriptTranscoder::new("head -c 1000 /dev/zero")));
        let conn = Arc::new(MockConnection::new());
        let open = streamer.open("input.wav").unwrap();
        let session = open.session.clone();

        streamer.run(open, conn.clone(), PeerClose::new()).await.unwrap();

        let sizes: Vec<usize> = conn.frames().iter().map(|f| f.len()).collect();
        assert_eq!(sizes, [512, 488]);
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(conn.closes(), [(CloseCode::Normal, String::new())]);
        assert!(streamer.registry().is_empty());
    }

    #[tokio::test]
    async fn transcoder_failure_after_output_is_runtime_error() {
        let streamer = streamer_with(Arc::new(ScriptTranscoder::new(
            "head -c 200 /dev/zero; exit 1",
        )));
        let conn = Arc::new(MockConnection::new());
        let open = streamer.open("input.wav").unwrap();
        let session = open.session.clone();
        assert_eq!(streamer.registry().len(), 1);

        let err = streamer.run(open, conn.clone(), PeerClose::new()).await.unwrap_err();

        assert!(matches!(err, StreamError::TranscoderRuntime { .. }));
        assert_eq!(conn.frames().len(), 1);
        assert_eq!(conn.frames()[0].len(), 200);
        assert_eq!(session.state(), SessionState::Errored);
        assert!(streamer.registry().is_empty());
        assert_eq!(streamer.registry().closed_total(), 1);
    }

    #[tokio::test]
    async fn launch_failure_never_streams() {
        let streamer = streamer_with(Arc::new(FfmpegTranscoder::new("/nonexistent/encoder")));
        let conn = Arc::new(MockConnection::new());

        let err = streamer
            .serve("input.wav", conn.clone(), PeerClose::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::TranscoderLaunch { .. }));
        assert_eq!(conn.frame_count(), 0);
        assert_eq!(conn.closes()[0].0, CloseCode::InternalError);
        assert!(streamer.registry().is_empty());
    }

    #[tokio::test]
    async fn stalled_client_is_dropped_with_policy_violation() {
        let mut stream = StreamConfig::default();
        stream.write_timeout = Duration::from_millis(50);
        let streamer = Streamer::new(
            Arc::new(ScriptTranscoder::new("head -c 4096 /dev/zero")),
            TranscodeParams::default(),
            stream,
            &AdmissionConfig::default(),
        );
        let conn = Arc::new(MockConnection::stalling(Duration::from_secs(30)));

        let err = streamer
            .serve("input.wav", conn.clone(), PeerClose::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::DeliveryTimeout { .. }));
        assert_eq!(
            conn.closes(),
            [(CloseCode::PolicyViolation, SLOW_CONSUMER_REASON.to_string())]
        );
        assert!(streamer.registry().is_empty());
    }

    #[tokio::test]
    async fn peer_going_away_is_clean_disconnect() {
        let streamer = Arc::new(streamer_with(Arc::new(ScriptTranscoder::new("cat /dev/zero"))));
        let conn = Arc::new(MockConnection::new());
        let peer = PeerClose::new();
        let open = streamer.open("input.wav").unwrap();
        let session = open.session.clone();

        let task = tokio::spawn({
            let streamer = streamer.clone();
            let conn = conn.clone();
            let peer = peer.clone();
            async move { streamer.run(open, conn, peer).await }
        });
        wait_for_frames(&conn, 3).await;
        peer.notify(CloseCode::GoingAway);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::PeerDisconnect { code: CloseCode::GoingAway }));
        assert!(err.is_clean());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(conn.closes().is_empty());
        assert!(streamer.registry().is_empty());
    }

    #[test]
    fn peer_reset_is_quiet_but_failed_write_is_not() {
        let reset = StreamError::PeerDisconnect { code: CloseCode::Abnormal };

        let read_side = PeerClose::new();
        read_side.notify(CloseCode::Abnormal);
        assert!(is_quiet_end(&reset, &read_side));

        let unobserved = PeerClose::new();
        assert!(!is_quiet_end(&reset, &unobserved));

        let protocol = PeerClose::new();
        protocol.notify(CloseCode::Other(1002));
        let err = StreamError::PeerDisconnect { code: CloseCode::Other(1002) };
        assert!(!is_quiet_end(&err, &protocol));

        assert!(is_quiet_end(&StreamError::ShuttingDown, &unobserved));
        assert!(!is_quiet_end(&StreamError::ForceClosed, &read_side));
    }

    #[tokio::test]
    async fn peer_close_ends_session_while_encoder_lingers() {
        let streamer = Arc::new(streamer_with(Arc::new(ScriptTranscoder::new(
            "head -c 100 /dev/zero; exec 1>&-; sleep 20",
        ))));
        let conn = Arc::new(MockConnection::new());
        let peer = PeerClose::new();
        let open = streamer.open("input.wav").unwrap();
        let session = open.session.clone();

        let task = tokio::spawn({
            let streamer = streamer.clone();
            let conn = conn.clone();
            let peer = peer.clone();
            async move { streamer.run(open, conn, peer).await }
        });
        wait_for_frames(&conn, 1).await;
        peer.notify(CloseCode::GoingAway);

        let err = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("session ignored peer close")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StreamError::PeerDisconnect { code: CloseCode::GoingAway }));
        assert_eq!(conn.frames()[0].len(), 100);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(streamer.registry().is_empty());
    }

    #[tokio::test]
    async fn concurrent_teardown_triggers_remove_once() {
        for _ in 0..10 {
            let streamer = Arc::new(streamer_with(Arc::new(ScriptTranscoder::new("cat /dev/zero"))));
            let conn = Arc::new(MockConnection::new());
            let peer = PeerClose::new();
            let open = streamer.open("input.wav").unwrap();
            let id = open.session.id();

            let task = tokio::spawn({
                let streamer = streamer.clone();
                let conn = conn.clone();
                let peer = peer.clone();
                async move { streamer.run(open, conn, peer).await }
            });
            wait_for_frames(&conn, 1).await;

            let mut triggers = Vec::new();
            for _ in 0..4 {
                let streamer = streamer.clone();
                triggers.push(tokio::spawn(async move { streamer.force_close(&id).await }));
            }
            peer.notify(CloseCode::Normal);

            let mut forced = 0;
            for trigger in triggers {
                if trigger.await.unwrap() == Some(true) {
                    forced += 1;
                }
            }
            let _ = task.await.unwrap();

            assert!(forced <= 1);
            assert_eq!(streamer.registry().opened_total(), 1);
            assert_eq!(streamer.registry().closed_total(), 1);
            assert!(streamer.registry().is_empty());
        }
    }

    #[tokio::test]
    async fn force_close_before_attach_fails_fast() {
        let transcoder = Arc::new(ScriptTranscoder::new("cat /dev/zero"));
        let streamer = streamer_with(transcoder.clone());
        let open = streamer.open("input.wav").unwrap();
        let session = open.session.clone();
        assert_eq!(streamer.force_close(&session.id()).await, Some(true));

        let conn = Arc::new(MockConnection::new());
        let err = streamer.run(open, conn.clone(), PeerClose::new()).await.unwrap_err();

        assert!(matches!(err, StreamError::ForceClosed));
        assert_eq!(transcoder.starts(), 0);
        assert_eq!(conn.frame_count(), 0);
        assert_eq!(conn.closes()[0].0, CloseCode::PolicyViolation);
        assert_eq!(session.state(), SessionState::ForceClosed);
        assert!(streamer.registry().is_empty());
        assert_eq!(streamer.force_close(&session.id()).await, None);
    }

    #[tokio::test]
    async fn shutdown_cancels_sessions_after_grace() {
        let streamer = Arc::new(streamer_with(Arc::new(ScriptTranscoder::new("cat /dev/zero"))));
        let conn = Arc::new(MockConnection::new());
        let open = streamer.open("input.wav").unwrap();
        let session = open.session.clone();

        let task = tokio::spawn({
            let streamer = streamer.clone();
            let conn = conn.clone();
            async move { streamer.run(open, conn, PeerClose::new()).await }
        });
        wait_for_frames(&conn, 1).await;

        assert!(!streamer.shutdown(Duration::from_millis(50)).await);
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, StreamError::ShuttingDown));
        assert!(err.is_clean());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(conn.closes()[0].0, CloseCode::GoingAway);
        assert!(matches!(streamer.open("next.wav"), Err(StreamError::ShuttingDown)));
    }

    #[tokio::test]
    async fn shutdown_with_no_sessions_is_immediate() {
        let streamer = streamer_with(Arc::new(ScriptTranscoder::new("true")));
        assert!(streamer.shutdown(Duration::from_secs(10)).await);
        assert!(streamer.is_shutting_down());
    }

    #[tokio::test]
    async fn admission_timeout_refuses_session() {
        let admission = AdmissionConfig {
            interval: Duration::from_secs(60),
            burst: 1,
            timeout: Some(Duration::from_millis(10)),
        };
        let transcoder = Arc::new(ScriptTranscoder::new("head -c 10 /dev/zero"));
        let streamer = Streamer::new(
            transcoder.clone(),
            TranscodeParams::default(),
            StreamConfig::default(),
            &admission,
        );

        streamer
            .serve("a.wav", Arc::new(MockConnection::new()), PeerClose::new())
            .await
            .unwrap();

        let open = streamer.open("b.wav").unwrap();
        let session = open.session.clone();
        let err = streamer
            .run(open, Arc::new(MockConnection::new()), PeerClose::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::AdmissionTimeout { .. }));
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(transcoder.starts(), 1);
    }
}
