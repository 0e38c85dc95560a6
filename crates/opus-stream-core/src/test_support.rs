//! Fakes shared by the unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;

use crate::connection::{CloseCode, Connection, ConnectionClosed};
use crate::error::StreamError;
use crate::transcoder::{Transcode, TranscodeJob, TranscodeParams};

/// Connection that records frames and closes.
#[derive(Default)]
pub struct MockConnection {
    frames: Mutex<Vec<Bytes>>,
    closes: Mutex<Vec<(CloseCode, String)>>,
    send_delay: Option<Duration>,
    fail_sends: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send stalls for `delay` before completing.
    pub fn stalling(delay: Duration) -> Self {
        Self {
            send_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Every send reports the connection as closed.
    pub fn broken() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn closes(&self) -> Vec<(CloseCode, String)> {
        self.closes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_frame(&self, frame: Bytes) -> Result<(), ConnectionClosed> {
        if self.fail_sends || !self.closes.lock().unwrap().is_empty() {
            return Err(ConnectionClosed);
        }
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        self.closes.lock().unwrap().push((code, reason.to_string()));
    }
}

/// Runs a shell script in place of the encoder and counts launches.
pub struct ScriptTranscoder {
    script: String,
    starts: AtomicUsize,
}

impl ScriptTranscoder {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl Transcode for ScriptTranscoder {
    fn start(&self, _input: &Path, _params: &TranscodeParams) -> Result<TranscodeJob, StreamError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.script);
        TranscodeJob::spawn(cmd)
    }
}
