//! External transcoder process adapter.
//!
//! Launches an encoder with its stdout piped so the output can be chunked while
//! the process is still running. The child is killed if the job is dropped.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::StreamError;

/// Output parameters passed to the encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodeParams {
    /// Audio codec identifier (`libopus`).
    pub codec: String,
    /// Container/format identifier (`opus`).
    pub format: String,
    /// Optional target bitrate (`96k`).
    pub bitrate: Option<String>,
}

impl Default for TranscodeParams {
    fn default() -> Self {
        Self {
            codec: "libopus".to_string(),
            format: "opus".to_string(),
            bitrate: None,
        }
    }
}

/// Launches a transcode job for one session.
pub trait Transcode: Send + Sync {
    /// Start encoding `input`. Launch failures are returned immediately.
    fn start(&self, input: &Path, params: &TranscodeParams) -> Result<TranscodeJob, StreamError>;
}

/// ffmpeg-backed transcoder writing the encoded stream to stdout.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Build the encoder argument list.
    pub fn args(input: &Path, params: &TranscodeParams) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_os_string());
        args.push("-vn".into());
        args.push("-c:a".into());
        args.push(params.codec.clone().into());
        if let Some(bitrate) = params.bitrate.as_deref().filter(|b| !b.trim().is_empty()) {
            args.push("-b:a".into());
            args.push(bitrate.trim().into());
        }
        args.push("-f".into());
        args.push(params.format.clone().into());
        args.push("pipe:1".into());
        args
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Transcode for FfmpegTranscoder {
    fn start(&self, input: &Path, params: &TranscodeParams) -> Result<TranscodeJob, StreamError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::args(input, params));
        TranscodeJob::spawn(cmd)
    }
}

/// A running encoder process.
pub struct TranscodeJob {
    program: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_tail: Option<JoinHandle<Option<String>>>,
}

impl TranscodeJob {
    /// Spawn `cmd` with stdout/stderr piped and kill-on-drop enabled.
    pub fn spawn(mut cmd: Command) -> Result<Self, StreamError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| StreamError::TranscoderLaunch {
            program: program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| StreamError::TranscoderLaunch {
            program: program.clone(),
            source: std::io::Error::other("stdout not captured"),
        })?;
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_stderr_tail(stderr, program.clone())));
        tracing::debug!(program = %program, pid = ?child.id(), "transcoder started");
        Ok(Self {
            program,
            child,
            stdout: Some(stdout),
            stderr_tail,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take the encoded output stream. Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait for the process to exit and map a non-zero status to an error.
    pub async fn finish(mut self) -> Result<(), StreamError> {
        drop(self.stdout.take());
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| StreamError::TranscoderRuntime {
                reason: format!("wait failed: {err}"),
            })?;
        let tail = match self.stderr_tail.take() {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };
        if status.success() {
            return Ok(());
        }
        let reason = match tail {
            Some(line) => format!("{status}: {line}"),
            None => status.to_string(),
        };
        Err(StreamError::TranscoderRuntime { reason })
    }

    /// Kill the process and reap it.
    pub async fn kill(mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!(program = %self.program, error = %err, "transcoder kill failed");
        }
        if let Some(handle) = self.stderr_tail.take() {
            handle.abort();
        }
    }
}

impl Drop for TranscodeJob {
    fn drop(&mut self) {
        if let Some(handle) = self.stderr_tail.take() {
            handle.abort();
        }
    }
}

/// Log stderr lines and keep the last non-empty one for error reports.
async fn read_stderr_tail(stderr: ChildStderr, program: String) -> Option<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(program = %program, line, "transcoder stderr");
        last = Some(line.to_string());
    }
    last
}
