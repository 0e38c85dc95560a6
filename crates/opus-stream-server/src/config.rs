//! Configuration loading and parsing.
//!
//! Every field is optional; missing values fall back to the defaults below.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use opus_stream_core::config::{AdmissionConfig, StreamConfig};
use opus_stream_core::transcoder::TranscodeParams;
use serde::Deserialize;

pub const DEFAULT_BIND: &str = "127.0.0.1:42069";
pub const DEFAULT_ASSET: &str = "input.wav";
pub const DEFAULT_STATIC_DIR: &str = "static";
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
pub const DEFAULT_TRANSCODER: &str = "ffmpeg";

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// Bind address (host:port).
    pub bind: Option<String>,
    /// Source audio file streamed to clients.
    pub asset: Option<String>,
    /// Directory served at `/`.
    pub static_dir: Option<String>,
    /// How long live sessions may keep running after a shutdown request.
    pub shutdown_grace_ms: Option<u64>,
    pub transcoder: Option<TranscoderConfig>,
    pub stream: Option<StreamSection>,
    pub admission: Option<AdmissionSection>,
}

/// `[transcoder]` section.
#[derive(Debug, Default, Deserialize)]
pub struct TranscoderConfig {
    /// Encoder executable (default: `ffmpeg` from `PATH`).
    pub program: Option<String>,
    /// Audio codec (default: `libopus`).
    pub codec: Option<String>,
    /// Output container (default: `opus`).
    pub format: Option<String>,
    /// Target bitrate, e.g. `96k`.
    pub bitrate: Option<String>,
}

/// `[stream]` section.
#[derive(Debug, Default, Deserialize)]
pub struct StreamSection {
    pub packet_size: Option<usize>,
    pub channel_capacity: Option<usize>,
    pub write_timeout_ms: Option<u64>,
}

/// `[admission]` section.
#[derive(Debug, Default, Deserialize)]
pub struct AdmissionSection {
    pub interval_ms: Option<u64>,
    pub burst: Option<u32>,
    /// Bound on the admission wait; unset waits as long as needed.
    pub timeout_ms: Option<u64>,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Parse the bind address, falling back to [`DEFAULT_BIND`].
pub fn bind_from_config(cfg: &ServerConfig) -> Result<SocketAddr> {
    let bind = cfg.bind.as_deref().unwrap_or(DEFAULT_BIND);
    bind.parse().with_context(|| format!("parse bind {bind}"))
}

pub fn asset_from_config(cfg: &ServerConfig) -> PathBuf {
    PathBuf::from(non_empty(cfg.asset.as_deref()).unwrap_or(DEFAULT_ASSET))
}

pub fn static_dir_from_config(cfg: &ServerConfig) -> PathBuf {
    PathBuf::from(non_empty(cfg.static_dir.as_deref()).unwrap_or(DEFAULT_STATIC_DIR))
}

pub fn shutdown_grace_from_config(cfg: &ServerConfig) -> Duration {
    Duration::from_millis(cfg.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS))
}

/// Encoder program and output parameters.
pub fn transcoder_from_config(cfg: &ServerConfig) -> (PathBuf, TranscodeParams) {
    let section = cfg.transcoder.as_ref();
    let defaults = TranscodeParams::default();
    let program = section
        .and_then(|t| non_empty(t.program.as_deref()))
        .unwrap_or(DEFAULT_TRANSCODER);
    let params = TranscodeParams {
        codec: section
            .and_then(|t| non_empty(t.codec.as_deref()))
            .map(str::to_string)
            .unwrap_or(defaults.codec),
        format: section
            .and_then(|t| non_empty(t.format.as_deref()))
            .map(str::to_string)
            .unwrap_or(defaults.format),
        bitrate: section
            .and_then(|t| non_empty(t.bitrate.as_deref()))
            .map(str::to_string),
    };
    (PathBuf::from(program), params)
}

/// Streaming parameters; zero sizes are rejected.
pub fn stream_from_config(cfg: &ServerConfig) -> Result<StreamConfig> {
    let mut stream = StreamConfig::default();
    let Some(section) = cfg.stream.as_ref() else {
        return Ok(stream);
    };
    if let Some(size) = section.packet_size {
        anyhow::ensure!(size > 0, "stream.packet_size must be greater than 0");
        stream.packet_size = size;
    }
    if let Some(capacity) = section.channel_capacity {
        anyhow::ensure!(capacity > 0, "stream.channel_capacity must be greater than 0");
        stream.channel_capacity = capacity;
    }
    if let Some(ms) = section.write_timeout_ms {
        anyhow::ensure!(ms > 0, "stream.write_timeout_ms must be greater than 0");
        stream.write_timeout = Duration::from_millis(ms);
    }
    Ok(stream)
}

/// Admission limiter parameters.
pub fn admission_from_config(cfg: &ServerConfig) -> Result<AdmissionConfig> {
    let mut admission = AdmissionConfig::default();
    let Some(section) = cfg.admission.as_ref() else {
        return Ok(admission);
    };
    if let Some(ms) = section.interval_ms {
        anyhow::ensure!(ms > 0, "admission.interval_ms must be greater than 0");
        admission.interval = Duration::from_millis(ms);
    }
    if let Some(burst) = section.burst {
        anyhow::ensure!(burst > 0, "admission.burst must be greater than 0");
        admission.burst = burst;
    }
    admission.timeout = section.timeout_ms.map(Duration::from_millis);
    Ok(admission)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
