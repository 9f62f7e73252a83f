//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How inbound bytes on the control link are cut into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One socket read is one message. What the existing coordinator speaks.
    #[default]
    Chunk,
    /// Newline-delimited messages, reassembled across reads.
    Line,
}

impl Framing {
    pub fn as_str(self) -> &'static str {
        match self {
            Framing::Chunk => "chunk",
            Framing::Line => "line",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chunk" => Some(Framing::Chunk),
            "line" => Some(Framing::Line),
            _ => None,
        }
    }
}

/// What the acquisition loop does when every save worker is busy and the
/// save queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for queue space; a stop arriving meanwhile drops the pair.
    #[default]
    Block,
    /// Drop the pair immediately.
    Drop,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::Drop => "drop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Some(OverflowPolicy::Block),
            "drop" => Some(OverflowPolicy::Drop),
            _ => None,
        }
    }
}

/// Control link to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Coordinator address, `host:port`.
    /// Default: 192.168.5.2:51000
    pub coordinator: String,

    /// TCP connect timeout in milliseconds.
    /// Default: 5000
    pub connect_timeout_ms: u64,

    /// Inbound message framing.
    /// Default: chunk
    pub framing: Framing,

    /// Treat any untagged message containing `ack` as an ack.
    /// Default: true
    pub lenient_ack: bool,

    /// Send the `stdby`/`stop` timestamps back to the coordinator.
    /// Default: false
    pub reply_timestamps: bool,

    /// Identity string returned for `ack`.
    /// Default: Orbbec_main
    pub identity: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            coordinator: "192.168.5.2:51000".to_string(),
            connect_timeout_ms: 5_000,
            framing: Framing::Chunk,
            lenient_ack: true,
            reply_timestamps: false,
            identity: "Orbbec_main".to_string(),
        }
    }
}

/// Capture session and persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Root that session folders are resolved under.
    /// Default: /docker_disk/dataset
    pub dataset_root: PathBuf,

    /// Bounded wait per frame poll, in milliseconds.
    /// Default: 100
    pub poll_timeout_ms: u64,

    /// Number of save worker threads per session.
    /// Default: 4
    pub save_workers: usize,

    /// Capacity of the queue in front of the save workers.
    /// Default: 8
    pub save_queue: usize,

    /// Policy when the save queue is full.
    /// Default: block
    pub overflow: OverflowPolicy,

    /// Token in a start folder that is replaced by the node role.
    /// Default: --
    pub placeholder: String,

    /// JPEG quality for color frames (1-100).
    /// Default: 90
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("/docker_disk/dataset"),
            poll_timeout_ms: 100,
            save_workers: 4,
            save_queue: 8,
            overflow: OverflowPolicy::Block,
            placeholder: "--".to_string(),
            jpeg_quality: 90,
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log level or `EnvFilter` directive string.
    /// Default: info
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// All infrastructure configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InfraConfig {
    pub link: LinkConfig,
    pub capture: CaptureConfig,
    pub telemetry: TelemetryConfig,
}
