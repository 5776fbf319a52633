//! Network speed measurement: the provider seam and its normalized result.

pub mod ookla;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ookla::OoklaCli;

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("speed test binary '{binary}' not found (install the Ookla CLI: https://www.speedtest.net/apps/cli)")]
    NotInstalled { binary: String },

    #[error("failed to launch speed test: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("speed test exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("speed test did not finish within {secs}s")]
    TimedOut { secs: u64 },

    #[error("speed test reported an error: {0}")]
    Reported(String),

    #[error("speed test produced no result record")]
    NoResult,

    #[error("malformed speed test result: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One completed speed test.
///
/// Bandwidths are kept in bytes per second as the measurement engine
/// reports them; conversion to Mbit/s happens at presentation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub ping_latency_ms: f64,
    pub download_bytes_per_sec: f64,
    pub upload_bytes_per_sec: f64,
    pub server_location: String,

    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub packet_loss_pct: Option<f64>,
    #[serde(default)]
    pub isp: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl MeasurementResult {
    /// A result carrying only the four values the display needs.
    pub fn new(
        ping_latency_ms: f64,
        download_bytes_per_sec: f64,
        upload_bytes_per_sec: f64,
        server_location: impl Into<String>,
    ) -> Self {
        Self {
            ping_latency_ms,
            download_bytes_per_sec,
            upload_bytes_per_sec,
            server_location: server_location.into(),
            jitter_ms: None,
            packet_loss_pct: None,
            isp: None,
            server_name: None,
            result_url: None,
            timestamp: None,
        }
    }
}

/// Something that can run a speed test.
#[async_trait::async_trait]
pub trait MeasurementProvider: Send + Sync {
    /// Short identifier used in logs.
    fn id(&self) -> &'static str;

    async fn measure(&self) -> Result<MeasurementResult, MeasurementError>;
}
