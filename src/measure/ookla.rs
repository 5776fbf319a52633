//! Ookla `speedtest` CLI wrapper -- spawn, enforce a timeout, parse JSON lines.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{MeasurementError, MeasurementProvider, MeasurementResult};
use crate::config::SpeedtestConfig;

pub struct OoklaCli {
    binary: String,
    server_id: Option<u32>,
    source_ip: Option<String>,
    accept_license: bool,
    timeout: Duration,
}

impl OoklaCli {
    pub fn from_config(cfg: &SpeedtestConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            server_id: cfg.server_id,
            source_ip: cfg.source_ip.clone(),
            accept_license: cfg.accept_license,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["--format=json".to_string()];
        if self.accept_license {
            args.push("--accept-license".to_string());
            args.push("--accept-gdpr".to_string());
        }
        if let Some(id) = self.server_id {
            args.push(format!("--server-id={id}"));
        }
        if let Some(ip) = &self.source_ip {
            args.push(format!("--ip={ip}"));
        }
        args
    }
}

#[async_trait::async_trait]
impl MeasurementProvider for OoklaCli {
    fn id(&self) -> &'static str {
        "ookla-cli"
    }

    async fn measure(&self) -> Result<MeasurementResult, MeasurementError> {
        info!("Speedtest is running...");
        let args = self.args();
        debug!(binary = %self.binary, ?args, "spawning speed test");

        let child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MeasurementError::NotInstalled {
                    binary: self.binary.clone(),
                },
                _ => MeasurementError::Spawn(e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| MeasurementError::TimedOut {
                secs: self.timeout.as_secs(),
            })?
            .map_err(MeasurementError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            // The CLI reports most failures as a JSON log record on stdout.
            if let Some(msg) = reported_error(&stdout) {
                return Err(MeasurementError::Reported(msg));
            }
            return Err(MeasurementError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let result = parse_output(&stdout)?;
        info!(
            server = %result.server_location,
            ping_ms = result.ping_latency_ms,
            download_bps = result.download_bytes_per_sec,
            upload_bps = result.upload_bytes_per_sec,
            "speed test finished"
        );
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Output format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OoklaResult {
    #[serde(default)]
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    ping: OoklaPing,
    download: OoklaTransfer,
    upload: OoklaTransfer,
    #[serde(rename = "packetLoss", default)]
    packet_loss: Option<f64>,
    #[serde(default)]
    isp: Option<String>,
    server: OoklaServer,
    #[serde(default)]
    result: Option<OoklaShare>,
}

#[derive(Debug, Deserialize)]
struct OoklaPing {
    latency: f64,
    #[serde(default)]
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OoklaTransfer {
    /// Bytes per second.
    bandwidth: f64,
}

#[derive(Debug, Deserialize)]
struct OoklaServer {
    location: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OoklaShare {
    #[serde(default)]
    url: Option<String>,
}

impl From<OoklaResult> for MeasurementResult {
    fn from(r: OoklaResult) -> Self {
        Self {
            ping_latency_ms: r.ping.latency,
            download_bytes_per_sec: r.download.bandwidth,
            upload_bytes_per_sec: r.upload.bandwidth,
            server_location: r.server.location,
            jitter_ms: r.ping.jitter,
            packet_loss_pct: r.packet_loss,
            isp: r.isp,
            server_name: r.server.name,
            result_url: r.result.and_then(|s| s.url),
            timestamp: r.timestamp,
        }
    }
}

fn records(stdout: &str) -> impl Iterator<Item = serde_json::Value> + '_ {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str::<serde_json::Value>(line) {
            Ok(v) if v.is_object() => Some(v),
            _ => {
                debug!(%line, "ignoring non-JSON speed test output");
                None
            }
        })
}

fn reported_error(stdout: &str) -> Option<String> {
    records(stdout)
        .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some("log"))
        .filter(|v| v.get("level").and_then(|l| l.as_str()) == Some("error"))
        .filter_map(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .last()
}

/// Parse the CLI's newline-delimited JSON into a measurement.
pub fn parse_output(stdout: &str) -> Result<MeasurementResult, MeasurementError> {
    let mut last_error = None;
    for record in records(stdout) {
        match record.get("type").and_then(|t| t.as_str()) {
            Some("result") => {
                let parsed: OoklaResult = serde_json::from_value(record)?;
                return Ok(parsed.into());
            }
            Some("log") => {
                let level = record.get("level").and_then(|l| l.as_str()).unwrap_or("info");
                let message = record.get("message").and_then(|m| m.as_str()).unwrap_or_default();
                if level == "error" {
                    last_error = Some(message.to_string());
                } else {
                    warn!(%level, %message, "speed test log");
                }
            }
            _ => {}
        }
    }
    match last_error {
        Some(msg) => Err(MeasurementError::Reported(msg)),
        None => Err(MeasurementError::NoResult),
    }
}
