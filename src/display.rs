//! What goes on the screen: the stage table and its text formatting.

use serde::{Deserialize, Serialize};

use crate::measure::MeasurementResult;

/// Payload of the `display` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayContent {
    pub headline: String,
    pub subheadline: String,
    pub body: String,
}

impl DisplayContent {
    pub fn new(
        headline: impl Into<String>,
        subheadline: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            headline: headline.into(),
            subheadline: subheadline.into(),
            body: body.into(),
        }
    }
}

/// One screen of the presentation.
#[derive(Debug, Clone, Copy)]
pub struct Stage {
    pub label: &'static str,
    select: fn(&MeasurementResult) -> f64,
    format: fn(f64) -> String,
}

impl Stage {
    pub fn content(&self, measurement: &MeasurementResult) -> DisplayContent {
        DisplayContent::new(
            self.label,
            measurement.server_location.as_str(),
            (self.format)((self.select)(measurement)),
        )
    }
}

/// Stages in presentation order.
pub const STAGES: [Stage; 3] = [
    Stage {
        label: "Ping",
        select: ping_latency,
        format: format_latency,
    },
    Stage {
        label: "Download",
        select: download_bandwidth,
        format: format_bandwidth,
    },
    Stage {
        label: "Upload",
        select: upload_bandwidth,
        format: format_bandwidth,
    },
];

fn ping_latency(m: &MeasurementResult) -> f64 {
    m.ping_latency_ms
}

fn download_bandwidth(m: &MeasurementResult) -> f64 {
    m.download_bytes_per_sec
}

fn upload_bandwidth(m: &MeasurementResult) -> f64 {
    m.upload_bytes_per_sec
}

/// Latency as reported, shortest form (`23.4 ms`, `23 ms`).
///
/// Matches the JavaScript number rendering for magnitudes in `[1e-6, 1e21)`
/// and zero. Outside that range JavaScript switches to exponent notation
/// (`1e-7`) while this keeps plain decimals (`0.0000001`).
pub fn format_latency(ms: f64) -> String {
    format!("{ms} ms")
}

/// Bytes per second rendered as megabits per second with two decimals.
pub fn format_bandwidth(bytes_per_sec: f64) -> String {
    format!("{} mbit/s", fixed_2(bytes_per_sec * 8.0 / 1_000_000.0))
}

/// Two-decimal rendering with exact ties rounded away from zero.
///
/// `{:.2}` already rounds the exact binary value correctly, except that an
/// exact tie goes to the even digit. A double sits exactly on a `.xx5` tie
/// only when it is an odd number of eighths, so that case is rounded in
/// integer hundredths instead.
fn fixed_2(value: f64) -> String {
    let eighths = value * 8.0;
    if eighths.abs() % 2.0 != 1.0 {
        return format!("{value:.2}");
    }
    let eighths = eighths as i64;
    let hundredths = (25 * eighths + eighths.signum()) / 2;
    let sign = if hundredths < 0 { "-" } else { "" };
    let abs = hundredths.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

// ---------------------------------------------------------------------------
// Action reply
// ---------------------------------------------------------------------------

/// Reply body of the `display` action: `{"display": {"status": "..."}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionOutcome {
    pub display: DisplayStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayStatus {
    pub status: String,
}

impl ActionOutcome {
    pub fn is_created(&self) -> bool {
        self.display.status == "created"
    }
}
