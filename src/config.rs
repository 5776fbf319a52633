//! TOML configuration for speedtest-display.
//!
//! Defaults reproduce the stock deployment: a display Thing reachable over
//! plain HTTP at `192.168.178.27`, addressed without IPv6 brackets, with a
//! ten second dwell per stage. A config file and CLI flags may override
//! any of it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Environment variable read by `--config` when the flag is absent.
pub const CONFIG_ENV: &str = "SPEEDTEST_DISPLAY_CONFIG";

/// Config file consulted when neither `--config` nor [`CONFIG_ENV`] is set.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/speedtest-display/config.toml";

/// Path under which a Thing publishes its description.
pub const WELL_KNOWN_TD_PATH: &str = "/.well-known/wot-thing-description";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub thing: ThingConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub speedtest: SpeedtestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// File this configuration was read from; `None` for built-in defaults.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Resolve the configuration for this process.
    ///
    /// An explicit path (`--config` or [`CONFIG_ENV`]) must load; the system
    /// location is best effort and falls back to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try [`SYSTEM_CONFIG_PATH`], then built-in defaults.
    pub fn load_or_default() -> Self {
        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Thing
// ---------------------------------------------------------------------------

/// Transport used to reach the display Thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Coap,
}

impl Scheme {
    /// URL prefix including the `://` separator.
    pub fn prefix(&self) -> &'static str {
        match self {
            Scheme::Http => "http://",
            Scheme::Coap => "coap://",
        }
    }

    /// Bare scheme name as it appears in a parsed URL.
    pub fn name(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Coap => "coap",
        }
    }

    /// Look up the scheme of a parsed URL, if it is one we speak.
    pub fn from_url(url: &reqwest::Url) -> Option<Self> {
        match url.scheme() {
            "http" => Some(Scheme::Http),
            "coap" => Some(Scheme::Coap),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.trim_end_matches("://") {
            "http" => Ok(Scheme::Http),
            "coap" => Ok(Scheme::Coap),
            other => Err(format!("unsupported protocol '{other}' (expected http or coap)")),
        }
    }
}

/// Where the display Thing lives and how its address is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThingConfig {
    pub protocol: Scheme,
    /// Host or IP literal, without brackets.
    pub address: String,
    /// Wrap `address` in brackets when building URLs.
    pub ipv6: bool,
    /// Per-request timeout for the description fetch and action calls.
    pub request_timeout_secs: u64,
}

impl Default for ThingConfig {
    fn default() -> Self {
        Self {
            protocol: Scheme::Http,
            address: "192.168.178.27".to_string(),
            ipv6: false,
            request_timeout_secs: 10,
        }
    }
}

impl ThingConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    /// The address as it appears in the authority part of a URL.
    pub fn formatted_address(&self) -> String {
        if self.ipv6 {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        }
    }

    /// URL of the Thing Description on the configured device.
    pub fn description_url(&self) -> String {
        format!(
            "{}{}{}",
            self.protocol.prefix(),
            self.formatted_address(),
            WELL_KNOWN_TD_PATH
        )
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

/// Presentation pacing on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// How long each stage stays on screen before the next one is sent.
    pub dwell_ms: u64,
    /// Name of the action invoked for every stage.
    pub action: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            dwell_ms: 10_000,
            action: "display".to_string(),
        }
    }
}

impl DisplayConfig {
    pub fn dwell(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dwell_ms)
    }
}

// ---------------------------------------------------------------------------
// Speedtest
// ---------------------------------------------------------------------------

/// Options passed to the Ookla `speedtest` CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedtestConfig {
    /// Path (or bare command name resolved via `$PATH`) to the CLI.
    pub binary: String,
    /// Pin the test to one server instead of letting the CLI pick.
    pub server_id: Option<u32>,
    /// Source address to bind the test sockets to.
    pub source_ip: Option<String>,
    /// Pass `--accept-license --accept-gdpr` so the CLI never prompts.
    pub accept_license: bool,
    /// Kill the CLI if it has not produced a result by then.
    pub timeout_secs: u64,
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            binary: "speedtest".to_string(),
            server_id: None,
            source_ip: None,
            accept_license: true,
            timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
