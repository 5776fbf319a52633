//! speedtest-display -- run a network speed test and present the results on
//! a Web of Things display.
//!
//! The run measures throughput with the Ookla CLI while it fetches the
//! display's Thing Description, then shows ping, download and upload one
//! after another.

pub mod config;
pub mod display;
pub mod measure;
pub mod orchestrator;
pub mod thing;

use anyhow::{Context, Result};

use config::AppConfig;
use measure::{MeasurementProvider, MeasurementResult, OoklaCli};
use thing::{ClientRuntime, ThingDescription};

/// Measure, connect to the configured display and show all stages.
pub async fn run(config: &AppConfig) -> Result<()> {
    let provider = OoklaCli::from_config(&config.speedtest);
    let runtime = ClientRuntime::for_thing(&config.thing);
    let url = config.thing.description_url();

    orchestrator::orchestrate(
        &provider,
        &runtime,
        &url,
        &config.display.action,
        config.display.dwell(),
    )
    .await
    .with_context(|| format!("run against {url} failed"))
}

/// Run only the speed test.
pub async fn measure(config: &AppConfig) -> Result<MeasurementResult> {
    let provider = OoklaCli::from_config(&config.speedtest);
    tracing::debug!(provider = provider.id(), "measuring");
    Ok(provider.measure().await?)
}

/// Fetch the configured display's Thing Description.
pub async fn describe(config: &AppConfig) -> Result<ThingDescription> {
    let runtime = ClientRuntime::for_thing(&config.thing);
    let url = config.thing.description_url();
    runtime
        .fetch(&url)
        .await
        .with_context(|| format!("could not fetch thing description from {url}"))
}
