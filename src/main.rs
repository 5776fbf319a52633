use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use speedtest_display::config::{AppConfig, LoggingConfig, Scheme, CONFIG_ENV};

#[derive(Parser)]
#[command(
    name = "speedtest-display",
    about = "Run a network speed test and show the results on a Web of Things display",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure, then show ping, download and upload on the display
    Run {
        /// Transport to the display: http or coap
        #[arg(long)]
        protocol: Option<Scheme>,

        /// Display host or IP address (without brackets)
        #[arg(long)]
        address: Option<String>,

        /// Write the address in IPv6 bracket notation
        #[arg(long)]
        ipv6: bool,

        /// How long each stage stays on screen, in milliseconds
        #[arg(long)]
        dwell_ms: Option<u64>,
    },

    /// Run only the speed test and print the result
    Measure {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Fetch the display's Thing Description and list its actions
    Describe,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);
    match &config.source {
        Some(path) => tracing::info!(path = %path.display(), "loaded configuration"),
        None => tracing::info!("no config file found, using built-in defaults"),
    }

    match cli.command {
        Commands::Run {
            protocol,
            address,
            ipv6,
            dwell_ms,
        } => {
            if let Some(protocol) = protocol {
                config.thing.protocol = protocol;
            }
            if let Some(address) = address {
                config.thing.address = address;
            }
            if ipv6 {
                config.thing.ipv6 = true;
            }
            if let Some(dwell_ms) = dwell_ms {
                config.display.dwell_ms = dwell_ms;
            }
            tracing::info!(
                protocol = %config.thing.protocol,
                address = %config.thing.formatted_address(),
                dwell_ms = config.display.dwell_ms,
                "Starting speedtest-display run"
            );
            speedtest_display::run(&config).await?;
        }
        Commands::Measure { json } => {
            let result = speedtest_display::measure(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\nSpeed Test Result");
                println!("{:<12} | {}", "Server", result.server_location);
                println!("{:<12} | {} ms", "Ping", result.ping_latency_ms);
                println!(
                    "{:<12} | {}",
                    "Download",
                    speedtest_display::display::format_bandwidth(result.download_bytes_per_sec)
                );
                println!(
                    "{:<12} | {}",
                    "Upload",
                    speedtest_display::display::format_bandwidth(result.upload_bytes_per_sec)
                );
                if let Some(isp) = &result.isp {
                    println!("{:<12} | {}", "ISP", isp);
                }
                if let Some(url) = &result.result_url {
                    println!("{:<12} | {}", "Result", url);
                }
                println!();
            }
        }
        Commands::Describe => {
            let td = speedtest_display::describe(&config).await?;
            println!("\nThing: {}", td.title);
            if let Some(id) = &td.id {
                println!("Id:    {}", id);
            }
            println!("{:<20} | Forms", "Action");
            println!("{:-<20}-|-{:-<40}", "", "");
            for (name, action) in &td.actions {
                let hrefs: Vec<&str> = action.forms.iter().map(|f| f.href.as_str()).collect();
                println!("{:<20} | {}", name, hrefs.join(", "));
            }
            println!();
        }
    }

    Ok(())
}
