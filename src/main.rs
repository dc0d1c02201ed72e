//! Camera service binary.
//!
//! ```bash
//! camera_service serve --port 8765
//! camera_service serve --simulate
//! camera_service check-sdks
//! camera_service show-config
//! ```

use anyhow::Context;
use camera_service::camera::CameraFamily;
use camera_service::config::{ServiceConfig, DEFAULT_CONFIG_PATH};
use camera_service::sdk::{LibraryProbe, SdkAvailability};
use camera_service::server;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "camera_service",
    version,
    about = "Multi-vendor camera control and streaming service"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WebSocket server.
    Serve {
        /// Bind address.
        #[arg(long)]
        host: Option<String>,
        /// Bind port.
        #[arg(long)]
        port: Option<u16>,
        /// Use simulated cameras instead of vendor SDKs.
        #[arg(long)]
        simulate: bool,
    },
    /// Report which vendor SDKs are installed.
    CheckSdks,
    /// Print the effective configuration as TOML.
    ShowConfig,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_sdks(config: &ServiceConfig) {
    let probe = LibraryProbe::new(config.sdk.clone());
    let availability = probe.check_availability();

    println!("Camera SDK availability");
    println!("-----------------------");
    for family in CameraFamily::ALL {
        let available = availability.get(&family).copied().unwrap_or(false);
        let mark = if available { "available" } else { "missing" };
        println!("{family:<10} {mark}");
        match probe.find_library(family) {
            Some(path) => println!("  library: {}", path.display()),
            None => {
                let searched = &config.sdk.paths(family).search_paths;
                for dir in searched {
                    let state = if dir.is_dir() { "" } else { " (not found)" };
                    println!("  searched: {}{state}", dir.display());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.log_json {
        config.logging.json = true;
    }

    match cli.command {
        Commands::Serve { host, port, simulate } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if simulate {
                config.simulator.enabled = true;
            }
            config.validate().context("Invalid command-line overrides")?;

            init_tracing(&config.logging.level, config.logging.json);
            server::serve(&config).await?;
        }
        Commands::CheckSdks => {
            init_tracing(&config.logging.level, config.logging.json);
            check_sdks(&config);
        }
        Commands::ShowConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{rendered}");
        }
    }

    Ok(())
}
