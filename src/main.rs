use std::path::PathBuf;

use clap::Parser;
use rover_drive_runtime::config::RuntimeConfig;
use rover_drive_runtime::runtime::RuntimeError;
use tracing_subscriber::EnvFilter;

/// Actuation and telemetry runtime for the differential drive rover
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket command port
    #[arg(short, long)]
    port: Option<u16>,

    /// Drive a simulated output instead of hardware
    #[arg(long)]
    sim: bool,

    /// Actuation loop rate
    #[arg(long)]
    update_hz: Option<u32>,

    /// Stop the robot when no motion command arrives for this long
    #[arg(long)]
    cmd_timeout_ms: Option<u64>,

    /// Mirror telemetry onto zenoh
    #[arg(long)]
    zenoh: bool,
}

impl Cli {
    fn into_config(self) -> Result<RuntimeConfig, RuntimeError> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(port) = self.port {
            config.cmd_port = port;
        }
        if let Some(update_hz) = self.update_hz {
            config.update_hz = update_hz;
        }
        if self.cmd_timeout_ms.is_some() {
            config.cmd_timeout_ms = self.cmd_timeout_ms;
        }
        config.simulate |= self.sim;
        config.zenoh_mirror |= self.zenoh;
        Ok(config.sanitized())
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let result = match Cli::parse().into_config() {
        Ok(config) => rover_drive_runtime::runtime::run(config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
