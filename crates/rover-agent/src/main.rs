//! rover-agent: runs the rover control process.
//!
//! ```bash
//! # Defaults: frames on 0.0.0.0:8080, actuator at 127.0.0.1:9000
//! rover-agent
//!
//! # Pursue cups using a remote detector, with the operator console on stdin
//! rover-agent --target cup --detector-url http://jetson:5000/detect --operator
//! ```

mod app;
mod operator;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rover_coordination::RoverConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Image server bind host (overrides ROVER_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Image server port (overrides ROVER_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Actuator `host:port` (overrides ROVER_ACTUATOR_ADDR)
    #[arg(long)]
    actuator: Option<String>,

    /// Inference endpoint (overrides ROVER_DETECTOR_URL)
    #[arg(long)]
    detector_url: Option<String>,

    /// Initial pursuit target label (overrides ROVER_TARGET)
    #[arg(long)]
    target: Option<String>,

    /// Read operator commands from stdin
    #[arg(long, default_value_t = false)]
    operator: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut RoverConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(actuator) = &self.actuator {
            config.actuator.address = actuator.clone();
        }
        if let Some(url) = &self.detector_url {
            config.detector.endpoint = Some(url.clone());
        }
        if let Some(target) = &self.target {
            config.pursuit.target = Some(target.trim().to_string()).filter(|t| !t.is_empty());
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        RoverConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        listen = %config.server.bind_addr(),
        actuator = %config.actuator.address,
        detector = config.detector.endpoint.as_deref().unwrap_or("<none>"),
        label = config.pursuit.target.as_deref().unwrap_or("<none>"),
        workers = config.runtime.worker_threads,
        "rover agent starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime.block_on(app::run(config, args.operator));
    // A stdin read may still be parked on a blocking thread.
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}
