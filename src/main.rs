use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use actuator_runtime::config::RuntimeConfig;

/// Drive and servo-axis controller runtime
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON file describing the CAN adapter and the modules to run
    #[arg(short, long)]
    config: PathBuf,

    /// Control loop frequency, overrides the config file
    #[arg(long)]
    loop_hz: Option<u64>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            tracing::Level::INFO.into(),
        ))
        .init();

    let mut config = match RuntimeConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(loop_hz) = args.loop_hz {
        config.loop_hz = loop_hz;
    }
    info!(
        "Loaded {} with {} modules",
        args.config.display(),
        config.modules.len()
    );

    if let Err(e) = actuator_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
