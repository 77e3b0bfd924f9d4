#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use courier::{Config, Courier, config::find_config_file};

/// Multi-channel notification delivery engine
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version)]
struct Cli {
    /// Configuration file (overrides COURIER_CONFIG and the default paths)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config)?;
    let config = Config::load(&config_path)?;

    if cli.check {
        println!("{}: OK", config_path.display());
        return Ok(());
    }

    Courier::new(config)?.run().await
}
