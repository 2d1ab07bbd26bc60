//! Headless entry point for the rig.
//!
//! Builds every configured instrument, polls each one at its refresh rate and
//! saves persisted settings on exit.
//!
//! ```bash
//! rig_daq --config config/rig.toml
//! rig_daq --simulate --cycles 20
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tracing::info;

use rig_daq::app::App;
use rig_daq::config::Settings;
use rig_daq::logging;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "rig_daq")]
#[command(about = "Polls and controls the serial instruments of the rig", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use protocol simulators instead of serial ports
    #[arg(long)]
    simulate: bool,

    /// Stop after this many poll cycles instead of waiting for Ctrl-C
    #[arg(long)]
    cycles: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::extract(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("loading configuration from {}", path.display()),
        None => "loading built-in configuration".to_string(),
    })?;
    if cli.simulate {
        settings.application.simulate = true;
    }
    settings.validate()?;

    logging::init(&settings.application.log_level);
    info!("starting {}", settings.application.name);

    let app = App::build(&settings).await?;
    app.run(cli.cycles, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    })
    .await;

    let written = app.save_settings()?;
    info!("saved settings for {} instruments", written);
    Ok(())
}
