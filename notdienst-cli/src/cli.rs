use anyhow::Context;
use clap::Parser;
use notdienst_core::{Config, Pipeline};

/// Top-level CLI struct. The process takes no arguments; everything comes
/// from the environment (or `.env`) and the optional config file.
#[derive(Debug, Parser)]
#[command(
    name = "notdienst",
    version,
    about = "Publishes the on-duty pharmacy signage page",
    long_about = "Fetches on-duty pharmacies, ranks them by distance and writes a \
                  self-refreshing HTML page.\n\n\
                  Configured through environment variables such as SOURCE, API_URL, \
                  LOCATION, REFERENCE_LAT, REFERENCE_LON, HTML_PAGE and POLL_INTERVAL_SECS."
)]
pub struct Cli {}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let config = Config::load().context("Failed to load configuration")?;
        tracing::info!(source = %config.source, page = %config.html_page.display(), "Configuration loaded");

        let mut pipeline = Pipeline::from_config(&config).context("Failed to set up pipeline")?;

        match config.poll_interval() {
            Some(interval) => {
                tracing::info!(secs = interval.as_secs(), "Polling");
                pipeline.run_forever(interval).await;
            }
            None => {
                // A failed single run is already logged; the exit code only
                // reports configuration faults.
                if let Ok(outcome) = pipeline.run_once().await {
                    tracing::info!(?outcome, "Run finished");
                }
            }
        }

        Ok(())
    }
}
