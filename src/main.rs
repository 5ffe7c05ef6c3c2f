use anyhow::Result;
use clap::Parser;

use respcache::{cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log, settings.debug)?;
    run(settings).await
}
