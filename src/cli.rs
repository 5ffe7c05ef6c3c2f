use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "respcache", about = "Caching HTTP reverse proxy")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./respcache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging for respcache modules.
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
