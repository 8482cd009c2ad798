use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "sessiongate",
    about = "HTTP gateway multiplexing clients onto backend session processes"
)]
pub struct Cli {
    /// Path to the runtime configuration file (defaults to ./sessiongate.toml
    /// if present).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
