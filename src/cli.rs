use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "adversim",
    version,
    about = "Breach-and-attack-simulation control plane"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the control plane and listen for agent connections
    Serve {
        /// Address to listen on (e.g., "0.0.0.0:8765")
        #[arg(short, long)]
        bind: Option<String>,

        /// Expected agent heartbeat interval in seconds
        #[arg(long)]
        heartbeat_interval: Option<u64>,

        /// Default per-task result deadline in seconds
        #[arg(long)]
        task_timeout: Option<u64>,

        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Scenario fixture file (TOML) loaded into the in-memory catalog
        #[arg(short, long)]
        scenarios: Option<PathBuf>,
    },
    /// Classify a fixture's techniques as safe or destructive
    CheckScenarios {
        /// Scenario fixture file (TOML)
        file: PathBuf,

        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
