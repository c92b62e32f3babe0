pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Load configuration by merging global, local, and CLI sources.
/// Precedence: CLI > local config > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply).
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    // Layer 1: Global config (~/.config/adversim/adversim.toml or platform equivalent)
    let global = load_global_config();

    // Layer 2: Local config (./adversim.toml, or the --config override)
    let local_path = cli_config_path(cli).unwrap_or_else(|| PathBuf::from("./adversim.toml"));
    let local = load_toml_file(&local_path).unwrap_or_default();

    // Layer 3: CLI args (converted to PartialConfig)
    let cli_partial = cli_to_partial(cli);

    // Merge: CLI > local > global > defaults
    let config = cli_partial
        .with_fallback(local)
        .with_fallback(global)
        .finalize();

    Ok(config)
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(path) => load_toml_file(&path).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns None on file-not-found; logs parse errors.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            match toml::from_str::<ConfigFile>(&contents)
                .context(format!("Failed to parse {}", path.display()))
            {
                Ok(config_file) => {
                    tracing::info!("Loaded config from {}", path.display());
                    Some(config_file.to_partial())
                }
                Err(e) => {
                    tracing::warn!("Config parse error: {:#}", e);
                    None
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read config at {}: {}", path.display(), e);
            None
        }
    }
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/adversim/adversim.toml
/// macOS: ~/Library/Application Support/adversim/adversim.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "adversim")
        .map(|dirs| dirs.config_dir().join("adversim.toml"))
}

/// Extract the config file override from CLI args.
fn cli_config_path(cli: &Cli) -> Option<PathBuf> {
    match &cli.command {
        Commands::Serve { config, .. } => config.clone(),
        Commands::CheckScenarios { config, .. } => config.clone(),
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    match &cli.command {
        Commands::Serve {
            bind,
            heartbeat_interval,
            task_timeout,
            ..
        } => PartialConfig {
            bind: bind.clone(),
            heartbeat_interval_secs: *heartbeat_interval,
            default_task_timeout_secs: *task_timeout,
            ..Default::default()
        },
        Commands::CheckScenarios { .. } => PartialConfig::default(),
    }
}
