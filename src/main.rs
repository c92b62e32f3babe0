use std::sync::Arc;

use clap::Parser;

use adversim::catalog::{InMemoryScenarioStore, PatternSafetyClassifier};
use adversim::cli::{Cli, Commands};
use adversim::config;
use adversim::control::ControlPlane;
use adversim::persist::JsonlSink;
use adversim::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;

    match &cli.command {
        Commands::Serve { scenarios, .. } => {
            let store = match scenarios {
                Some(path) => InMemoryScenarioStore::load_fixture(path)?,
                None => {
                    tracing::warn!("no scenario fixture given; catalog is empty");
                    InMemoryScenarioStore::new()
                }
            };
            let classifier = PatternSafetyClassifier::new(&config.destructive_patterns)?;
            let sink = JsonlSink::new(&config.audit_log_path)?;

            tracing::info!(
                bind = %config.bind,
                heartbeat_secs = config.heartbeat_interval_secs,
                task_timeout_secs = config.default_task_timeout_secs,
                audit_log = %config.audit_log_path.display(),
                "adversim control plane starting"
            );

            let plane = Arc::new(ControlPlane::start(
                &config,
                Arc::new(store),
                Arc::new(classifier),
                Arc::new(sink),
            ));

            tokio::select! {
                result = server::run_server(&config.bind, plane.clone()) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                }
            }
            plane.shutdown();
        }
        Commands::CheckScenarios { file, .. } => {
            let store = InMemoryScenarioStore::load_fixture(file)?;
            let classifier = PatternSafetyClassifier::new(&config.destructive_patterns)?;

            for technique in store.techniques() {
                match classifier.check(&technique.command) {
                    Some(matched) => {
                        println!("{}  DESTRUCTIVE  {}", technique.id, matched.reason)
                    }
                    None => println!("{}  safe", technique.id),
                }
            }
        }
    }

    Ok(())
}
