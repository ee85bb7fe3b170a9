//! Tool Recommender - Main entry point
//!
//! Loads the tool catalog, replays a recorded interaction log and keeps the
//! hybrid models trained.
//!
//! # Modes
//! - `scheduler` (default): run the training scheduler until Ctrl-C
//! - `train-once`: run one full training pass, persist it and exit
//!
//! # Inputs
//! - `TOOLREC_CATALOG_PATH`: JSON array of tool metadata
//! - `TOOLREC_REPLAY_PATH`: interaction records, one JSON object per line

use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tool_recommender::jobs::run_training_scheduler;
use tool_recommender::{
    metrics, EngineConfig, InMemoryCatalog, InteractionRecord, RecommendationEngine, RecordOutcome, ToolMetadata,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq)]
enum RunMode {
    Scheduler,
    TrainOnce,
}

impl RunMode {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();

        for i in 0..args.len() {
            if args[i] == "--mode" && i + 1 < args.len() {
                return match args[i + 1].as_str() {
                    "train-once" => RunMode::TrainOnce,
                    "scheduler" => RunMode::Scheduler,
                    _ => {
                        warn!("Unknown mode '{}', using default 'scheduler'", args[i + 1]);
                        RunMode::Scheduler
                    }
                };
            }
        }

        RunMode::Scheduler
    }
}

fn load_catalog(path: Option<&Path>) -> Result<InMemoryCatalog> {
    let Some(path) = path else {
        warn!("TOOLREC_CATALOG_PATH not set, starting with an empty catalog");
        return Ok(InMemoryCatalog::new());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading catalog {}", path.display()))?;
    let tools: Vec<ToolMetadata> =
        serde_json::from_str(&raw).with_context(|| format!("parsing catalog {}", path.display()))?;
    info!(tools = tools.len(), path = %path.display(), "Catalog loaded");
    Ok(InMemoryCatalog::with_tools(tools))
}

/// Feed a JSON-lines log through the record path; malformed lines are skipped
fn replay_interactions(engine: &RecommendationEngine, path: &Path) -> Result<(usize, usize)> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading replay log {}", path.display()))?;
    let mut accepted = 0;
    let mut rejected = 0;

    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let outcome = serde_json::from_str::<InteractionRecord>(line)
            .map_err(anyhow::Error::from)
            .and_then(|record| engine.record_interaction(record).map_err(anyhow::Error::from));
        match outcome {
            Ok(RecordOutcome::Accepted) => accepted += 1,
            Ok(RecordOutcome::Duplicate) => {}
            Err(e) => {
                rejected += 1;
                warn!(line = line_no + 1, error = %e, "Skipping replayed interaction");
            }
        }
    }

    Ok((accepted, rejected))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tool_recommender=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let mode = RunMode::from_args();
    info!("Starting tool recommender in {:?} mode", mode);

    let config = EngineConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    let registry = prometheus::Registry::new();
    metrics::register(&registry).context("registering metrics")?;

    let catalog_path = env::var_os("TOOLREC_CATALOG_PATH");
    let catalog = load_catalog(catalog_path.as_deref().map(Path::new))?;
    let engine = Arc::new(RecommendationEngine::new(config, Arc::new(catalog))?);

    match engine.restore_snapshot() {
        Ok(true) => info!(version = engine.snapshot().version, "Restored persisted snapshot"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Persisted snapshot unusable, starting untrained"),
    }

    if let Some(path) = env::var_os("TOOLREC_REPLAY_PATH") {
        let (accepted, rejected) = replay_interactions(&engine, Path::new(&path))?;
        info!(accepted, rejected, "Interaction log replayed");
    }

    match mode {
        RunMode::TrainOnce => {
            let result = engine.train(true).await?;
            info!(
                run_id = %result.run_id,
                models_updated = ?result.models_updated,
                data_processed = result.data_processed,
                snapshot_version = result.snapshot_version,
                "Training pass complete"
            );
        }
        RunMode::Scheduler => {
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let scheduler = tokio::spawn(run_training_scheduler(engine.clone(), shutdown_rx));

            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());

            match scheduler.await {
                Ok(stats) => info!(?stats, "Training scheduler stopped"),
                Err(e) => error!(error = %e, "Training scheduler task failed"),
            }
        }
    }

    if engine.persist_snapshot()? {
        info!(version = engine.snapshot().version, "Snapshot persisted");
    }

    let families = registry.gather();
    info!(metric_families = families.len(), "Shutting down");
    Ok(())
}
