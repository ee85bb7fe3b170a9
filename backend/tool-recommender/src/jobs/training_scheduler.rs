// ============================================
// Training Scheduler
// ============================================
//
// Asks the engine on a fixed interval whether a training pass is due and
// runs it. Failures never stop the loop; repeated failures back off.

use crate::error::RecommendationError;
use crate::services::recommendation::RecommendationEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub passes: u64,
    pub skipped: u64,
    pub failures: u64,
}

/// Run until a shutdown signal arrives; returns what the loop did
pub async fn run_training_scheduler(
    engine: Arc<RecommendationEngine>,
    mut shutdown: broadcast::Receiver<()>,
) -> SchedulerStats {
    let period = Duration::from_secs(engine.config().training.scheduler_interval_secs.max(1));
    let mut timer = interval(period);
    let mut stats = SchedulerStats::default();
    let mut consecutive_failures = 0u32;

    info!(interval_secs = period.as_secs(), "Starting training scheduler");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                stats.ticks += 1;
                match engine.run_due_training().await {
                    Ok(None) => {}
                    Ok(Some(result)) if result.skipped => stats.skipped += 1,
                    Ok(Some(result)) => {
                        stats.passes += 1;
                        if consecutive_failures > 0 {
                            info!(recovered_after = consecutive_failures, "Training recovered after failures");
                            consecutive_failures = 0;
                        }
                        if !result.errors.is_empty() {
                            warn!(run_id = %result.run_id, errors = ?result.errors, "Training pass finished with component errors");
                        }
                    }
                    Err(e) => {
                        stats.failures += 1;
                        consecutive_failures += 1;
                        let timed_out = matches!(e, RecommendationError::TrainingTimeout(_));
                        error!(
                            error = %e,
                            timed_out,
                            consecutive_failures,
                            "Scheduled training failed, will retry on next interval"
                        );

                        if consecutive_failures >= 3 {
                            let backoff_secs = 2u64.pow(consecutive_failures.min(5));
                            info!(backoff_secs, "Applying exponential backoff due to consecutive failures");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                                _ = shutdown.recv() => break,
                            }
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Received shutdown signal, stopping training scheduler");
                break;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{InteractionOutcome, InteractionRecord};
    use crate::store::{InMemoryCatalog, ToolMetadata};
    use chrono::Utc;

    #[tokio::test]
    async fn test_scheduler_trains_then_stops() {
        let catalog = InMemoryCatalog::with_tools(vec![
            ToolMetadata::new("gmail-sender", "email", "send email", &["email"]),
            ToolMetadata::new("slack-sender", "chat", "post chat message", &["chat"]),
        ]);
        let engine = Arc::new(RecommendationEngine::new(EngineConfig::default(), Arc::new(catalog)).unwrap());
        let base = Utc::now() - chrono::Duration::hours(2);
        for i in 0..8 {
            let tool = if i % 2 == 0 { "gmail-sender" } else { "slack-sender" };
            let record = InteractionRecord::new(
                format!("u{}", i % 3),
                tool,
                base + chrono::Duration::minutes(i),
                InteractionOutcome::succeeded(),
            );
            engine.record_interaction(record).unwrap();
        }

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_training_scheduler(engine.clone(), rx));

        // The first tick fires immediately; wait for its pass to publish.
        for _ in 0..200 {
            if engine.snapshot().version > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        let stats = handle.await.unwrap();

        assert!(stats.ticks >= 1);
        assert_eq!(stats.passes, 1);
        assert_eq!(engine.snapshot().version, 1);
    }
}
