// ============================================
// Training Orchestrator
// ============================================
//
// Decides when to retrain and publishes new snapshots without disturbing
// serving:
//   Idle → Training → Publishing → Idle
//
// Each pass builds a fresh working copy from the interaction log on a
// blocking thread, bounded by `max_training_duration`. Components train
// independently; a failed component keeps its previous version.

pub mod dataset;
pub mod snapshot;

pub use dataset::{Holdout, TrainingSet};
pub use snapshot::{ModelSnapshot, SnapshotHandle};

use crate::config::EngineConfig;
use crate::error::{RecommendationError, Result};
use crate::metrics;
use crate::models::{ComponentScores, ToolId};
use crate::services::monitoring::{EvaluationReport, Evaluator, PerformanceMonitor, RELEVANCE_THRESHOLD};
use crate::services::recommendation::{
    CollaborativeFilteringModel, Component, ContentBasedModel, EnsembleMethod, HybridRanker, HybridWeights,
    SequentialModel, StackingModel,
};
use crate::store::{InteractionStore, ProfileStore, Sequence};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on records used to fit the stacking meta-model
const MAX_STACKING_SAMPLES: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingMode {
    /// Retrain every component on the whole log
    Full,
    /// Fold in records past each component's watermark
    Incremental,
    /// Incremental for collaborative and sequential only
    Lightweight,
}

impl TrainingMode {
    pub fn name(self) -> &'static str {
        match self {
            TrainingMode::Full => "full",
            TrainingMode::Incremental => "incremental",
            TrainingMode::Lightweight => "lightweight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingState {
    Idle,
    Training,
    Publishing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    pub run_id: Uuid,
    pub mode: TrainingMode,
    pub models_updated: Vec<Component>,
    /// Component NDCG@k after minus before
    pub performance_delta: BTreeMap<Component, f64>,
    pub duration: Duration,
    pub data_processed: usize,
    pub errors: BTreeMap<Component, String>,
    pub snapshot_version: u64,
    pub skipped: bool,
}

impl TrainingResult {
    fn empty(run_id: Uuid, mode: TrainingMode, snapshot_version: u64) -> Self {
        Self {
            run_id,
            mode,
            models_updated: Vec::new(),
            performance_delta: BTreeMap::new(),
            duration: Duration::ZERO,
            data_processed: 0,
            errors: BTreeMap::new(),
            snapshot_version,
            skipped: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub trained: bool,
    pub trained_through: Sequence,
    pub trained_at: Option<DateTime<Utc>>,
    /// Log records the component has not seen yet
    pub lag: u64,
    pub training_rmse: Option<f64>,
    pub last_error: Option<String>,
}

/// Returns the state machine to Idle however the pass ends
struct StateGuard<'a> {
    state: &'a Mutex<TrainingState>,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = TrainingState::Idle;
    }
}

pub struct TrainingOrchestrator {
    config: EngineConfig,
    interactions: Arc<InteractionStore>,
    profiles: Arc<ProfileStore>,
    snapshots: Arc<SnapshotHandle>,
    monitor: Arc<PerformanceMonitor>,
    ranker: HybridRanker,
    state: Mutex<TrainingState>,
    last_full: Mutex<Option<DateTime<Utc>>>,
    last_errors: Mutex<BTreeMap<Component, String>>,
}

impl TrainingOrchestrator {
    pub fn new(
        config: EngineConfig,
        interactions: Arc<InteractionStore>,
        profiles: Arc<ProfileStore>,
        snapshots: Arc<SnapshotHandle>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Result<Self> {
        let ranker = HybridRanker::new(config.hybrid.clone(), &config.collaborative)?;
        Ok(Self {
            config,
            interactions,
            profiles,
            snapshots,
            monitor,
            ranker,
            state: Mutex::new(TrainingState::Idle),
            last_full: Mutex::new(None),
            last_errors: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn state(&self) -> TrainingState {
        *self.state.lock()
    }

    fn try_begin(&self) -> Option<StateGuard<'_>> {
        let mut state = self.state.lock();
        if *state != TrainingState::Idle {
            return None;
        }
        *state = TrainingState::Training;
        Some(StateGuard { state: &self.state })
    }

    /// Mode the scheduler should run now, if any
    pub fn due_mode(&self) -> Option<TrainingMode> {
        let end = self.interactions.len();
        if end == 0 {
            return None;
        }
        let snapshot = self.snapshots.load();

        let last_full = (*self.last_full.lock()).or_else(|| snapshot.has_models().then_some(snapshot.trained_at));
        let full_due = match last_full {
            None => true,
            Some(at) => {
                let elapsed = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.config.training.model_update_frequency()
            }
        };
        if full_due {
            return Some(TrainingMode::Full);
        }

        let pending = self.interactions.pending_since(snapshot.min_trained_through());
        if pending > self.config.training.batch_size {
            return Some(TrainingMode::Incremental);
        }
        None
    }

    /// Whether the record path should kick off a lightweight pass
    pub fn lightweight_due(&self) -> bool {
        if !self.config.training.lightweight_updates || self.state() != TrainingState::Idle {
            return false;
        }
        let snapshot = self.snapshots.load();
        if !snapshot.has_models() {
            return false;
        }
        self.interactions.pending_since(snapshot.cutoff) >= self.config.training.lightweight_threshold()
    }

    pub fn health(&self) -> BTreeMap<Component, ComponentHealth> {
        let snapshot = self.snapshots.load();
        let end = self.interactions.len();
        let errors = self.last_errors.lock().clone();

        Component::ALL
            .into_iter()
            .map(|c| {
                let metadata = match c {
                    Component::Collaborative => snapshot.collaborative.as_ref().map(|m| &m.metadata),
                    Component::Content => snapshot.content.as_ref().map(|m| &m.metadata),
                    Component::Sequential => snapshot.sequential.as_ref().map(|m| &m.metadata),
                };
                let health = ComponentHealth {
                    trained: metadata.is_some(),
                    trained_through: metadata.map_or(0, |m| m.trained_through),
                    trained_at: metadata.and_then(|m| m.trained_at),
                    lag: end.saturating_sub(metadata.map_or(0, |m| m.trained_through)),
                    training_rmse: metadata.filter(|_| c == Component::Collaborative).map(|m| m.training_rmse),
                    last_error: errors.get(&c).cloned(),
                };
                (c, health)
            })
            .collect()
    }

    /// Run one pass. A pass already in flight makes this a skipped no-op.
    pub async fn run(&self, mode: TrainingMode) -> Result<TrainingResult> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();

        let Some(_guard) = self.try_begin() else {
            debug!(%run_id, mode = mode.name(), "Training already in progress, skipping");
            let mut result = TrainingResult::empty(run_id, mode, self.snapshots.version());
            result.skipped = true;
            return Ok(result);
        };

        let current = self.snapshots.load();
        let end = self.interactions.len();
        let first_pending = match mode {
            TrainingMode::Full => 0,
            TrainingMode::Incremental => current.min_trained_through(),
            TrainingMode::Lightweight => current.cutoff,
        };
        let pending = end.saturating_sub(first_pending) as usize;
        if pending == 0 {
            debug!(%run_id, mode = mode.name(), "Nothing to train on");
            let mut result = TrainingResult::empty(run_id, mode, current.version);
            result.duration = started.elapsed();
            return Ok(result);
        }

        info!(%run_id, mode = mode.name(), pending, log_len = end, "Training started");

        let data = TrainingSet::new(
            self.interactions.range(0, end),
            self.profiles.tool_profiles(),
            self.profiles.segments(),
            end,
        );
        let cancel = Arc::new(AtomicBool::new(false));
        let job = TrainingJob {
            mode,
            data,
            previous: current.clone(),
            config: self.config.clone(),
            ranker: self.ranker.clone(),
            profiles: self.profiles.clone(),
            cancel: cancel.clone(),
        };

        let limit = self.config.training.max_training_duration();
        let mut handle = tokio::task::spawn_blocking(move || job.execute());
        let built = match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined??,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                // The guard stays held until the worker has seen the flag
                let _ = handle.await;
                warn!(%run_id, mode = mode.name(), limit_secs = limit.as_secs(), "Training timed out, working copy discarded");
                metrics::record_training(mode.name(), "timeout", started.elapsed());
                return Err(RecommendationError::TrainingTimeout(limit));
            }
        };

        {
            let mut last_errors = self.last_errors.lock();
            for c in &built.updated {
                last_errors.remove(c);
            }
            last_errors.extend(built.errors.clone());
        }
        if mode == TrainingMode::Full {
            *self.last_full.lock() = Some(Utc::now());
        }

        let mut result = TrainingResult {
            run_id,
            mode,
            models_updated: built.updated.clone(),
            performance_delta: built.performance_delta.clone(),
            duration: Duration::ZERO,
            data_processed: pending,
            errors: built.errors.clone(),
            snapshot_version: current.version,
            skipped: false,
        };

        if built.updated.is_empty() {
            warn!(%run_id, errors = ?result.errors, "No component updated, keeping current snapshot");
        } else {
            *self.state.lock() = TrainingState::Publishing;
            let published = self.snapshots.publish(built.snapshot);
            result.snapshot_version = published.version;

            self.monitor.record(
                published.version,
                &built.evaluation,
                built
                    .component_ndcg
                    .iter()
                    .map(|(c, v)| (c.name().to_string(), *v))
                    .collect(),
            );
            metrics::set_snapshot(published.version, built.evaluation.ndcg_at_k);

            if let Some(path) = &self.config.snapshot_path {
                if let Err(e) = published.save_to(path) {
                    warn!(error = %e, path = %path.display(), "Failed to persist snapshot");
                }
            }
        }

        result.duration = started.elapsed();
        let status = if result.errors.is_empty() { "success" } else { "partial" };
        metrics::record_training(mode.name(), status, result.duration);
        info!(
            %run_id,
            mode = mode.name(),
            models_updated = ?result.models_updated,
            data_processed = result.data_processed,
            snapshot_version = result.snapshot_version,
            duration_ms = result.duration.as_millis() as u64,
            "Training finished"
        );

        Ok(result)
    }
}

/// Working copy produced on the blocking pool
struct BuiltSnapshot {
    snapshot: ModelSnapshot,
    updated: Vec<Component>,
    errors: BTreeMap<Component, String>,
    evaluation: EvaluationReport,
    component_ndcg: BTreeMap<Component, f64>,
    performance_delta: BTreeMap<Component, f64>,
}

struct TrainingJob {
    mode: TrainingMode,
    data: TrainingSet,
    previous: Arc<ModelSnapshot>,
    config: EngineConfig,
    ranker: HybridRanker,
    profiles: Arc<ProfileStore>,
    cancel: Arc<AtomicBool>,
}

impl TrainingJob {
    fn execute(self) -> Result<BuiltSnapshot> {
        let holdout = self.data.holdout(self.config.training.holdout_fraction);
        let visible = self.data.without(&holdout);
        let fit_on = if self.mode == TrainingMode::Full && self.config.training.exclude_holdout_from_training {
            &visible
        } else {
            &self.data
        };

        let mut updated = Vec::new();
        let mut errors = BTreeMap::new();
        let prev = &self.previous;

        let collaborative = self.isolate(Component::Collaborative, &mut updated, &mut errors, || {
            self.train_collaborative(fit_on)
        });
        let content = if self.mode == TrainingMode::Lightweight {
            None
        } else {
            self.isolate(Component::Content, &mut updated, &mut errors, || self.train_content(fit_on))
        };
        let sequential = self.isolate(Component::Sequential, &mut updated, &mut errors, || {
            self.train_sequential(fit_on)
        });

        if self.cancel.load(Ordering::Relaxed) {
            return Err(RecommendationError::Internal("training cancelled".to_string()));
        }

        let mut snapshot = ModelSnapshot {
            version: prev.version + 1,
            trained_at: Utc::now(),
            cutoff: self.data.through,
            collaborative: collaborative.or_else(|| prev.collaborative.clone()),
            content: content.or_else(|| prev.content.clone()),
            sequential: sequential.or_else(|| prev.sequential.clone()),
            weights: HybridWeights::from_config(&self.config.hybrid),
            stacking: prev.stacking.clone(),
        };
        if self.mode == TrainingMode::Full {
            snapshot.stacking = self.train_stacking(&snapshot, fit_on);
        }
        snapshot.consistency_check()?;

        let evaluator = Evaluator {
            ranker: &self.ranker,
            profiles: &self.profiles,
            profile_config: &self.config.profile,
            method: self.config.hybrid.ensemble_method,
            k: self.config.monitor.k,
        };
        let evaluation = evaluator.evaluate(&snapshot, &visible, &holdout);

        let component_evaluator = Evaluator {
            method: EnsembleMethod::Weighted,
            ..evaluator
        };
        let mut component_ndcg = BTreeMap::new();
        let mut performance_delta = BTreeMap::new();
        for c in Component::ALL {
            let after = component_evaluator.evaluate(&snapshot.only(c), &visible, &holdout).ndcg_at_k;
            component_ndcg.insert(c, after);
            if updated.contains(&c) {
                let before = component_evaluator.evaluate(&prev.only(c), &visible, &holdout).ndcg_at_k;
                performance_delta.insert(c, after - before);
            }
        }

        Ok(BuiltSnapshot {
            snapshot,
            updated,
            errors,
            evaluation,
            component_ndcg,
            performance_delta,
        })
    }

    /// `Ok(None)` means the component had nothing new and was left as is
    fn isolate<M>(
        &self,
        component: Component,
        updated: &mut Vec<Component>,
        errors: &mut BTreeMap<Component, String>,
        train: impl FnOnce() -> Result<Option<M>>,
    ) -> Option<M> {
        match train() {
            Ok(Some(model)) => {
                updated.push(component);
                Some(model)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(component = component.name(), error = %e, "Component training failed, keeping previous version");
                errors.insert(component, e.to_string());
                None
            }
        }
    }

    fn rebuild(&self, watermark: Option<Sequence>) -> bool {
        self.mode == TrainingMode::Full || watermark.is_none()
    }

    fn train_collaborative(&self, data: &TrainingSet) -> Result<Option<CollaborativeFilteringModel>> {
        let config = &self.config.collaborative;
        match &self.previous.collaborative {
            Some(prev) if !self.rebuild(Some(prev.metadata.trained_through)) => {
                let batch: Vec<_> = self.data.since(prev.metadata.trained_through).collect();
                if batch.is_empty() {
                    return Ok(None);
                }
                let mut model = prev.clone();
                model.update_incremental(&batch, &self.data.segments, config, self.data.through, &self.cancel)?;
                Ok(Some(model))
            }
            _ => CollaborativeFilteringModel::train(data, config, &self.cancel).map(Some),
        }
    }

    fn train_content(&self, data: &TrainingSet) -> Result<Option<ContentBasedModel>> {
        match &self.previous.content {
            Some(prev) if !self.rebuild(Some(prev.metadata.trained_through)) => {
                let touched: HashSet<&str> = self
                    .data
                    .since(prev.metadata.trained_through)
                    .map(|r| r.user_id.as_str())
                    .collect();
                if touched.is_empty() {
                    return Ok(None);
                }
                let mut model = prev.clone();
                model.refresh(&self.data, &touched, self.data.through, &self.cancel)?;
                Ok(Some(model))
            }
            _ => ContentBasedModel::train(data, &self.config.content, &self.cancel).map(Some),
        }
    }

    fn train_sequential(&self, data: &TrainingSet) -> Result<Option<SequentialModel>> {
        match &self.previous.sequential {
            Some(prev) if !self.rebuild(Some(prev.metadata.trained_through)) => {
                let watermark = prev.metadata.trained_through;
                if self.data.since(watermark).next().is_none() {
                    return Ok(None);
                }
                let mut model = prev.clone();
                model.update_incremental(&self.data, watermark, self.data.through, &self.cancel)?;
                Ok(Some(model))
            }
            _ => SequentialModel::train(data, &self.config.sequential, &self.cancel).map(Some),
        }
    }

    /// Fit the meta-model on the most recent records, scoring each with
    /// the history that preceded it
    fn train_stacking(&self, snapshot: &ModelSnapshot, data: &TrainingSet) -> Option<StackingModel> {
        let min = self.config.collaborative.min_interactions;
        let window = self.config.profile.recent_window;
        let mut samples = Vec::new();

        for history in data.by_user().values() {
            for (i, logged) in history.iter().enumerate() {
                let record = &logged.record;
                let recent: Vec<ToolId> = history[i.saturating_sub(window)..i]
                    .iter()
                    .map(|l| l.record.tool_id.clone())
                    .collect();
                let scores = ComponentScores {
                    collaborative: snapshot
                        .collaborative
                        .as_ref()
                        .and_then(|m| m.score(&record.user_id, &record.tool_id, min)),
                    content: snapshot.content.as_ref().and_then(|m| {
                        m.user_vector(&record.user_id, &recent)
                            .and_then(|v| m.score(&v, &record.tool_id))
                    }),
                    sequential: snapshot
                        .sequential
                        .as_ref()
                        .and_then(|m| m.score(&record.tool_id, &recent, record.context.workflow_stage)),
                    fallback: None,
                };
                let label = if record.normalized_signal() >= RELEVANCE_THRESHOLD { 1.0 } else { 0.0 };
                samples.push((logged.seq, StackingModel::features(&scores, &record.context), label));
            }
        }

        samples.sort_by(|a, b| b.0.cmp(&a.0));
        samples.truncate(MAX_STACKING_SAMPLES);
        let samples: Vec<(Vec<f64>, f64)> = samples.into_iter().map(|(_, f, l)| (f, l)).collect();

        let model = StackingModel::train(
            &samples,
            self.config.hybrid.stacking_epochs,
            self.config.hybrid.stacking_learning_rate,
        );
        if let Some(m) = &model {
            debug!(samples = m.samples, "Stacking model trained");
        }
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::models::{InteractionOutcome, InteractionRecord};
    use crate::store::{InMemoryCatalog, ToolMetadata};

    struct Fixture {
        orchestrator: Arc<TrainingOrchestrator>,
        interactions: Arc<InteractionStore>,
        profiles: Arc<ProfileStore>,
        snapshots: Arc<SnapshotHandle>,
        catalog: InMemoryCatalog,
        config: EngineConfig,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let interactions = Arc::new(InteractionStore::new());
        let profiles = Arc::new(ProfileStore::new());
        let snapshots = Arc::new(SnapshotHandle::new(ModelSnapshot::empty(HybridWeights::from_config(
            &config.hybrid,
        ))));
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::default()));
        let catalog = InMemoryCatalog::with_tools(vec![
            ToolMetadata::new("gmail-sender", "email", "send email messages", &["email", "send"]),
            ToolMetadata::new("slack-sender", "chat", "post chat messages", &["chat", "send"]),
            ToolMetadata::new("sheets-exporter", "spreadsheet", "export rows to sheets", &["export"]),
        ]);
        profiles.seed_from_catalog(&catalog);
        let orchestrator = Arc::new(
            TrainingOrchestrator::new(
                config.clone(),
                interactions.clone(),
                profiles.clone(),
                snapshots.clone(),
                monitor,
            )
            .unwrap(),
        );
        Fixture {
            orchestrator,
            interactions,
            profiles,
            snapshots,
            catalog,
            config,
        }
    }

    impl Fixture {
        fn record(&self, user: &str, tool: &str, minutes: i64) {
            let base = DateTime::parse_from_rfc3339("2026-01-05T09:00:00Z").unwrap().with_timezone(&Utc);
            let record = InteractionRecord::new(
                user,
                tool,
                base + chrono::Duration::minutes(minutes),
                InteractionOutcome::succeeded(),
            )
            .with_rating(4);
            self.profiles.apply(&record, &self.catalog, &self.config.profile);
            self.interactions.append(record);
        }

        fn seed(&self, n: i64) {
            let tools = ["gmail-sender", "slack-sender", "sheets-exporter"];
            for i in 0..n {
                let user = format!("u{}", i % 4);
                self.record(&user, tools[(i % 3) as usize], i);
            }
        }
    }

    #[tokio::test]
    async fn test_empty_log_processes_nothing() {
        let f = fixture(EngineConfig::default());
        let result = f.orchestrator.run(TrainingMode::Full).await.unwrap();

        assert_eq!(result.data_processed, 0);
        assert!(result.models_updated.is_empty());
        assert!(!result.skipped);
        assert_eq!(f.snapshots.version(), 0);
    }

    #[tokio::test]
    async fn test_full_training_publishes_all_components() {
        let f = fixture(EngineConfig::default());
        f.seed(24);

        let result = f.orchestrator.run(TrainingMode::Full).await.unwrap();
        assert_eq!(result.data_processed, 24);
        assert_eq!(result.models_updated, Component::ALL.to_vec());
        assert!(result.errors.is_empty());
        assert_eq!(result.snapshot_version, 1);

        let snapshot = f.snapshots.load();
        assert_eq!(snapshot.cutoff, 24);
        assert!(snapshot.consistency_check().is_ok());
        assert_eq!(f.orchestrator.state(), TrainingState::Idle);
    }

    #[tokio::test]
    async fn test_incremental_advances_watermarks() {
        let f = fixture(EngineConfig::default());
        f.seed(24);
        f.orchestrator.run(TrainingMode::Full).await.unwrap();

        for i in 0..6 {
            f.record("u9", "gmail-sender", 100 + i);
        }
        let result = f.orchestrator.run(TrainingMode::Incremental).await.unwrap();
        assert_eq!(result.data_processed, 6);
        assert_eq!(result.snapshot_version, 2);

        let snapshot = f.snapshots.load();
        for c in Component::ALL {
            assert_eq!(snapshot.watermark(c), Some(30));
        }
    }

    #[tokio::test]
    async fn test_lightweight_skips_content() {
        let f = fixture(EngineConfig::default());
        f.seed(24);
        f.orchestrator.run(TrainingMode::Full).await.unwrap();
        f.record("u1", "slack-sender", 200);

        let result = f.orchestrator.run(TrainingMode::Lightweight).await.unwrap();
        assert!(!result.models_updated.contains(&Component::Content));
        let snapshot = f.snapshots.load();
        assert_eq!(snapshot.watermark(Component::Content), Some(24));
        assert_eq!(snapshot.watermark(Component::Collaborative), Some(25));
        assert_eq!(snapshot.cutoff, 25);
    }

    #[tokio::test]
    async fn test_failed_component_keeps_previous() {
        let mut config = EngineConfig::default();
        config.content.text_weight = 0.0;
        config.content.categorical_weight = 0.0;
        config.content.usage_weight = 0.0;
        config.content.temporal_weight = 0.0;
        let f = fixture(config);
        f.seed(24);

        let result = f.orchestrator.run(TrainingMode::Full).await.unwrap();
        assert!(result.errors.contains_key(&Component::Content));
        assert!(result.models_updated.contains(&Component::Collaborative));

        let snapshot = f.snapshots.load();
        assert!(snapshot.content.is_none());
        assert!(snapshot.collaborative.is_some());
        assert!(f.orchestrator.health()[&Component::Content].last_error.is_some());
    }

    #[tokio::test]
    async fn test_timeout_discards_working_copy() {
        let mut config = EngineConfig::default();
        config.training.max_training_duration_secs = 0;
        config.collaborative.max_iterations = 1_000_000;
        config.collaborative.convergence_threshold = -1.0;
        let f = fixture(config);
        f.seed(200);
        let holders = Arc::strong_count(&f.profiles);

        let result = f.orchestrator.run(TrainingMode::Full).await;
        assert!(matches!(result, Err(RecommendationError::TrainingTimeout(_))));
        // The worker has exited and dropped its job before the pass released the guard
        assert_eq!(Arc::strong_count(&f.profiles), holders);
        assert_eq!(f.snapshots.version(), 0);
        assert_eq!(f.orchestrator.state(), TrainingState::Idle);

        let again = f.orchestrator.run(TrainingMode::Full).await;
        assert!(matches!(again, Err(RecommendationError::TrainingTimeout(_))));
        assert_eq!(Arc::strong_count(&f.profiles), holders);
    }

    #[tokio::test]
    async fn test_due_mode() {
        let mut config = EngineConfig::default();
        config.training.batch_size = 4;
        let f = fixture(config);
        assert_eq!(f.orchestrator.due_mode(), None);

        f.seed(8);
        assert_eq!(f.orchestrator.due_mode(), Some(TrainingMode::Full));
        f.orchestrator.run(TrainingMode::Full).await.unwrap();
        assert_eq!(f.orchestrator.due_mode(), None);

        f.record("u1", "gmail-sender", 50);
        assert!(f.orchestrator.lightweight_due());
        for i in 0..4 {
            f.record("u2", "slack-sender", 60 + i);
        }
        assert_eq!(f.orchestrator.due_mode(), Some(TrainingMode::Incremental));
    }
}
