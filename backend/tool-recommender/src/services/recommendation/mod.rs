// ============================================
// Tool Recommendation Engine - Module Root
// ============================================
//
// Hybrid recommendation engine combining:
// 1. Collaborative Filtering (matrix factorization, SGD)
// 2. Content-Based Filtering (hashed text, category, usage, temporal features)
// 3. Sequential Modeling (context-aware transitions + frequent patterns)
// 4. Hybrid Ranking (ensemble fusion + freshness, novelty, diversity)
// 5. A/B Testing Framework (user bucketing + experiment tracking)
//
// Architecture:
//   Request → A/B Framework → Hybrid Ranker → Ranked Tools
//                                  ↓
//              Published snapshot (Collaborative + Content + Sequential)
//                                  ↓
//                      Fallback to popularity (if failure)

pub mod ab_testing;
pub mod collaborative_filtering;
pub mod content_based;
pub mod hybrid_ranker;
mod math;
pub mod sequential;

pub use ab_testing::{
    ABTestingFramework, Comparison, ComparisonOutcome, Experiment, ExperimentAction, ExperimentEvent,
    ExperimentStatus, Variant, VariantStats,
};
pub use collaborative_filtering::{CollaborativeFilteringModel, ColdStartStrategy, ModelMetadata};
pub use content_based::{ContentBasedModel, SimilarityMetric};
pub use hybrid_ranker::{
    Component, EnsembleMethod, HybridRanker, HybridWeights, ScoredCandidate, ScoringRequest, StackingModel,
};
pub use sequential::{SequencePattern, SequentialModel};

use crate::config::EngineConfig;
use crate::error::{RecommendationError, Result};
use crate::metrics;
use crate::models::{InteractionRecord, Recommendation, RecommendationRequest, ToolId, ToolProfile, UserProfile};
use crate::services::monitoring::{
    EngagementSummary, PerformanceMonitor, PerformanceRecord, QualitySummary, SystemLoad, VariantComparison,
};
use crate::services::training::{
    ComponentHealth, ModelSnapshot, SnapshotHandle, TrainingMode, TrainingOrchestrator, TrainingResult,
    TrainingState,
};
use crate::store::{AppendOutcome, InteractionStore, ProfileStore, ToolCatalog};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOutcome {
    Accepted,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub snapshot_version: u64,
    pub training_state: TrainingState,
    pub current: Option<PerformanceRecord>,
    pub history: Vec<PerformanceRecord>,
    pub model_health: BTreeMap<Component, ComponentHealth>,
    pub quality: QualitySummary,
    pub engagement: EngagementSummary,
    pub system_load: SystemLoad,
    pub experiments: Vec<VariantComparison>,
}

/// Owns every piece of model and profile state; engines are independent
pub struct RecommendationEngine {
    config: EngineConfig,
    catalog: Arc<dyn ToolCatalog>,
    interactions: Arc<InteractionStore>,
    profiles: Arc<ProfileStore>,
    snapshots: Arc<SnapshotHandle>,
    monitor: Arc<PerformanceMonitor>,
    orchestrator: Arc<TrainingOrchestrator>,
    ranker: HybridRanker,
    experiments: ABTestingFramework,
}

impl RecommendationEngine {
    pub fn new(config: EngineConfig, catalog: Arc<dyn ToolCatalog>) -> Result<Self> {
        config.validate()?;

        let interactions = Arc::new(InteractionStore::new());
        let profiles = Arc::new(ProfileStore::new());
        let seeded = profiles.seed_from_catalog(catalog.as_ref());
        let snapshots = Arc::new(SnapshotHandle::new(ModelSnapshot::empty(HybridWeights::from_config(
            &config.hybrid,
        ))));
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let orchestrator = Arc::new(TrainingOrchestrator::new(
            config.clone(),
            interactions.clone(),
            profiles.clone(),
            snapshots.clone(),
            monitor.clone(),
        )?);
        let ranker = HybridRanker::new(config.hybrid.clone(), &config.collaborative)?;

        info!(
            tools = seeded,
            ensemble = ?config.hybrid.ensemble_method,
            "Recommendation engine initialized"
        );

        Ok(Self {
            config,
            catalog,
            interactions,
            profiles,
            snapshots,
            monitor,
            orchestrator,
            ranker,
            experiments: ABTestingFramework::new(),
        })
    }

    /// Load the persisted snapshot named by `snapshot_path`, if there is one
    pub fn restore_snapshot(&self) -> Result<bool> {
        let Some(path) = self.config.snapshot_path.as_deref() else {
            return Ok(false);
        };
        if !path.exists() {
            debug!(path = %path.display(), "No persisted snapshot");
            return Ok(false);
        }
        let mut snapshot = ModelSnapshot::load_from(path)?;
        snapshot.rebase(self.interactions.len());
        let published = self.snapshots.publish(snapshot);
        metrics::set_snapshot(published.version, 0.0);
        Ok(true)
    }

    pub fn persist_snapshot(&self) -> Result<bool> {
        let Some(path) = self.config.snapshot_path.as_deref() else {
            return Ok(false);
        };
        self.snapshots.load().save_to(path)?;
        Ok(true)
    }

    /// Append to the log and update profiles; idempotent per
    /// `(user_id, tool_id, timestamp)`
    pub fn record_interaction(&self, record: InteractionRecord) -> Result<RecordOutcome> {
        record.validate()?;

        if self.interactions.append(record.clone()) == AppendOutcome::Duplicate {
            debug!(user_id = %record.user_id, tool_id = %record.tool_id, "Duplicate interaction ignored");
            self.monitor.serving().record_interaction(&record, true);
            metrics::record_interaction("duplicate");
            return Ok(RecordOutcome::Duplicate);
        }

        self.profiles
            .apply(&record, self.catalog.as_ref(), &self.config.profile);
        self.monitor.serving().record_interaction(&record, false);
        metrics::record_interaction("accepted");

        if record.outcome.success {
            self.experiments.record_conversion(
                &record.user_id,
                &record.tool_id,
                Some(record.outcome.satisfaction),
                record.timestamp,
            );
        }

        if self.orchestrator.lightweight_due() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let orchestrator = self.orchestrator.clone();
                handle.spawn(async move {
                    if let Err(e) = orchestrator.run(TrainingMode::Lightweight).await {
                        warn!(error = %e, "Lightweight update failed");
                    }
                });
            }
        }

        Ok(RecordOutcome::Accepted)
    }

    /// Rank `request.candidates`. After validation this never fails: any
    /// scoring error or budget overrun is answered from the fallback path.
    pub fn recommend(&self, request: &RecommendationRequest) -> Result<Vec<Recommendation>> {
        let started = Instant::now();
        request.validate()?;

        let now = request.requested_at.unwrap_or_else(Utc::now);
        let candidates = match request.unique_candidates() {
            c if c.is_empty() => self.profiles.tool_ids(),
            c => c,
        };
        let profile = self.profiles.user(&request.user_id);
        let snapshot = self.snapshots.load();

        let method = self
            .experiments
            .ensemble_override(&request.user_id)
            .map_or(self.config.hybrid.ensemble_method, |(_, _, m)| m);

        let scoring = ScoringRequest {
            user_id: &request.user_id,
            profile: profile.as_ref(),
            context: &request.context,
            candidates: &candidates,
            method,
            deadline: request.budget.map(|b| started + b),
        };

        let (scored, used_fallback) = if !snapshot.has_models() {
            (self.ranker.fallback_candidates(&self.profiles, &scoring), true)
        } else {
            match self.ranker.score_candidates(&snapshot, &self.profiles, &scoring) {
                Ok(scored) => (scored, false),
                Err(e) => {
                    if !matches!(e, RecommendationError::ScoringUnavailable(_)) {
                        self.monitor.serving().record_error();
                    }
                    warn!(user_id = %request.user_id, error = %e, "Scoring failed, serving fallback");
                    (self.ranker.fallback_candidates(&self.profiles, &scoring), true)
                }
            }
        };

        let recommendations = self
            .ranker
            .rank(scored, profile.as_ref(), request.limit(), now, true);

        let served: Vec<ToolId> = recommendations.iter().map(|r| r.tool_id.clone()).collect();
        self.experiments.record_impression(&request.user_id, &served, now);

        let latency = started.elapsed();
        let source = if used_fallback { "fallback" } else { "hybrid" };
        metrics::record_recommendation(source, latency);
        self.monitor
            .serving()
            .record_request(latency, used_fallback, &recommendations);
        debug!(
            user_id = %request.user_id,
            candidates = candidates.len(),
            returned = recommendations.len(),
            source,
            method = ?method,
            latency_us = latency.as_micros() as u64,
            "Recommendations served"
        );

        Ok(recommendations)
    }

    /// Run a training pass now: full, or incremental over the pending tail
    pub async fn train(&self, full: bool) -> Result<TrainingResult> {
        let mode = if full { TrainingMode::Full } else { TrainingMode::Incremental };
        self.orchestrator.run(mode).await
    }

    /// Run whichever pass the schedule calls for, if any
    pub async fn run_due_training(&self) -> Result<Option<TrainingResult>> {
        match self.orchestrator.due_mode() {
            Some(mode) => self.orchestrator.run(mode).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn analytics(&self) -> AnalyticsReport {
        let serving = self.monitor.serving();
        AnalyticsReport {
            snapshot_version: self.snapshots.version(),
            training_state: self.orchestrator.state(),
            current: self.monitor.current(),
            history: self.monitor.history(),
            model_health: self.orchestrator.health(),
            quality: serving.quality(),
            engagement: serving.engagement(),
            system_load: serving.system_load(),
            experiments: self.monitor.compare_variants(&self.experiments),
        }
    }

    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.snapshots.load()
    }

    pub fn experiments(&self) -> &ABTestingFramework {
        &self.experiments
    }

    pub fn user_profile(&self, user_id: &str) -> Option<UserProfile> {
        self.profiles.user(user_id)
    }

    pub fn tool_profile(&self, tool_id: &str) -> Option<ToolProfile> {
        self.profiles.tool(tool_id)
    }

    pub fn set_user_segment(&self, user_id: &str, segment: impl Into<String>) {
        self.profiles.set_segment(user_id, segment);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
