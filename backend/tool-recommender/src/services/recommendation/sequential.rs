// ============================================
// Sequential Transition Model
// ============================================
//
// Context-conditioned transition counts: how often tool B follows tool A
// within the time window, weighted by recency. Counts (not probabilities)
// are stored so incremental batches can simply add to them.
//
//   from_tool → context bucket → to_tool → weight
//
// Weights are 2^((t - reference) / half_life) against a reference fixed at
// full training, so the ratio between any two weights never depends on
// when the batch was processed.

use super::ModelMetadata;
use crate::config::SequentialConfig;
use crate::error::{RecommendationError, Result};
use crate::models::{ToolId, WorkflowStage};
use crate::services::training::TrainingSet;
use crate::store::Sequence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const MODEL_NAME: &str = "sequential";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextBucket {
    Any,
    Discovery,
    Planning,
    Execution,
    Review,
}

impl From<WorkflowStage> for ContextBucket {
    fn from(stage: WorkflowStage) -> Self {
        match stage {
            WorkflowStage::Discovery => ContextBucket::Discovery,
            WorkflowStage::Planning => ContextBucket::Planning,
            WorkflowStage::Execution => ContextBucket::Execution,
            WorkflowStage::Review => ContextBucket::Review,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TransitionRow {
    counts: HashMap<ToolId, f64>,
    total: f64,
}

impl TransitionRow {
    fn add(&mut self, to: &str, weight: f64) {
        *self.counts.entry(to.to_string()).or_insert(0.0) += weight;
        self.total += weight;
    }

    fn probability(&self, to: &str) -> Option<f64> {
        if self.total <= 0.0 {
            return None;
        }
        self.counts.get(to).map(|c| c / self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn for_span(secs: f64) -> Self {
        if secs < 120.0 {
            TimeUnit::Seconds
        } else if secs < 7_200.0 {
            TimeUnit::Minutes
        } else if secs < 172_800.0 {
            TimeUnit::Hours
        } else {
            TimeUnit::Days
        }
    }

    fn secs(self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3_600.0,
            TimeUnit::Days => 86_400.0,
        }
    }
}

/// Observed gap bounds between consecutive steps of a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalConstraint {
    pub min_gap: f64,
    pub max_gap: f64,
    pub unit: TimeUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePattern {
    pub tools: Vec<ToolId>,
    pub support: u32,
    /// support(pattern) / support(pattern without its last step)
    pub confidence: f64,
    pub avg_gap_secs: f64,
    pub constraint: TemporalConstraint,
}

#[derive(Default)]
struct GramStats {
    count: u32,
    gap_sum: f64,
    gap_n: u32,
    min_gap: f64,
    max_gap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialModel {
    transitions: HashMap<ToolId, HashMap<ContextBucket, TransitionRow>>,
    reference_time: DateTime<Utc>,
    window_secs: i64,
    half_life_secs: f64,
    context_aware: bool,
    position_decay: f64,
    patterns: Vec<SequencePattern>,
    pub metadata: ModelMetadata,
}

impl SequentialModel {
    pub fn train(data: &TrainingSet, config: &SequentialConfig, cancel: &AtomicBool) -> Result<Self> {
        let Some(reference_time) = data.latest_timestamp() else {
            return Err(RecommendationError::InsufficientData(
                "no interactions to build transitions from".to_string(),
            ));
        };

        let mut model = Self {
            transitions: HashMap::new(),
            reference_time,
            window_secs: config.time_window_secs as i64,
            half_life_secs: config.half_life_days * 86_400.0,
            context_aware: config.context_aware,
            position_decay: config.position_decay,
            patterns: Vec::new(),
            metadata: ModelMetadata::default(),
        };

        let pairs = model.accumulate(data, 0, cancel)?;
        model.patterns = mine_patterns(data, config, cancel)?;
        model.metadata = ModelMetadata {
            trained_through: data.through,
            trained_at: Some(Utc::now()),
            ..Default::default()
        };

        info!(
            pairs,
            rows = model.transitions.len(),
            patterns = model.patterns.len(),
            "Sequential model trained"
        );

        Ok(model)
    }

    /// Add transitions involving records at or beyond `watermark`.
    ///
    /// `data` must hold the full history of every user in the batch so
    /// pairs spanning the watermark are found. Patterns are not re-mined.
    pub fn update_incremental(
        &mut self,
        data: &TrainingSet,
        watermark: Sequence,
        through: Sequence,
        cancel: &AtomicBool,
    ) -> Result<usize> {
        let pairs = self.accumulate(data, watermark, cancel)?;
        self.metadata.trained_through = through;
        self.metadata.trained_at = Some(Utc::now());
        debug!(pairs, watermark, through, "Sequential model updated incrementally");
        Ok(pairs)
    }

    fn accumulate(&mut self, data: &TrainingSet, watermark: Sequence, cancel: &AtomicBool) -> Result<usize> {
        let mut pairs = 0;
        for history in data.by_user().values() {
            check_cancel(cancel)?;
            for (i, earlier) in history.iter().enumerate() {
                for later in &history[i + 1..] {
                    let gap = (later.record.timestamp - earlier.record.timestamp).num_seconds();
                    if gap > self.window_secs {
                        break;
                    }
                    if earlier.seq < watermark && later.seq < watermark {
                        continue;
                    }
                    let weight = self.recency_weight(later.record.timestamp);
                    let stage = later.record.context.workflow_stage;
                    self.add(&earlier.record.tool_id, &later.record.tool_id, stage, weight);
                    pairs += 1;
                }
            }
        }
        Ok(pairs)
    }

    fn add(&mut self, from: &str, to: &str, stage: Option<WorkflowStage>, weight: f64) {
        let row = self.transitions.entry(from.to_string()).or_default();
        row.entry(ContextBucket::Any).or_default().add(to, weight);
        if self.context_aware {
            if let Some(stage) = stage {
                row.entry(stage.into()).or_default().add(to, weight);
            }
        }
    }

    fn recency_weight(&self, at: DateTime<Utc>) -> f64 {
        let offset = (at - self.reference_time).num_seconds() as f64;
        2f64.powf(offset / self.half_life_secs.max(1.0))
    }

    fn row(&self, from: &str, stage: Option<WorkflowStage>) -> Option<&TransitionRow> {
        let rows = self.transitions.get(from)?;
        let staged = stage
            .filter(|_| self.context_aware)
            .and_then(|s| rows.get(&ContextBucket::from(s)));
        staged.or_else(|| rows.get(&ContextBucket::Any))
    }

    /// P(candidate | recent window), position-decayed and normalized to 0-1.
    ///
    /// `recent` is chronological, most recent last. `None` when no recent
    /// tool has ever been followed by the candidate.
    pub fn score(&self, candidate: &str, recent: &[ToolId], stage: Option<WorkflowStage>) -> Option<f64> {
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        let mut evidence = false;
        let mut decay = 1.0;

        for tool in recent.iter().rev() {
            if let Some(row) = self.row(tool, stage) {
                denominator += decay;
                if let Some(p) = row.probability(candidate) {
                    numerator += decay * p;
                    evidence = true;
                }
            }
            decay *= self.position_decay;
        }

        if !evidence || denominator <= 0.0 {
            return None;
        }
        Some((numerator / denominator).clamp(0.0, 1.0))
    }

    /// Most supported pattern whose prefix ends the recent window and whose
    /// last step is `candidate`
    pub fn matched_pattern(&self, candidate: &str, recent: &[ToolId]) -> Option<&SequencePattern> {
        self.patterns.iter().find(|p| {
            let (last, prefix) = match p.tools.split_last() {
                Some(split) => split,
                None => return false,
            };
            last == candidate && recent.ends_with(prefix)
        })
    }

    pub fn patterns(&self) -> &[SequencePattern] {
        &self.patterns
    }
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(RecommendationError::training(MODEL_NAME, "cancelled"));
    }
    Ok(())
}

fn mine_patterns(data: &TrainingSet, config: &SequentialConfig, cancel: &AtomicBool) -> Result<Vec<SequencePattern>> {
    let window = config.time_window_secs as i64;
    let mut grams: HashMap<Vec<ToolId>, GramStats> = HashMap::new();

    for history in data.by_user().values() {
        check_cancel(cancel)?;
        let mut sessions: Vec<Vec<(&ToolId, DateTime<Utc>)>> = Vec::new();
        for logged in history {
            let at = logged.record.timestamp;
            let start_new = match sessions.last().and_then(|s| s.last()) {
                Some((_, prev)) => (at - *prev).num_seconds() > window,
                None => true,
            };
            if start_new {
                sessions.push(Vec::new());
            }
            if let Some(session) = sessions.last_mut() {
                session.push((&logged.record.tool_id, at));
            }
        }

        for session in &sessions {
            for start in 0..session.len() {
                for len in 1..=config.max_pattern_len {
                    let end = start + len;
                    if end > session.len() {
                        break;
                    }
                    let key: Vec<ToolId> = session[start..end].iter().map(|(t, _)| (*t).clone()).collect();
                    let stats = grams.entry(key).or_insert_with(|| GramStats {
                        min_gap: f64::INFINITY,
                        ..Default::default()
                    });
                    stats.count += 1;
                    for pair in session[start..end].windows(2) {
                        let gap = (pair[1].1 - pair[0].1).num_seconds() as f64;
                        stats.gap_sum += gap;
                        stats.gap_n += 1;
                        stats.min_gap = stats.min_gap.min(gap);
                        stats.max_gap = stats.max_gap.max(gap);
                    }
                }
            }
        }
    }

    let mut patterns: Vec<SequencePattern> = grams
        .iter()
        .filter(|(tools, stats)| tools.len() >= 2 && stats.count >= config.min_support)
        .filter_map(|(tools, stats)| {
            let prefix = grams.get(&tools[..tools.len() - 1])?;
            let confidence = f64::from(stats.count) / f64::from(prefix.count.max(1));
            if confidence < config.min_confidence {
                return None;
            }
            let unit = TimeUnit::for_span(stats.max_gap);
            Some(SequencePattern {
                tools: tools.clone(),
                support: stats.count,
                confidence,
                avg_gap_secs: stats.gap_sum / f64::from(stats.gap_n.max(1)),
                constraint: TemporalConstraint {
                    min_gap: stats.min_gap / unit.secs(),
                    max_gap: stats.max_gap / unit.secs(),
                    unit,
                },
            })
        })
        .collect();

    patterns.sort_by(|a, b| {
        b.support
            .cmp(&a.support)
            .then(b.confidence.total_cmp(&a.confidence))
            .then(b.tools.len().cmp(&a.tools.len()))
            .then_with(|| a.tools.cmp(&b.tools))
    });
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InteractionContext, InteractionOutcome, InteractionRecord};
    use chrono::{Duration, TimeZone};

    fn at(day: i64, minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::days(day) + Duration::minutes(minute)
    }

    fn use_tool(user: &str, tool: &str, when: DateTime<Utc>, stage: Option<WorkflowStage>) -> InteractionRecord {
        let context = InteractionContext {
            workflow_stage: stage,
            ..Default::default()
        };
        InteractionRecord::new(user, tool, when, InteractionOutcome::succeeded()).with_context(context)
    }

    fn records() -> Vec<InteractionRecord> {
        let mut records = Vec::new();
        for day in 0..3 {
            records.push(use_tool("u1", "fetch", at(day, 0), None));
            records.push(use_tool("u1", "transform", at(day, 5), Some(WorkflowStage::Execution)));
            records.push(use_tool("u1", "export", at(day, 10), Some(WorkflowStage::Execution)));
        }
        records.push(use_tool("u2", "fetch", at(0, 0), None));
        records.push(use_tool("u2", "review", at(0, 3), Some(WorkflowStage::Review)));
        records
    }

    fn config() -> SequentialConfig {
        SequentialConfig {
            time_window_secs: 3600,
            ..Default::default()
        }
    }

    #[test]
    fn test_frequent_successor_scores_higher() {
        let model = SequentialModel::train(&TrainingSet::from_records(records()), &config(), &AtomicBool::new(false)).unwrap();
        let recent = vec!["fetch".to_string()];

        let transform = model.score("transform", &recent, None).unwrap();
        let review = model.score("review", &recent, None).unwrap();
        assert!(transform > review);
    }

    #[test]
    fn test_no_evidence_is_absent() {
        let model = SequentialModel::train(&TrainingSet::from_records(records()), &config(), &AtomicBool::new(false)).unwrap();
        assert!(model.score("transform", &[], None).is_none());
        assert!(model.score("never-seen", &["fetch".to_string()], None).is_none());
        assert!(model.score("transform", &["unknown".to_string()], None).is_none());
    }

    #[test]
    fn test_context_bucket_conditions_scores() {
        let model = SequentialModel::train(&TrainingSet::from_records(records()), &config(), &AtomicBool::new(false)).unwrap();
        let recent = vec!["fetch".to_string()];

        let review_in_review = model.score("review", &recent, Some(WorkflowStage::Review)).unwrap();
        let review_any = model.score("review", &recent, None).unwrap();
        assert!(review_in_review > review_any);
        assert!(model.score("transform", &recent, Some(WorkflowStage::Review)).is_none());
        // No Planning row: falls back to the unconditioned row
        assert_eq!(model.score("review", &recent, Some(WorkflowStage::Planning)), Some(review_any));
    }

    #[test]
    fn test_pairs_outside_window_are_ignored() {
        let records = vec![
            use_tool("u1", "a", at(0, 0), None),
            use_tool("u1", "b", at(0, 120), None),
        ];
        let model = SequentialModel::train(&TrainingSet::from_records(records), &config(), &AtomicBool::new(false)).unwrap();
        assert!(model.score("b", &["a".to_string()], None).is_none());
    }

    #[test]
    fn test_incremental_matches_full_training() {
        let all = records();
        let full = SequentialModel::train(&TrainingSet::from_records(all.clone()), &config(), &AtomicBool::new(false)).unwrap();

        let first = TrainingSet::from_records(all[..4].to_vec());
        let mut incremental = SequentialModel::train(&first, &config(), &AtomicBool::new(false)).unwrap();
        incremental
            .update_incremental(&TrainingSet::from_records(all.clone()), 4, all.len() as u64, &AtomicBool::new(false))
            .unwrap();

        let recent = vec!["fetch".to_string(), "transform".to_string()];
        for candidate in ["transform", "export", "review"] {
            let a = full.score(candidate, &recent, None);
            let b = incremental.score(candidate, &recent, None);
            match (a, b) {
                (Some(a), Some(b)) => assert!((a - b).abs() < 1e-9, "{}: {} vs {}", candidate, a, b),
                (a, b) => assert_eq!(a, b, "{}", candidate),
            }
        }
        assert_eq!(incremental.metadata.trained_through, all.len() as u64);
    }

    #[test]
    fn test_patterns_carry_temporal_constraints() {
        let model = SequentialModel::train(&TrainingSet::from_records(records()), &config(), &AtomicBool::new(false)).unwrap();
        let pattern = model
            .patterns()
            .iter()
            .find(|p| p.tools == ["fetch", "transform", "export"])
            .unwrap();

        assert_eq!(pattern.support, 3);
        assert!((pattern.confidence - 1.0).abs() < 1e-9);
        assert!((pattern.avg_gap_secs - 300.0).abs() < 1e-9);
        assert_eq!(pattern.constraint.unit, TimeUnit::Minutes);
        assert!((pattern.constraint.max_gap - 5.0).abs() < 1e-9);

        let matched = model
            .matched_pattern("export", &["fetch".to_string(), "transform".to_string()])
            .unwrap();
        assert_eq!(matched.tools.last().map(String::as_str), Some("export"));
    }

    #[test]
    fn test_cancel_flag_aborts_training_and_updates() {
        let data = TrainingSet::from_records(records());
        let result = SequentialModel::train(&data, &config(), &AtomicBool::new(true));
        assert!(matches!(result, Err(RecommendationError::ModelTrainingFailure { .. })));

        let mut model = SequentialModel::train(&data, &config(), &AtomicBool::new(false)).unwrap();
        let through = model.metadata.trained_through;
        let result = model.update_incremental(&data, 0, through + 1, &AtomicBool::new(true));
        assert!(result.is_err());
        assert_eq!(model.metadata.trained_through, through);
    }

    #[test]
    fn test_empty_data_is_insufficient() {
        let result = SequentialModel::train(&TrainingSet::default(), &config(), &AtomicBool::new(false));
        assert!(matches!(result, Err(RecommendationError::InsufficientData(_))));
    }
}
