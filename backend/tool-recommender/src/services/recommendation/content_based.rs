// ============================================
// Content-Based Model
// ============================================
//
// Tools are embedded as concatenated feature families, each L2-normalized
// and scaled by its weight:
//   textual     hashed description + tag tokens
//   categorical one-hot category
//   usage       success rate, usage share, complexity, satisfaction
//   temporal    time-of-day and workflow-stage distribution
//
// A user vector is the recency- and feedback-weighted average of the
// vectors of tools they used.

use super::math::{cosine_similarity, fnv1a, l2_norm, normalize};
use super::ModelMetadata;
use crate::config::ContentConfig;
use crate::error::{RecommendationError, Result};
use crate::models::{ToolId, ToolProfile, UserId, WorkflowStage};
use crate::services::training::TrainingSet;
use crate::store::Sequence;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const MODEL_NAME: &str = "content";
const USAGE_DIMS: usize = 4;
const TEMPORAL_DIMS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Euclidean,
    Jaccard,
    Pearson,
}

impl SimilarityMetric {
    /// Similarity in 0-1
    pub fn similarity(self, a: &[f64], b: &[f64]) -> f64 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let sim = match self {
            SimilarityMetric::Cosine => cosine_similarity(a, b),
            SimilarityMetric::Euclidean => {
                let d = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt();
                1.0 / (1.0 + d)
            }
            SimilarityMetric::Jaccard => {
                let (min_sum, max_sum) = a.iter().zip(b).fold((0.0, 0.0), |(lo, hi), (x, y)| {
                    (lo + x.abs().min(y.abs()), hi + x.abs().max(y.abs()))
                });
                if max_sum == 0.0 {
                    0.0
                } else {
                    min_sum / max_sum
                }
            }
            SimilarityMetric::Pearson => (pearson(a, b) + 1.0) / 2.0,
        };
        sim.clamp(0.0, 1.0)
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyWeights {
    pub text: f64,
    pub categorical: f64,
    pub usage: f64,
    pub temporal: f64,
}

impl FamilyWeights {
    fn from_config(config: &ContentConfig) -> Self {
        Self {
            text: config.text_weight,
            categorical: config.categorical_weight,
            usage: config.usage_weight,
            temporal: config.temporal_weight,
        }
    }

    fn all_disabled(&self) -> bool {
        [self.text, self.categorical, self.usage, self.temporal]
            .iter()
            .all(|w| *w <= 0.0)
    }
}

/// Feature space fixed at full training and reused until the next one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayout {
    text_dims: usize,
    categories: Vec<String>,
    weights: FamilyWeights,
    max_usage: u64,
    /// Dimensions kept after variance-based reduction
    kept: Option<Vec<usize>>,
}

impl FeatureLayout {
    fn full_dims(&self) -> usize {
        self.text_dims + self.categories.len() + USAGE_DIMS + TEMPORAL_DIMS
    }

    pub fn dims(&self) -> usize {
        self.kept.as_ref().map_or_else(|| self.full_dims(), Vec::len)
    }

    /// Projected vector, or `None` when the tool has no usable features
    fn extract(&self, tool: &ToolProfile) -> Option<Vec<f64>> {
        let mut vector = Vec::with_capacity(self.full_dims());

        let mut text = vec![0.0; self.text_dims];
        let tokens = tokenize(&tool.description).chain(tool.tags.iter().flat_map(|t| tokenize(t)));
        for token in tokens {
            text[(fnv1a(&token) % self.text_dims as u64) as usize] += 1.0;
        }
        push_family(&mut vector, text, self.weights.text);

        let mut categorical = vec![0.0; self.categories.len()];
        if let Ok(idx) = self.categories.binary_search(&tool.category) {
            categorical[idx] = 1.0;
        }
        push_family(&mut vector, categorical, self.weights.categorical);

        let mut usage = vec![0.0; USAGE_DIMS];
        let mut temporal = vec![0.0; TEMPORAL_DIMS];
        if tool.usage_count > 0 {
            let share = if self.max_usage > 0 {
                (1.0 + tool.usage_count as f64).ln() / (1.0 + self.max_usage as f64).ln()
            } else {
                0.0
            };
            usage = vec![tool.success_rate(), share.min(1.0), tool.complexity(), tool.satisfaction()];

            let tod_total: u64 = tool.time_of_day_counts.iter().sum();
            for (i, count) in tool.time_of_day_counts.iter().enumerate() {
                if tod_total > 0 {
                    temporal[i] = *count as f64 / tod_total as f64;
                }
            }
            let stage_total: u64 = tool.stage_stats.values().map(|s| s.uses).sum();
            for stage in WorkflowStage::ALL {
                if let Some(stats) = tool.stage_stats.get(&stage) {
                    temporal[4 + stage.index()] = stats.uses as f64 / stage_total.max(1) as f64;
                }
            }
        }
        push_family(&mut vector, usage, self.weights.usage);
        push_family(&mut vector, temporal, self.weights.temporal);

        let vector = self.project(vector);
        if vector.iter().all(|x| *x == 0.0) {
            return None;
        }
        Some(vector)
    }

    fn project(&self, full: Vec<f64>) -> Vec<f64> {
        match &self.kept {
            Some(kept) => kept.iter().map(|i| full[*i]).collect(),
            None => full,
        }
    }
}

fn push_family(vector: &mut Vec<f64>, mut family: Vec<f64>, weight: f64) {
    if weight <= 0.0 {
        family.iter_mut().for_each(|x| *x = 0.0);
    } else {
        normalize(&mut family);
        family.iter_mut().for_each(|x| *x *= weight);
    }
    vector.extend(family);
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_lowercase)
}

/// Indices of the `max` highest-variance dimensions, ascending
fn high_variance_dims(vectors: &[Vec<f64>], dims: usize, max: usize) -> Vec<usize> {
    let n = vectors.len().max(1) as f64;
    let mut variances: Vec<(usize, f64)> = (0..dims)
        .map(|d| {
            let mean = vectors.iter().map(|v| v[d]).sum::<f64>() / n;
            let var = vectors.iter().map(|v| (v[d] - mean).powi(2)).sum::<f64>() / n;
            (d, var)
        })
        .collect();
    variances.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut kept: Vec<usize> = variances.into_iter().take(max).map(|(d, _)| d).collect();
    kept.sort_unstable();
    kept
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBasedModel {
    pub metric: SimilarityMetric,
    pub layout: FeatureLayout,
    tool_vectors: HashMap<ToolId, Vec<f64>>,
    user_vectors: HashMap<UserId, Vec<f64>>,
    half_life_days: f64,
    pub metadata: ModelMetadata,
}

impl ContentBasedModel {
    pub fn train(data: &TrainingSet, config: &ContentConfig, cancel: &AtomicBool) -> Result<Self> {
        let weights = FamilyWeights::from_config(config);
        if weights.all_disabled() {
            return Err(RecommendationError::training(
                MODEL_NAME,
                "every feature family is disabled",
            ));
        }
        if data.tools.is_empty() {
            return Err(RecommendationError::InsufficientData(
                "no tool profiles to embed".to_string(),
            ));
        }

        let mut categories: Vec<String> = data
            .tools
            .values()
            .map(|t| t.category.clone())
            .filter(|c| !c.is_empty())
            .collect();
        categories.sort();
        categories.dedup();

        let mut layout = FeatureLayout {
            text_dims: config.text_dims,
            categories,
            weights,
            max_usage: data.tools.values().map(|t| t.usage_count).max().unwrap_or(0),
            kept: None,
        };

        let mut ids: Vec<&ToolId> = data.tools.keys().collect();
        ids.sort();
        let full: Vec<(ToolId, Vec<f64>)> = ids
            .into_iter()
            .filter_map(|id| layout.extract(&data.tools[id]).map(|v| (id.clone(), v)))
            .collect();

        if cancel.load(Ordering::Relaxed) {
            return Err(RecommendationError::training(MODEL_NAME, "cancelled"));
        }

        let tool_vectors: HashMap<ToolId, Vec<f64>> = match config.max_features {
            Some(max) if max < layout.full_dims() => {
                let vectors: Vec<Vec<f64>> = full.iter().map(|(_, v)| v.clone()).collect();
                let kept = high_variance_dims(&vectors, layout.full_dims(), max);
                let projected = full
                    .into_iter()
                    .map(|(id, v)| (id, kept.iter().map(|i| v[*i]).collect::<Vec<f64>>()))
                    .filter(|(_, v)| v.iter().any(|x| *x != 0.0))
                    .collect();
                layout.kept = Some(kept);
                projected
            }
            _ => full.into_iter().collect(),
        };

        let mut model = Self {
            metric: config.similarity_metric,
            layout,
            tool_vectors,
            user_vectors: HashMap::new(),
            half_life_days: config.recency_half_life_days,
            metadata: ModelMetadata::default(),
        };
        model.rebuild_user_vectors(data, None, cancel)?;
        model.metadata = ModelMetadata {
            trained_through: data.through,
            trained_at: Some(Utc::now()),
            ..Default::default()
        };

        info!(
            tools = model.tool_vectors.len(),
            users = model.user_vectors.len(),
            dims = model.layout.dims(),
            "Content model trained"
        );

        Ok(model)
    }

    /// Recompute vectors for `users` and embed tools added since training.
    ///
    /// The feature layout stays as trained.
    pub fn refresh(
        &mut self,
        data: &TrainingSet,
        users: &HashSet<&str>,
        through: Sequence,
        cancel: &AtomicBool,
    ) -> Result<usize> {
        for (id, tool) in &data.tools {
            if !self.tool_vectors.contains_key(id) {
                if let Some(v) = self.layout.extract(tool) {
                    self.tool_vectors.insert(id.clone(), v);
                }
            }
        }
        let refreshed = self.rebuild_user_vectors(data, Some(users), cancel)?;
        self.metadata.trained_through = through;
        self.metadata.trained_at = Some(Utc::now());
        debug!(users = refreshed, through, "Content user vectors refreshed");
        Ok(refreshed)
    }

    fn rebuild_user_vectors(
        &mut self,
        data: &TrainingSet,
        only: Option<&HashSet<&str>>,
        cancel: &AtomicBool,
    ) -> Result<usize> {
        let Some(reference) = data.latest_timestamp() else {
            return Ok(0);
        };
        let mut refreshed = 0;

        for (user, history) in data.by_user() {
            if cancel.load(Ordering::Relaxed) {
                return Err(RecommendationError::training(MODEL_NAME, "cancelled"));
            }
            if only.map_or(false, |set| !set.contains(user)) {
                continue;
            }
            let mut acc = vec![0.0; self.layout.dims()];
            let mut total = 0.0;
            for logged in history {
                let record = &logged.record;
                let Some(tool) = self.tool_vectors.get(&record.tool_id) else {
                    continue;
                };
                let age_days = (reference - record.timestamp).num_seconds().max(0) as f64 / 86_400.0;
                let recency = 0.5f64.powf(age_days / self.half_life_days.max(f64::EPSILON));
                let w = recency * record.normalized_signal();
                if w <= 0.0 {
                    continue;
                }
                acc.iter_mut().zip(tool).for_each(|(a, x)| *a += w * x);
                total += w;
            }
            if total > 0.0 {
                acc.iter_mut().for_each(|a| *a /= total);
                self.user_vectors.insert(user.to_string(), acc);
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Trained vector, else the mean of the recent window's tool vectors
    pub fn user_vector(&self, user: &str, recent: &[ToolId]) -> Option<Vec<f64>> {
        if let Some(v) = self.user_vectors.get(user) {
            return Some(v.clone());
        }
        let vectors: Vec<&Vec<f64>> = recent.iter().filter_map(|t| self.tool_vectors.get(t)).collect();
        if vectors.is_empty() {
            return None;
        }
        let mut acc = vec![0.0; self.layout.dims()];
        for v in &vectors {
            acc.iter_mut().zip(v.iter()).for_each(|(a, x)| *a += x);
        }
        acc.iter_mut().for_each(|a| *a /= vectors.len() as f64);
        Some(acc)
    }

    /// `None` when the tool has no feature vector
    pub fn score(&self, user_vector: &[f64], tool: &str) -> Option<f64> {
        let tool_vector = self.tool_vectors.get(tool)?;
        if l2_norm(user_vector) == 0.0 {
            return None;
        }
        Some(self.metric.similarity(user_vector, tool_vector))
    }

    pub fn tool_similarity(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.metric.similarity(self.tool_vectors.get(a)?, self.tool_vectors.get(b)?))
    }

    /// Best similarity between `candidate` and any of `others`
    pub fn max_similarity(&self, candidate: &str, others: &[ToolId]) -> Option<f64> {
        others
            .iter()
            .filter(|o| o.as_str() != candidate)
            .filter_map(|o| self.tool_similarity(candidate, o))
            .reduce(f64::max)
    }

    pub fn similar_tools(&self, tool: &str, k: usize) -> Vec<(ToolId, f64)> {
        let Some(target) = self.tool_vectors.get(tool) else {
            return Vec::new();
        };
        let mut scored: Vec<(ToolId, f64)> = self
            .tool_vectors
            .iter()
            .filter(|(id, _)| id.as_str() != tool)
            .map(|(id, v)| (id.clone(), self.metric.similarity(target, v)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.tool_vectors.contains_key(tool)
    }

    pub fn dimensions_consistent(&self) -> bool {
        let dims = self.layout.dims();
        self.tool_vectors
            .values()
            .chain(self.user_vectors.values())
            .all(|v| v.len() == dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InteractionContext, InteractionOutcome, InteractionRecord};
    use chrono::{Duration, TimeZone};

    fn tools() -> Vec<ToolProfile> {
        vec![
            ToolProfile::new("gmail-sender", "email", "Send email messages through Gmail", vec!["email".into(), "send".into()]),
            ToolProfile::new("outlook-sender", "email", "Send email messages via Outlook", vec!["email".into()]),
            ToolProfile::new("slack-sender", "chat", "Post a chat message to Slack", vec!["chat".into()]),
            ToolProfile::new("sheets-exporter", "spreadsheet", "Export rows into Google Sheets", vec!["export".into()]),
            ToolProfile::new("blank", "", "", vec![]),
        ]
    }

    fn data() -> TrainingSet {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut records = Vec::new();
        for day in 0..4 {
            records.push(
                InteractionRecord::new("u1", "gmail-sender", base + Duration::days(day), InteractionOutcome::succeeded())
                    .with_rating(5)
                    .with_context(InteractionContext::with_stage(WorkflowStage::Execution)),
            );
        }
        records.push(
            InteractionRecord::new("u1", "slack-sender", base + Duration::days(5), InteractionOutcome::failed())
                .with_rating(2),
        );
        TrainingSet::from_records(records).with_tools(tools())
    }

    #[test]
    fn test_tool_without_features_has_no_score() {
        let model = ContentBasedModel::train(&data(), &ContentConfig::default(), &AtomicBool::new(false)).unwrap();
        assert!(!model.has_tool("blank"));

        let user = model.user_vector("u1", &[]).unwrap();
        assert!(model.score(&user, "blank").is_none());
        assert!(model.score(&user, "sheets-exporter").is_some());
        assert!(model.dimensions_consistent());
    }

    #[test]
    fn test_user_vector_prefers_liked_tools() {
        let model = ContentBasedModel::train(&data(), &ContentConfig::default(), &AtomicBool::new(false)).unwrap();
        let user = model.user_vector("u1", &[]).unwrap();

        let gmail = model.score(&user, "gmail-sender").unwrap();
        let slack = model.score(&user, "slack-sender").unwrap();
        let outlook = model.score(&user, "outlook-sender").unwrap();
        assert!(gmail > slack);
        assert!(outlook > slack);
    }

    #[test]
    fn test_similar_tools_share_category_and_text() {
        let model = ContentBasedModel::train(&data(), &ContentConfig::default(), &AtomicBool::new(false)).unwrap();
        let similar = model.similar_tools("outlook-sender", 1);
        assert_eq!(similar[0].0, "gmail-sender");
    }

    #[test]
    fn test_all_families_disabled_fails() {
        let config = ContentConfig {
            text_weight: 0.0,
            categorical_weight: 0.0,
            usage_weight: 0.0,
            temporal_weight: 0.0,
            ..Default::default()
        };
        let result = ContentBasedModel::train(&data(), &config, &AtomicBool::new(false));
        assert!(matches!(result, Err(RecommendationError::ModelTrainingFailure { .. })));
    }

    #[test]
    fn test_dimensionality_reduction_is_fixed() {
        let config = ContentConfig {
            max_features: Some(6),
            ..Default::default()
        };
        let mut model = ContentBasedModel::train(&data(), &config, &AtomicBool::new(false)).unwrap();
        assert_eq!(model.layout.dims(), 6);

        let mut more = data();
        more.tools.insert(
            "drive-upload".into(),
            ToolProfile::new("drive-upload", "storage", "Upload files to Drive", vec![]),
        );
        model.refresh(&more, &HashSet::new(), 10, &AtomicBool::new(false)).unwrap();
        assert_eq!(model.layout.dims(), 6);
        assert!(model.dimensions_consistent());
        assert_eq!(model.metadata.trained_through, 10);
    }

    #[test]
    fn test_cancelled_refresh_stops_before_user_vectors() {
        let mut model = ContentBasedModel::train(&data(), &ContentConfig::default(), &AtomicBool::new(false)).unwrap();
        let through = model.metadata.trained_through;
        let users: HashSet<&str> = ["u1"].into_iter().collect();

        let result = model.refresh(&data(), &users, through + 5, &AtomicBool::new(true));
        assert!(matches!(result, Err(RecommendationError::ModelTrainingFailure { .. })));
        assert_eq!(model.metadata.trained_through, through);
    }

    #[test]
    fn test_recent_window_builds_vector_for_unknown_user() {
        let model = ContentBasedModel::train(&data(), &ContentConfig::default(), &AtomicBool::new(false)).unwrap();
        assert!(model.user_vector("newbie", &[]).is_none());
        assert!(model.user_vector("newbie", &["gmail-sender".to_string()]).is_some());
    }

    #[test]
    fn test_metric_ranges() {
        let a = [1.0, 0.0, 2.0];
        let b = [1.0, 0.0, 2.0];
        for metric in [
            SimilarityMetric::Cosine,
            SimilarityMetric::Euclidean,
            SimilarityMetric::Jaccard,
            SimilarityMetric::Pearson,
        ] {
            assert!((metric.similarity(&a, &b) - 1.0).abs() < 1e-9, "{:?}", metric);
        }
        assert_eq!(SimilarityMetric::Jaccard.similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((SimilarityMetric::Euclidean.similarity(&[0.0], &[1.0]) - 0.5).abs() < 1e-9);
        assert_eq!(SimilarityMetric::Pearson.similarity(&[1.0, 2.0], &[2.0, 1.0]), 0.0);
    }
}
