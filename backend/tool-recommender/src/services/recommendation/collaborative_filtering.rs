// ============================================
// Collaborative Filtering Model
// ============================================
//
// Biased matrix factorization over the user x tool feedback matrix:
//   affinity(u, t) = mu + b_u + b_t + <p_u, q_t>
// trained with SGD against the 1-5 feedback signal.
//
// Data Flow:
//   Interaction log → SGD (full or incremental) → latent factors
//                                      ↓
//                 Top-K similarity cache (full training only)

use super::math::{cosine_similarity, dot, fnv1a};
use crate::config::CollaborativeConfig;
use crate::error::{RecommendationError, Result};
use crate::models::{InteractionRecord, ToolId, UserId, MAX_RATING, MIN_RATING};
use crate::services::training::TrainingSet;
use crate::store::Sequence;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const MODEL_NAME: &str = "collaborative";

/// Score source for users or tools the factorization cannot cover yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartStrategy {
    Popularity,
    ContentSimilarity,
    DemographicAverage,
    Blend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Log position this model has consumed (exclusive)
    pub trained_through: Sequence,
    pub trained_at: Option<DateTime<Utc>>,
    pub training_rmse: f64,
    pub epochs: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LatentVector {
    bias: f64,
    factors: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ToolUsage {
    uses: u32,
    successes: u32,
}

impl ToolUsage {
    fn weighted(&self) -> f64 {
        let rate = (f64::from(self.successes) + 1.0) / (f64::from(self.uses) + 2.0);
        f64::from(self.uses) * rate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SegmentStat {
    sum: f64,
    count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeFilteringModel {
    pub num_factors: usize,
    global_mean: f64,
    rating_count: u64,
    users: HashMap<UserId, LatentVector>,
    tools: HashMap<ToolId, LatentVector>,
    user_counts: HashMap<UserId, u32>,
    tool_usage: HashMap<ToolId, ToolUsage>,
    max_weighted_usage: f64,
    /// Normalized feedback per demographic segment and tool
    segment_stats: HashMap<String, HashMap<ToolId, SegmentStat>>,
    similar_users: HashMap<UserId, Vec<(UserId, f64)>>,
    similar_tools: HashMap<ToolId, Vec<(ToolId, f64)>>,
    pub metadata: ModelMetadata,
}

type Sample<'a> = (&'a str, &'a str, f64);

impl CollaborativeFilteringModel {
    pub fn empty(num_factors: usize) -> Self {
        Self {
            num_factors,
            global_mean: (MIN_RATING + MAX_RATING) / 2.0,
            rating_count: 0,
            users: HashMap::new(),
            tools: HashMap::new(),
            user_counts: HashMap::new(),
            tool_usage: HashMap::new(),
            max_weighted_usage: 0.0,
            segment_stats: HashMap::new(),
            similar_users: HashMap::new(),
            similar_tools: HashMap::new(),
            metadata: ModelMetadata::default(),
        }
    }

    /// Full factorization over `data`.
    ///
    /// Runs until `max_iterations` or until an epoch improves RMSE by less
    /// than `convergence_threshold`. Checks `cancel` between epochs.
    pub fn train(data: &TrainingSet, config: &CollaborativeConfig, cancel: &AtomicBool) -> Result<Self> {
        if data.is_empty() {
            return Err(RecommendationError::InsufficientData(
                "no interactions to factorize".to_string(),
            ));
        }

        let mut model = Self::empty(config.num_factors);
        let mut sum = 0.0;
        for record in data.iter() {
            model.observe(record, data.segments.get(&record.user_id).map(String::as_str));
            model.ensure_vectors(record, config);
            sum += record.feedback_signal();
        }
        model.rating_count = data.len() as u64;
        model.global_mean = sum / data.len() as f64;
        model.refresh_usage_norm();

        let samples: Vec<Sample> = data
            .iter()
            .map(|r| (r.user_id.as_str(), r.tool_id.as_str(), r.feedback_signal()))
            .collect();
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut previous = f64::INFINITY;
        let mut rmse = model.rmse(&samples);
        let mut epochs = 0;
        let mut converged = false;

        while epochs < config.max_iterations {
            if cancel.load(Ordering::Relaxed) {
                return Err(RecommendationError::training(MODEL_NAME, "cancelled"));
            }
            order.shuffle(&mut rng);
            model.sgd_epoch(&samples, &order, config);
            epochs += 1;

            rmse = model.rmse(&samples);
            if !rmse.is_finite() {
                return Err(RecommendationError::training(
                    MODEL_NAME,
                    format!("diverged after {} epochs", epochs),
                ));
            }
            if previous - rmse < config.convergence_threshold {
                converged = true;
                break;
            }
            previous = rmse;
        }

        model.rebuild_similarity(config.similarity_top_k);
        model.metadata = ModelMetadata {
            trained_through: data.through,
            trained_at: Some(Utc::now()),
            training_rmse: rmse,
            epochs,
            converged,
        };

        info!(
            users = model.users.len(),
            tools = model.tools.len(),
            epochs,
            rmse,
            converged,
            "Collaborative model trained"
        );

        Ok(model)
    }

    /// Fold a batch in with a few SGD passes over that batch only.
    ///
    /// New users and tools get seeded vectors. The similarity cache is left
    /// as of the last full training.
    pub fn update_incremental(
        &mut self,
        batch: &[&InteractionRecord],
        segments: &HashMap<UserId, String>,
        config: &CollaborativeConfig,
        through: Sequence,
        cancel: &AtomicBool,
    ) -> Result<usize> {
        for record in batch {
            self.observe(record, segments.get(&record.user_id).map(String::as_str));
            self.ensure_vectors(record, config);
            self.rating_count += 1;
            self.global_mean += (record.feedback_signal() - self.global_mean) / self.rating_count as f64;
        }
        self.refresh_usage_norm();

        let samples: Vec<Sample> = batch
            .iter()
            .map(|r| (r.user_id.as_str(), r.tool_id.as_str(), r.feedback_signal()))
            .collect();
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(config.seed ^ through);

        for _ in 0..config.incremental_steps {
            if cancel.load(Ordering::Relaxed) {
                return Err(RecommendationError::training(MODEL_NAME, "cancelled"));
            }
            order.shuffle(&mut rng);
            self.sgd_epoch(&samples, &order, config);
        }

        self.metadata.trained_through = through;
        self.metadata.trained_at = Some(Utc::now());
        debug!(batch = batch.len(), through, "Collaborative model updated incrementally");

        Ok(batch.len())
    }

    fn observe(&mut self, record: &InteractionRecord, segment: Option<&str>) {
        *self.user_counts.entry(record.user_id.clone()).or_insert(0) += 1;

        let usage = self.tool_usage.entry(record.tool_id.clone()).or_default();
        usage.uses += 1;
        if record.outcome.success {
            usage.successes += 1;
        }

        if let Some(segment) = segment {
            let stat = self
                .segment_stats
                .entry(segment.to_string())
                .or_default()
                .entry(record.tool_id.clone())
                .or_default();
            stat.sum += record.normalized_signal();
            stat.count += 1;
        }
    }

    fn ensure_vectors(&mut self, record: &InteractionRecord, config: &CollaborativeConfig) {
        if !self.users.contains_key(&record.user_id) {
            let v = seeded_vector(&record.user_id, config);
            self.users.insert(record.user_id.clone(), v);
        }
        if !self.tools.contains_key(&record.tool_id) {
            let v = seeded_vector(&record.tool_id, config);
            self.tools.insert(record.tool_id.clone(), v);
        }
    }

    fn sgd_epoch(&mut self, samples: &[Sample], order: &[usize], config: &CollaborativeConfig) {
        let lr = config.learning_rate;
        let reg = config.regularization;
        let mu = self.global_mean;

        for &i in order {
            let (user, tool, rating) = samples[i];
            let (Some(p), Some(q)) = (self.users.get_mut(user), self.tools.get_mut(tool)) else {
                continue;
            };

            let err = rating - (mu + p.bias + q.bias + dot(&p.factors, &q.factors));
            p.bias += lr * (err - reg * p.bias);
            q.bias += lr * (err - reg * q.bias);
            for f in 0..p.factors.len().min(q.factors.len()) {
                let pf = p.factors[f];
                let qf = q.factors[f];
                p.factors[f] += lr * (err * qf - reg * pf);
                q.factors[f] += lr * (err * pf - reg * qf);
            }
        }
    }

    fn rmse(&self, samples: &[Sample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sq: f64 = samples
            .iter()
            .filter_map(|(u, t, r)| self.raw_affinity(u, t).map(|p| (r - p).powi(2)))
            .sum();
        (sq / samples.len() as f64).sqrt()
    }

    fn raw_affinity(&self, user: &str, tool: &str) -> Option<f64> {
        let p = self.users.get(user)?;
        let q = self.tools.get(tool)?;
        Some(self.global_mean + p.bias + q.bias + dot(&p.factors, &q.factors))
    }

    fn refresh_usage_norm(&mut self) {
        self.max_weighted_usage = self
            .tool_usage
            .values()
            .map(ToolUsage::weighted)
            .fold(0.0, f64::max);
    }

    fn rebuild_similarity(&mut self, top_k: usize) {
        self.similar_users = top_k_similar(&self.users, top_k);
        self.similar_tools = top_k_similar(&self.tools, top_k);
    }

    pub fn user_interactions(&self, user: &str) -> u32 {
        self.user_counts.get(user).copied().unwrap_or(0)
    }

    pub fn tool_interactions(&self, tool: &str) -> u32 {
        self.tool_usage.get(tool).map(|u| u.uses).unwrap_or(0)
    }

    /// Predicted affinity on the 1-5 scale, `None` below `min_interactions`
    pub fn predict(&self, user: &str, tool: &str, min_interactions: u32) -> Option<f64> {
        if self.user_interactions(user) < min_interactions || self.tool_interactions(tool) < min_interactions {
            return None;
        }
        self.raw_affinity(user, tool)
            .map(|a| a.clamp(MIN_RATING, MAX_RATING))
    }

    /// Prediction mapped onto 0-1 for fusion
    pub fn score(&self, user: &str, tool: &str, min_interactions: u32) -> Option<f64> {
        self.predict(user, tool, min_interactions)
            .map(|p| (p - MIN_RATING) / (MAX_RATING - MIN_RATING))
    }

    /// Grows toward 1 as both sides accumulate interactions
    pub fn confidence(&self, user: &str, tool: &str, min_interactions: u32) -> f64 {
        let support = self.user_interactions(user).min(self.tool_interactions(tool));
        1.0 - (-(f64::from(support)) / f64::from(min_interactions.max(1))).exp()
    }

    /// Log-scaled, success-weighted usage relative to the busiest tool
    pub fn popularity(&self, tool: &str) -> Option<f64> {
        let usage = self.tool_usage.get(tool)?;
        if self.max_weighted_usage <= 0.0 {
            return Some(0.0);
        }
        Some(((1.0 + usage.weighted()).ln() / (1.0 + self.max_weighted_usage).ln()).clamp(0.0, 1.0))
    }

    pub fn demographic_average(&self, segment: &str, tool: &str) -> Option<f64> {
        self.segment_stats
            .get(segment)?
            .get(tool)
            .filter(|s| s.count > 0)
            .map(|s| s.sum / f64::from(s.count))
    }

    /// Fallback score in 0-1 for a pair the factorization does not cover
    /// Estimate for a cold user or tool, `None` when the strategy has no
    /// signal for it
    pub fn cold_start_score(
        &self,
        strategy: ColdStartStrategy,
        tool: &str,
        segment: Option<&str>,
        content_hint: Option<f64>,
    ) -> Option<f64> {
        let demographic = || segment.and_then(|s| self.demographic_average(s, tool));

        match strategy {
            ColdStartStrategy::Popularity => self.popularity(tool),
            ColdStartStrategy::ContentSimilarity => content_hint,
            ColdStartStrategy::DemographicAverage => demographic().or_else(|| self.popularity(tool)),
            ColdStartStrategy::Blend => {
                let parts: Vec<f64> = [self.popularity(tool), content_hint, demographic()]
                    .into_iter()
                    .flatten()
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.iter().sum::<f64>() / parts.len() as f64)
                }
            }
        }
    }

    pub fn similar_users(&self, user: &str, k: usize) -> Vec<(UserId, f64)> {
        self.similar_users
            .get(user)
            .map(|v| v.iter().take(k).cloned().collect())
            .unwrap_or_default()
    }

    pub fn similar_tools(&self, tool: &str, k: usize) -> Vec<(ToolId, f64)> {
        self.similar_tools
            .get(tool)
            .map(|v| v.iter().take(k).cloned().collect())
            .unwrap_or_default()
    }

    /// Every latent vector has `num_factors` dimensions
    pub fn dimensions_consistent(&self) -> bool {
        self.users
            .values()
            .chain(self.tools.values())
            .all(|v| v.factors.len() == self.num_factors)
    }
}

/// Deterministic per-id initialization, independent of arrival order
fn seeded_vector(id: &str, config: &CollaborativeConfig) -> LatentVector {
    let mut rng = StdRng::seed_from_u64(config.seed ^ fnv1a(id));
    let factors = if config.init_std > 0.0 {
        (0..config.num_factors)
            .map(|_| rng.gen_range(-config.init_std..config.init_std))
            .collect()
    } else {
        vec![0.0; config.num_factors]
    };
    LatentVector { bias: 0.0, factors }
}

fn top_k_similar(vectors: &HashMap<String, LatentVector>, top_k: usize) -> HashMap<String, Vec<(String, f64)>> {
    let mut ids: Vec<&String> = vectors.keys().collect();
    ids.sort();

    let mut result = HashMap::new();
    for a in &ids {
        let mut scored: Vec<(String, f64)> = ids
            .iter()
            .filter(|b| *b != a)
            .filter_map(|b| {
                let sim = cosine_similarity(&vectors[*a].factors, &vectors[*b].factors);
                (sim > 0.0).then(|| ((*b).clone(), sim))
            })
            .collect();
        scored.sort_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.cmp(&y.0)));
        scored.truncate(top_k);
        result.insert((*a).clone(), scored);
    }
    result
}
