use crate::error::{RecommendationError, Result};
use crate::services::recommendation::{ColdStartStrategy, EnsembleMethod, SimilarityMetric};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Prefix for environment overrides, e.g. `TOOLREC_NUM_FACTORS=32`
pub const ENV_PREFIX: &str = "TOOLREC_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub collaborative: CollaborativeConfig,
    pub content: ContentConfig,
    pub sequential: SequentialConfig,
    pub hybrid: HybridConfig,
    pub training: TrainingConfig,
    pub monitor: MonitorConfig,
    pub profile: ProfileConfig,
    /// Where published snapshots are persisted; `None` keeps them in memory only
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborativeConfig {
    pub num_factors: usize,
    pub learning_rate: f64,
    pub regularization: f64,
    pub max_iterations: usize,
    /// Stop once an epoch improves RMSE by less than this
    pub convergence_threshold: f64,
    /// Users and tools below this count get no collaborative score
    pub min_interactions: u32,
    pub similarity_top_k: usize,
    pub cold_start_strategy: ColdStartStrategy,
    /// SGD passes over an incremental batch
    pub incremental_steps: usize,
    pub init_std: f64,
    pub seed: u64,
}

impl Default for CollaborativeConfig {
    fn default() -> Self {
        Self {
            num_factors: 16,
            learning_rate: 0.01,
            regularization: 0.02,
            max_iterations: 100,
            convergence_threshold: 1e-4,
            min_interactions: 3,
            similarity_top_k: 10,
            cold_start_strategy: ColdStartStrategy::Blend,
            incremental_steps: 5,
            init_std: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub similarity_metric: SimilarityMetric,
    pub text_weight: f64,
    pub categorical_weight: f64,
    pub usage_weight: f64,
    pub temporal_weight: f64,
    /// Hash buckets for description and tag tokens
    pub text_dims: usize,
    /// Keep only this many highest-variance dimensions
    pub max_features: Option<usize>,
    pub recency_half_life_days: f64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            similarity_metric: SimilarityMetric::Cosine,
            text_weight: 1.0,
            categorical_weight: 1.0,
            usage_weight: 0.5,
            temporal_weight: 0.5,
            text_dims: 64,
            max_features: None,
            recency_half_life_days: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequentialConfig {
    /// Max gap between two uses for them to count as a transition
    pub time_window_secs: u64,
    pub half_life_days: f64,
    pub context_aware: bool,
    pub max_pattern_len: usize,
    pub min_support: u32,
    pub min_confidence: f64,
    /// Weight multiplier per step back in the recent window
    pub position_decay: f64,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self {
            time_window_secs: 3600,
            half_life_days: 14.0,
            context_aware: true,
            max_pattern_len: 4,
            min_support: 2,
            min_confidence: 0.3,
            position_decay: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub ensemble_method: EnsembleMethod,
    pub collaborative_weight: f64,
    pub content_weight: f64,
    pub sequential_weight: f64,
    pub dynamic_weighting: bool,
    /// Tools completed successfully within this window are not recommended
    pub freshness_window_secs: u64,
    pub min_category_diversity: usize,
    pub max_novelty_fraction: f64,
    pub novelty_threshold: f64,
    pub stacking_epochs: usize,
    pub stacking_learning_rate: f64,
}

impl HybridConfig {
    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freshness_window_secs as i64)
    }
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            ensemble_method: EnsembleMethod::Weighted,
            collaborative_weight: 0.4,
            content_weight: 0.3,
            sequential_weight: 0.3,
            dynamic_weighting: true,
            freshness_window_secs: 3600,
            min_category_diversity: 2,
            max_novelty_fraction: 0.3,
            novelty_threshold: 0.8,
            stacking_epochs: 200,
            stacking_learning_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub model_update_frequency_secs: u64,
    pub batch_size: usize,
    pub max_training_duration_secs: u64,
    /// Share of each user's most recent history held out for evaluation
    pub holdout_fraction: f64,
    pub exclude_holdout_from_training: bool,
    /// Kick off lightweight passes from the record path
    pub lightweight_updates: bool,
    pub scheduler_interval_secs: u64,
}

impl TrainingConfig {
    pub fn model_update_frequency(&self) -> Duration {
        Duration::from_secs(self.model_update_frequency_secs)
    }

    pub fn max_training_duration(&self) -> Duration {
        Duration::from_secs(self.max_training_duration_secs)
    }

    pub fn lightweight_threshold(&self) -> usize {
        (self.batch_size / 4).max(1)
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_update_frequency_secs: 3600,
            batch_size: 100,
            max_training_duration_secs: 300,
            holdout_fraction: 0.2,
            exclude_holdout_from_training: false,
            lightweight_updates: true,
            scheduler_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Cutoff for P@K, R@K and NDCG@K
    pub k: usize,
    pub history_retention: usize,
    pub z_threshold: f64,
    pub min_samples_per_variant: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            k: 5,
            history_retention: 100,
            z_threshold: 1.96,
            min_samples_per_variant: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub recent_window: usize,
    /// EMA factor for the derived user scalars
    pub decay_alpha: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            recent_window: 10,
            decay_alpha: 0.1,
        }
    }
}

/// Flat overrides read from `TOOLREC_*` variables
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    config_path: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    num_factors: Option<usize>,
    learning_rate: Option<f64>,
    regularization: Option<f64>,
    max_iterations: Option<usize>,
    min_interactions: Option<u32>,
    cold_start_strategy: Option<ColdStartStrategy>,
    similarity_metric: Option<SimilarityMetric>,
    ensemble_method: Option<EnsembleMethod>,
    dynamic_weighting: Option<bool>,
    batch_size: Option<usize>,
    model_update_frequency_secs: Option<u64>,
    max_training_duration_secs: Option<u64>,
    scheduler_interval_secs: Option<u64>,
    history_retention: Option<usize>,
}

impl EngineConfig {
    /// Load `.env`, an optional JSON file named by `TOOLREC_CONFIG_PATH`,
    /// then apply the remaining `TOOLREC_*` overrides.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX).from_env()?;

        let mut config = match &overrides.config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;

        info!(
            num_factors = config.collaborative.num_factors,
            ensemble = ?config.hybrid.ensemble_method,
            batch_size = config.training.batch_size,
            "Engine configuration loaded"
        );

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            RecommendationError::Config(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    fn apply(&mut self, o: EnvOverrides) {
        if o.snapshot_path.is_some() {
            self.snapshot_path = o.snapshot_path;
        }
        if let Some(v) = o.num_factors {
            self.collaborative.num_factors = v;
        }
        if let Some(v) = o.learning_rate {
            self.collaborative.learning_rate = v;
        }
        if let Some(v) = o.regularization {
            self.collaborative.regularization = v;
        }
        if let Some(v) = o.max_iterations {
            self.collaborative.max_iterations = v;
        }
        if let Some(v) = o.min_interactions {
            self.collaborative.min_interactions = v;
        }
        if let Some(v) = o.cold_start_strategy {
            self.collaborative.cold_start_strategy = v;
        }
        if let Some(v) = o.similarity_metric {
            self.content.similarity_metric = v;
        }
        if let Some(v) = o.ensemble_method {
            self.hybrid.ensemble_method = v;
        }
        if let Some(v) = o.dynamic_weighting {
            self.hybrid.dynamic_weighting = v;
        }
        if let Some(v) = o.batch_size {
            self.training.batch_size = v;
        }
        if let Some(v) = o.model_update_frequency_secs {
            self.training.model_update_frequency_secs = v;
        }
        if let Some(v) = o.max_training_duration_secs {
            self.training.max_training_duration_secs = v;
        }
        if let Some(v) = o.scheduler_interval_secs {
            self.training.scheduler_interval_secs = v;
        }
        if let Some(v) = o.history_retention {
            self.monitor.history_retention = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RecommendationError::Config(msg));

        let cf = &self.collaborative;
        if cf.num_factors == 0 {
            return invalid("num_factors must be positive".into());
        }
        if !(cf.learning_rate > 0.0 && cf.learning_rate <= 1.0) {
            return invalid(format!("learning_rate {} outside (0, 1]", cf.learning_rate));
        }
        if cf.regularization < 0.0 {
            return invalid("regularization must be non-negative".into());
        }

        let h = &self.hybrid;
        let weights = [h.collaborative_weight, h.content_weight, h.sequential_weight];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return invalid("hybrid weights must be non-negative with a positive sum".into());
        }
        if !(0.0..=1.0).contains(&h.max_novelty_fraction) {
            return invalid("max_novelty_fraction must be within 0-1".into());
        }

        if self.content.text_dims == 0 {
            return invalid("text_dims must be positive".into());
        }
        if !(self.sequential.position_decay > 0.0 && self.sequential.position_decay <= 1.0) {
            return invalid("position_decay must be within (0, 1]".into());
        }
        if self.sequential.max_pattern_len < 2 {
            return invalid("max_pattern_len must be at least 2".into());
        }

        let t = &self.training;
        if t.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if t.max_training_duration_secs == 0 {
            return invalid("max_training_duration_secs must be positive".into());
        }
        if !(0.0..1.0).contains(&t.holdout_fraction) {
            return invalid("holdout_fraction must be within [0, 1)".into());
        }

        if self.monitor.k == 0 || self.monitor.history_retention == 0 {
            return invalid("monitor k and history_retention must be positive".into());
        }
        if self.profile.recent_window == 0 {
            return invalid("recent_window must be positive".into());
        }
        if !(self.profile.decay_alpha > 0.0 && self.profile.decay_alpha <= 1.0) {
            return invalid("decay_alpha must be within (0, 1]".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_weights() {
        let mut config = EngineConfig::default();
        config.hybrid.collaborative_weight = 0.0;
        config.hybrid.content_weight = 0.0;
        config.hybrid.sequential_weight = 0.0;
        assert!(matches!(config.validate(), Err(RecommendationError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"collaborative": {"num_factors": 8}}"#).unwrap();
        assert_eq!(config.collaborative.num_factors, 8);
        assert_eq!(config.collaborative.min_interactions, 3);
        assert_eq!(config.training.batch_size, 100);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("TOOLREC_NUM_FACTORS", "24");
        std::env::set_var("TOOLREC_ENSEMBLE_METHOD", "stacking");
        std::env::set_var("TOOLREC_BATCH_SIZE", "40");

        let config = EngineConfig::from_env().unwrap();

        std::env::remove_var("TOOLREC_NUM_FACTORS");
        std::env::remove_var("TOOLREC_ENSEMBLE_METHOD");
        std::env::remove_var("TOOLREC_BATCH_SIZE");

        assert_eq!(config.collaborative.num_factors, 24);
        assert_eq!(config.hybrid.ensemble_method, EnsembleMethod::Stacking);
        assert_eq!(config.training.batch_size, 40);
        assert_eq!(config.training.lightweight_threshold(), 10);
    }

    #[test]
    #[serial]
    fn test_config_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"training": {{"batch_size": 7}}, "monitor": {{"k": 3}}}}"#).unwrap();

        std::env::set_var("TOOLREC_CONFIG_PATH", file.path());
        std::env::set_var("TOOLREC_BATCH_SIZE", "9");

        let config = EngineConfig::from_env().unwrap();

        std::env::remove_var("TOOLREC_CONFIG_PATH");
        std::env::remove_var("TOOLREC_BATCH_SIZE");

        assert_eq!(config.monitor.k, 3);
        assert_eq!(config.training.batch_size, 9);
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_config_error() {
        std::env::set_var("TOOLREC_NUM_FACTORS", "many");
        let result = EngineConfig::from_env();
        std::env::remove_var("TOOLREC_NUM_FACTORS");

        assert!(matches!(result, Err(RecommendationError::Config(_))));
    }
}
