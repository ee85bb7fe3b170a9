// ============================================
// A/B Testing Framework
// ============================================
//
// User bucketing and outcome tracking for comparing recommendation
// variants.
//
// Features:
// - Consistent hashing for deterministic user assignment
// - Variant config may override the ensemble method
// - Per-variant impressions, conversions and satisfaction
// - A conversion counts only for a tool served in the user's last slate
// - Two-proportion z-test between a control and a treatment arm

use super::hybrid_ranker::EnsembleMethod;
use crate::error::{RecommendationError, Result};
use crate::models::{ToolId, UserId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use tracing::{debug, info};

/// A/B testing framework
#[derive(Debug, Default)]
pub struct ABTestingFramework {
    experiments: RwLock<HashMap<String, Experiment>>,
    /// (experiment, variant) → running totals
    stats: Mutex<HashMap<(String, String), VariantStats>>,
    /// (experiment, user) → last slate served and not yet converted
    served: Mutex<HashMap<(String, UserId), ServedSlate>>,
}

#[derive(Debug)]
struct ServedSlate {
    variant: String,
    tools: HashSet<ToolId>,
}

/// Experiment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub description: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub variants: Vec<Variant>,
    pub status: ExperimentStatus,
}

/// Experiment variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub allocation: u8,            // Percentage (0-100)
    pub config: serde_json::Value, // e.g. {"ensemble_method": "stacking"}
}

/// Experiment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentAction {
    Impression,
    Conversion,
}

/// Experiment event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment: String,
    pub variant: String,
    pub user_id: UserId,
    pub tool_id: Option<ToolId>,
    pub action: ExperimentAction,
    pub satisfaction: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub impressions: u64,
    pub conversions: u64,
    pub satisfaction_sum: f64,
    pub satisfaction_count: u64,
}

impl VariantStats {
    pub fn conversion_rate(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.conversions as f64 / self.impressions as f64
        }
    }

    pub fn avg_satisfaction(&self) -> Option<f64> {
        (self.satisfaction_count > 0).then(|| self.satisfaction_sum / self.satisfaction_count as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOutcome {
    TreatmentBetter,
    ControlBetter,
    /// Both arms have enough samples and |z| stays under the threshold
    NoSignificantDifference,
    /// No valid test: an arm is below the minimum sample size or its counts
    /// do not form a proportion
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub control: VariantStats,
    pub treatment: VariantStats,
    pub z_score: f64,
    pub outcome: ComparisonOutcome,
}

impl ABTestingFramework {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update experiment
    pub fn add_experiment(&self, experiment: Experiment) -> Result<()> {
        if experiment.variants.is_empty() {
            return Err(RecommendationError::RequestInvalid(format!(
                "Experiment {} has no variants",
                experiment.name
            )));
        }
        // Validate allocation sums to 100
        let total_allocation: u32 = experiment.variants.iter().map(|v| u32::from(v.allocation)).sum();
        if total_allocation != 100 {
            return Err(RecommendationError::RequestInvalid(format!(
                "Variant allocations must sum to 100 (got {})",
                total_allocation
            )));
        }

        info!(experiment = %experiment.name, variants = experiment.variants.len(), "Experiment registered");
        self.experiments.write().insert(experiment.name.clone(), experiment);
        Ok(())
    }

    /// Assign user to experiment variant (consistent hashing)
    ///
    /// Algorithm:
    /// 1. Hash user_id + experiment_name
    /// 2. Bucket = hash % 100 (0-99)
    /// 3. Find variant based on cumulative allocation
    pub fn assign_bucket(&self, user_id: &str, experiment_name: &str) -> Result<String> {
        let experiments = self.experiments.read();
        let experiment = experiments
            .get(experiment_name)
            .ok_or_else(|| RecommendationError::RequestInvalid(format!("Unknown experiment: {}", experiment_name)))?;

        if experiment.status != ExperimentStatus::Running {
            return Err(RecommendationError::RequestInvalid(format!(
                "Experiment {} is not running (status: {:?})",
                experiment_name, experiment.status
            )));
        }

        Ok(bucket_variant(experiment, user_id).name.clone())
    }

    /// Every running experiment the user falls into, as (experiment, variant)
    pub fn assignments(&self, user_id: &str) -> Vec<(String, String)> {
        let experiments = self.experiments.read();
        let mut out: Vec<(String, String)> = experiments
            .values()
            .filter(|e| e.status == ExperimentStatus::Running)
            .map(|e| (e.name.clone(), bucket_variant(e, user_id).name.clone()))
            .collect();
        out.sort();
        out
    }

    /// First running experiment (by name) whose assigned variant sets an
    /// `ensemble_method`
    pub fn ensemble_override(&self, user_id: &str) -> Option<(String, String, EnsembleMethod)> {
        let experiments = self.experiments.read();
        let mut running: Vec<&Experiment> = experiments
            .values()
            .filter(|e| e.status == ExperimentStatus::Running)
            .collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));

        running.into_iter().find_map(|e| {
            let variant = bucket_variant(e, user_id);
            let method = variant
                .config
                .get("ensemble_method")
                .cloned()
                .and_then(|v| serde_json::from_value::<EnsembleMethod>(v).ok())?;
            Some((e.name.clone(), variant.name.clone(), method))
        })
    }

    /// Raw counter update; `record_impression` and `record_conversion` keep
    /// conversions paired with served slates
    pub fn log_event(&self, event: ExperimentEvent) {
        debug!(
            experiment = %event.experiment,
            variant = %event.variant,
            user_id = %event.user_id,
            action = ?event.action,
            "Experiment event"
        );
        let mut stats = self.stats.lock();
        let entry = stats.entry((event.experiment, event.variant)).or_default();
        match event.action {
            ExperimentAction::Impression => entry.impressions += 1,
            ExperimentAction::Conversion => entry.conversions += 1,
        }
        if let Some(s) = event.satisfaction {
            entry.satisfaction_sum += s;
            entry.satisfaction_count += 1;
        }
    }

    /// Count one impression per experiment the user is in and remember the
    /// slate; an empty slate shows nothing and is not counted
    pub fn record_impression(&self, user_id: &str, tools: &[ToolId], timestamp: DateTime<Utc>) {
        if tools.is_empty() {
            return;
        }
        let assignments = self.assignments(user_id);
        {
            let mut served = self.served.lock();
            for (experiment, variant) in &assignments {
                served.insert(
                    (experiment.clone(), user_id.to_string()),
                    ServedSlate {
                        variant: variant.clone(),
                        tools: tools.iter().cloned().collect(),
                    },
                );
            }
        }
        for (experiment, variant) in assignments {
            self.log_event(ExperimentEvent {
                experiment,
                variant,
                user_id: user_id.to_string(),
                tool_id: None,
                action: ExperimentAction::Impression,
                satisfaction: None,
                timestamp,
            });
        }
    }

    /// Convert the user's last slate if it contained `tool_id`. Each slate
    /// converts at most once. Returns how many experiments counted it.
    pub fn record_conversion(
        &self,
        user_id: &str,
        tool_id: &str,
        satisfaction: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> usize {
        let assignments = self.assignments(user_id);
        let converted: Vec<(String, String)> = {
            let mut served = self.served.lock();
            assignments
                .into_iter()
                .filter(|(experiment, variant)| {
                    let key = (experiment.clone(), user_id.to_string());
                    let hit = served
                        .get(&key)
                        .is_some_and(|slate| slate.variant == *variant && slate.tools.contains(tool_id));
                    if hit {
                        served.remove(&key);
                    }
                    hit
                })
                .collect()
        };

        let count = converted.len();
        for (experiment, variant) in converted {
            self.log_event(ExperimentEvent {
                experiment,
                variant,
                user_id: user_id.to_string(),
                tool_id: Some(tool_id.to_string()),
                action: ExperimentAction::Conversion,
                satisfaction,
                timestamp,
            });
        }
        count
    }

    pub fn variant_stats(&self, experiment_name: &str, variant: &str) -> VariantStats {
        self.stats
            .lock()
            .get(&(experiment_name.to_string(), variant.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Two-proportion z-test on conversion rate
    pub fn compare(
        &self,
        experiment_name: &str,
        control: &str,
        treatment: &str,
        min_samples: u64,
        z_threshold: f64,
    ) -> Result<Comparison> {
        {
            let experiments = self.experiments.read();
            let experiment = experiments
                .get(experiment_name)
                .ok_or_else(|| RecommendationError::RequestInvalid(format!("Unknown experiment: {}", experiment_name)))?;
            for name in [control, treatment] {
                if !experiment.variants.iter().any(|v| v.name == name) {
                    return Err(RecommendationError::RequestInvalid(format!(
                        "Experiment {} has no variant {}",
                        experiment_name, name
                    )));
                }
            }
        }

        let c = self.variant_stats(experiment_name, control);
        let t = self.variant_stats(experiment_name, treatment);

        let inconclusive = |c: VariantStats, t: VariantStats| Comparison {
            control: c,
            treatment: t,
            z_score: 0.0,
            outcome: ComparisonOutcome::Inconclusive,
        };
        if c.impressions < min_samples.max(1) || t.impressions < min_samples.max(1) {
            return Ok(inconclusive(c, t));
        }
        if c.conversions > c.impressions || t.conversions > t.impressions {
            return Ok(inconclusive(c, t));
        }

        let z = two_proportion_z(c.conversions, c.impressions, t.conversions, t.impressions);
        if !z.is_finite() {
            return Ok(inconclusive(c, t));
        }
        let outcome = if z.abs() < z_threshold {
            ComparisonOutcome::NoSignificantDifference
        } else if z > 0.0 {
            ComparisonOutcome::TreatmentBetter
        } else {
            ComparisonOutcome::ControlBetter
        };

        Ok(Comparison {
            control: c,
            treatment: t,
            z_score: z,
            outcome,
        })
    }

    /// Running experiments, by name
    pub fn active_experiments(&self) -> Vec<Experiment> {
        let mut running: Vec<Experiment> = self
            .experiments
            .read()
            .values()
            .filter(|exp| exp.status == ExperimentStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));
        running
    }
}

fn bucket_variant<'a>(experiment: &'a Experiment, user_id: &str) -> &'a Variant {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    experiment.name.hash(&mut hasher);
    let bucket = (hasher.finish() % 100) as u32;

    let mut cumulative = 0u32;
    for variant in &experiment.variants {
        cumulative += u32::from(variant.allocation);
        if bucket < cumulative {
            return variant;
        }
    }
    // Allocations are validated to sum to 100
    &experiment.variants[0]
}

/// z = (p_t - p_c) / sqrt(p (1 - p) (1/n_c + 1/n_t)) with pooled p
fn two_proportion_z(conv_c: u64, n_c: u64, conv_t: u64, n_t: u64) -> f64 {
    let (nc, nt) = (n_c as f64, n_t as f64);
    let pc = conv_c as f64 / nc;
    let pt = conv_t as f64 / nt;
    let pooled = (conv_c + conv_t) as f64 / (nc + nt);
    let se = (pooled * (1.0 - pooled) * (1.0 / nc + 1.0 / nt)).sqrt();
    if se == 0.0 {
        0.0
    } else {
        (pt - pc) / se
    }
}
