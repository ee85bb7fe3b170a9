// ============================================
// Performance Monitor
// ============================================
//
// Tracks how the published snapshot performs:
// - ranking and business metrics from holdout evaluation after each publish
// - serving counters (latency, throughput, error and fallback rate)
// - a bounded history of timestamped records
// - A/B variant comparisons against the configured significance threshold

pub mod evaluation;

pub use evaluation::{EvaluationReport, Evaluator, RELEVANCE_THRESHOLD};

use crate::config::MonitorConfig;
use crate::models::{InteractionRecord, Recommendation, RecommendationSource};
use crate::services::recommendation::{ABTestingFramework, Comparison};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    // Ranking
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub ndcg_at_k: f64,
    pub map: f64,
    pub coverage: f64,
    // Business
    pub click_through_rate: f64,
    pub conversion_rate: f64,
    pub satisfaction: f64,
    pub completion_rate: f64,
    // Technical
    pub avg_latency_ms: f64,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
    pub fallback_rate: f64,
    pub users_evaluated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub timestamp: DateTime<Utc>,
    pub snapshot_version: u64,
    pub metrics: PerformanceMetrics,
    /// NDCG@k of each component scored alone
    pub component_ndcg: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub recommendations_served: u64,
    pub avg_score: f64,
    pub avg_novelty: f64,
    pub avg_diversity: f64,
    pub avg_contextual_relevance: f64,
    /// Share of served items that came from the fallback path
    pub fallback_share: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementSummary {
    pub interactions: u64,
    pub duplicates: u64,
    pub success_rate: f64,
    pub avg_satisfaction: f64,
    pub avg_engagement: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    pub requests: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub avg_latency_ms: f64,
    pub throughput_per_sec: f64,
    pub uptime_secs: f64,
}

#[derive(Debug, Default)]
struct QualityTotals {
    items: u64,
    fallback_items: u64,
    score_sum: f64,
    novelty_sum: f64,
    diversity_sum: f64,
    relevance_sum: f64,
}

#[derive(Debug, Default)]
struct EngagementTotals {
    successes: u64,
    satisfaction_sum: f64,
    engagement_sum: f64,
}

/// Lock-free counters on the request path plus small accumulators
#[derive(Debug)]
pub struct ServingStats {
    started: Instant,
    requests: AtomicU64,
    errors: AtomicU64,
    fallbacks: AtomicU64,
    latency_micros: AtomicU64,
    interactions: AtomicU64,
    duplicates: AtomicU64,
    quality: Mutex<QualityTotals>,
    engagement: Mutex<EngagementTotals>,
}

impl Default for ServingStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            interactions: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            quality: Mutex::new(QualityTotals::default()),
            engagement: Mutex::new(EngagementTotals::default()),
        }
    }
}

impl ServingStats {
    pub fn record_request(&self, latency: Duration, used_fallback: bool, served: &[Recommendation]) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        if used_fallback {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }

        let mut q = self.quality.lock();
        for r in served {
            q.items += 1;
            if r.source == RecommendationSource::Fallback {
                q.fallback_items += 1;
            }
            q.score_sum += r.score;
            q.novelty_sum += r.novelty;
            q.diversity_sum += r.diversity;
            q.relevance_sum += r.contextual_relevance;
        }
    }

    /// Internal failure that was answered from the fallback path
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interaction(&self, record: &InteractionRecord, duplicate: bool) {
        if duplicate {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.interactions.fetch_add(1, Ordering::Relaxed);
        let mut e = self.engagement.lock();
        if record.outcome.success {
            e.successes += 1;
        }
        e.satisfaction_sum += record.outcome.satisfaction;
        e.engagement_sum += record.outcome.engagement;
    }

    pub fn system_load(&self) -> SystemLoad {
        let requests = self.requests.load(Ordering::Relaxed);
        let uptime = self.started.elapsed().as_secs_f64();
        SystemLoad {
            requests,
            errors: self.errors.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            avg_latency_ms: ratio(self.latency_micros.load(Ordering::Relaxed) as f64 / 1000.0, requests),
            throughput_per_sec: if uptime > 0.0 { requests as f64 / uptime } else { 0.0 },
            uptime_secs: uptime,
        }
    }

    pub fn quality(&self) -> QualitySummary {
        let q = self.quality.lock();
        QualitySummary {
            recommendations_served: q.items,
            avg_score: ratio(q.score_sum, q.items),
            avg_novelty: ratio(q.novelty_sum, q.items),
            avg_diversity: ratio(q.diversity_sum, q.items),
            avg_contextual_relevance: ratio(q.relevance_sum, q.items),
            fallback_share: ratio(q.fallback_items as f64, q.items),
        }
    }

    pub fn engagement(&self) -> EngagementSummary {
        let interactions = self.interactions.load(Ordering::Relaxed);
        let e = self.engagement.lock();
        EngagementSummary {
            interactions,
            duplicates: self.duplicates.load(Ordering::Relaxed),
            success_rate: ratio(e.successes as f64, interactions),
            avg_satisfaction: ratio(e.satisfaction_sum, interactions),
            avg_engagement: ratio(e.engagement_sum, interactions),
        }
    }
}

fn ratio(sum: f64, n: u64) -> f64 {
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// A treatment arm measured against its experiment's control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantComparison {
    pub experiment: String,
    pub control: String,
    pub treatment: String,
    pub result: Comparison,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    history: RwLock<VecDeque<PerformanceRecord>>,
    serving: ServingStats,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            history: RwLock::new(VecDeque::new()),
            serving: ServingStats::default(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn serving(&self) -> &ServingStats {
        &self.serving
    }

    /// Combine an evaluation with current serving counters and append it,
    /// evicting the oldest record past `history_retention`
    pub fn record(
        &self,
        snapshot_version: u64,
        report: &EvaluationReport,
        component_ndcg: BTreeMap<String, f64>,
    ) -> PerformanceRecord {
        let load = self.serving.system_load();
        let metrics = PerformanceMetrics {
            precision_at_k: report.precision_at_k,
            recall_at_k: report.recall_at_k,
            ndcg_at_k: report.ndcg_at_k,
            map: report.map,
            coverage: report.coverage,
            click_through_rate: report.click_through_rate,
            conversion_rate: report.conversion_rate,
            satisfaction: report.satisfaction,
            completion_rate: report.completion_rate,
            avg_latency_ms: load.avg_latency_ms,
            throughput_per_sec: load.throughput_per_sec,
            error_rate: ratio(load.errors as f64, load.requests),
            fallback_rate: ratio(load.fallbacks as f64, load.requests),
            users_evaluated: report.users_evaluated,
        };
        let record = PerformanceRecord {
            timestamp: Utc::now(),
            snapshot_version,
            metrics,
            component_ndcg,
        };

        info!(
            snapshot_version,
            ndcg = record.metrics.ndcg_at_k,
            precision = record.metrics.precision_at_k,
            users = record.metrics.users_evaluated,
            "Snapshot evaluated"
        );

        let mut history = self.history.write();
        history.push_back(record.clone());
        while history.len() > self.config.history_retention.max(1) {
            history.pop_front();
        }
        record
    }

    pub fn current(&self) -> Option<PerformanceRecord> {
        self.history.read().back().cloned()
    }

    pub fn history(&self) -> Vec<PerformanceRecord> {
        self.history.read().iter().cloned().collect()
    }

    /// Test each running experiment's first variant, taken as control,
    /// against every other variant
    pub fn compare_variants(&self, experiments: &ABTestingFramework) -> Vec<VariantComparison> {
        let mut out = Vec::new();
        for experiment in experiments.active_experiments() {
            let Some((control, treatments)) = experiment.variants.split_first() else {
                continue;
            };
            for treatment in treatments {
                let compared = experiments.compare(
                    &experiment.name,
                    &control.name,
                    &treatment.name,
                    self.config.min_samples_per_variant,
                    self.config.z_threshold,
                );
                match compared {
                    Ok(result) => out.push(VariantComparison {
                        experiment: experiment.name.clone(),
                        control: control.name.clone(),
                        treatment: treatment.name.clone(),
                        result,
                    }),
                    Err(e) => warn!(experiment = %experiment.name, error = %e, "Variant comparison failed"),
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InteractionOutcome;

    #[test]
    fn test_history_is_bounded() {
        let monitor = PerformanceMonitor::new(MonitorConfig {
            history_retention: 3,
            ..Default::default()
        });
        for version in 1..=5 {
            monitor.record(version, &EvaluationReport::default(), BTreeMap::new());
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].snapshot_version, 3);
        assert_eq!(monitor.current().unwrap().snapshot_version, 5);
    }

    #[test]
    fn test_serving_rates() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        let stats = monitor.serving();
        stats.record_request(Duration::from_millis(4), false, &[]);
        stats.record_request(Duration::from_millis(2), true, &[]);
        stats.record_error();

        let record = monitor.record(1, &EvaluationReport::default(), BTreeMap::new());
        assert!((record.metrics.avg_latency_ms - 3.0).abs() < 1e-9);
        assert!((record.metrics.fallback_rate - 0.5).abs() < 1e-9);
        assert!((record.metrics.error_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_compare_variants_uses_configured_thresholds() {
        use crate::services::recommendation::{
            ComparisonOutcome, Experiment, ExperimentAction, ExperimentEvent, ExperimentStatus, Variant,
        };

        let experiments = ABTestingFramework::new();
        let variant = |name: &str| Variant {
            name: name.to_string(),
            allocation: 50,
            config: serde_json::json!({}),
        };
        experiments
            .add_experiment(Experiment {
                name: "ensemble".to_string(),
                description: "weighted vs stacking".to_string(),
                start_date: Utc::now(),
                end_date: None,
                variants: vec![variant("weighted"), variant("stacking")],
                status: ExperimentStatus::Running,
            })
            .unwrap();
        let log = |variant: &str, action: ExperimentAction, n: u64| {
            for i in 0..n {
                experiments.log_event(ExperimentEvent {
                    experiment: "ensemble".to_string(),
                    variant: variant.to_string(),
                    user_id: format!("u{}", i),
                    tool_id: None,
                    action,
                    satisfaction: None,
                    timestamp: Utc::now(),
                });
            }
        };
        log("weighted", ExperimentAction::Impression, 60);
        log("weighted", ExperimentAction::Conversion, 6);
        log("stacking", ExperimentAction::Impression, 60);
        log("stacking", ExperimentAction::Conversion, 30);

        // Default floor of 100 samples per arm is not met
        let strict = PerformanceMonitor::new(MonitorConfig::default());
        let report = strict.compare_variants(&experiments);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].control, "weighted");
        assert_eq!(report[0].result.outcome, ComparisonOutcome::Inconclusive);

        let relaxed = PerformanceMonitor::new(MonitorConfig {
            min_samples_per_variant: 50,
            ..Default::default()
        });
        let report = relaxed.compare_variants(&experiments);
        assert_eq!(report[0].treatment, "stacking");
        assert_eq!(report[0].result.outcome, ComparisonOutcome::TreatmentBetter);

        let unreachable = PerformanceMonitor::new(MonitorConfig {
            min_samples_per_variant: 50,
            z_threshold: 100.0,
            ..Default::default()
        });
        let report = unreachable.compare_variants(&experiments);
        assert_eq!(report[0].result.outcome, ComparisonOutcome::NoSignificantDifference);
    }

    #[test]
    fn test_engagement_ignores_duplicates() {
        let stats = ServingStats::default();
        let record = InteractionRecord::new("u1", "gmail-sender", Utc::now(), InteractionOutcome::succeeded());
        stats.record_interaction(&record, false);
        stats.record_interaction(&record, true);

        let summary = stats.engagement();
        assert_eq!(summary.interactions, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.success_rate, 1.0);
    }
}
