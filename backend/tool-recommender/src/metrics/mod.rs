//! Prometheus metrics for serving and training

use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;
use std::time::Duration;

static METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    interactions: IntCounterVec,
    recommendations: IntCounterVec,
    recommendation_latency: HistogramVec,
    training_runs: CounterVec,
    training_duration: HistogramVec,
    snapshot_version: Gauge,
    ndcg: Gauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            interactions: IntCounterVec::new(
                Opts::new("toolrec_interactions_total", "Interactions submitted"),
                &["outcome"],
            )
            .expect("valid metric definition"),
            recommendations: IntCounterVec::new(
                Opts::new("toolrec_recommendations_total", "Recommendation requests served"),
                &["source"],
            )
            .expect("valid metric definition"),
            recommendation_latency: HistogramVec::new(
                HistogramOpts::new(
                    "toolrec_recommendation_latency_seconds",
                    "Recommendation latency",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
                &["source"],
            )
            .expect("valid metric definition"),
            training_runs: CounterVec::new(
                Opts::new("toolrec_training_runs_total", "Training passes by mode and status"),
                &["mode", "status"],
            )
            .expect("valid metric definition"),
            training_duration: HistogramVec::new(
                HistogramOpts::new("toolrec_training_duration_seconds", "Training pass duration")
                    .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]),
                &["mode"],
            )
            .expect("valid metric definition"),
            snapshot_version: Gauge::with_opts(Opts::new(
                "toolrec_snapshot_version",
                "Version of the published model snapshot",
            ))
            .expect("valid metric definition"),
            ndcg: Gauge::with_opts(Opts::new(
                "toolrec_ndcg_at_k",
                "NDCG@k of the published snapshot on holdout data",
            ))
            .expect("valid metric definition"),
        }
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.interactions.clone()))?;
        registry.register(Box::new(self.recommendations.clone()))?;
        registry.register(Box::new(self.recommendation_latency.clone()))?;
        registry.register(Box::new(self.training_runs.clone()))?;
        registry.register(Box::new(self.training_duration.clone()))?;
        registry.register(Box::new(self.snapshot_version.clone()))?;
        registry.register(Box::new(self.ndcg.clone()))?;
        Ok(())
    }
}

fn get_metrics() -> &'static EngineMetricsInner {
    METRICS.get_or_init(EngineMetricsInner::new)
}

/// Register metrics with a Prometheus registry
pub fn register(registry: &Registry) -> Result<(), prometheus::Error> {
    get_metrics().register(registry)
}

pub fn record_interaction(outcome: &str) {
    get_metrics().interactions.with_label_values(&[outcome]).inc();
}

pub fn record_recommendation(source: &str, latency: Duration) {
    let m = get_metrics();
    m.recommendations.with_label_values(&[source]).inc();
    m.recommendation_latency
        .with_label_values(&[source])
        .observe(latency.as_secs_f64());
}

pub fn record_training(mode: &str, status: &str, duration: Duration) {
    let m = get_metrics();
    m.training_runs.with_label_values(&[mode, status]).inc();
    m.training_duration
        .with_label_values(&[mode])
        .observe(duration.as_secs_f64());
}

pub fn set_snapshot(version: u64, ndcg: f64) {
    let m = get_metrics();
    m.snapshot_version.set(version as f64);
    m.ndcg.set(ndcg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_record() {
        let registry = Registry::new();
        register(&registry).unwrap();

        record_interaction("accepted");
        record_recommendation("hybrid", Duration::from_millis(3));
        record_training("full", "success", Duration::from_millis(40));
        set_snapshot(2, 0.5);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"toolrec_interactions_total".to_string()));
        assert!(names.contains(&"toolrec_snapshot_version".to_string()));
    }
}
