//! Offline ranking evaluation on a holdout split.

use crate::config::ProfileConfig;
use crate::models::{InteractionContext, InteractionRecord, ToolId, UserProfile};
use crate::services::recommendation::{EnsembleMethod, HybridRanker, ScoringRequest};
use crate::services::training::{Holdout, ModelSnapshot, TrainingSet};
use crate::store::ProfileStore;
use std::collections::{BTreeSet, HashSet};

/// Holdout interactions at or above this normalized signal count as relevant
pub const RELEVANCE_THRESHOLD: f64 = 0.5;

pub fn precision_at_k(ranked: &[ToolId], relevant: &HashSet<&str>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    hits(ranked, relevant, k) as f64 / k as f64
}

pub fn recall_at_k(ranked: &[ToolId], relevant: &HashSet<&str>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    hits(ranked, relevant, k) as f64 / relevant.len() as f64
}

/// Binary-relevance NDCG
pub fn ndcg_at_k(ranked: &[ToolId], relevant: &HashSet<&str>, k: usize) -> f64 {
    let dcg: f64 = ranked
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, t)| relevant.contains(t.as_str()))
        .map(|(i, _)| 1.0 / (i as f64 + 2.0).log2())
        .sum();
    let ideal: f64 = (0..relevant.len().min(k))
        .map(|i| 1.0 / (i as f64 + 2.0).log2())
        .sum();
    if ideal == 0.0 {
        0.0
    } else {
        dcg / ideal
    }
}

pub fn average_precision(ranked: &[ToolId], relevant: &HashSet<&str>, k: usize) -> f64 {
    let denom = relevant.len().min(k);
    if denom == 0 {
        return 0.0;
    }
    let mut found = 0;
    let mut sum = 0.0;
    for (i, tool) in ranked.iter().take(k).enumerate() {
        if relevant.contains(tool.as_str()) {
            found += 1;
            sum += found as f64 / (i + 1) as f64;
        }
    }
    sum / denom as f64
}

fn hits(ranked: &[ToolId], relevant: &HashSet<&str>, k: usize) -> usize {
    ranked
        .iter()
        .take(k)
        .filter(|t| relevant.contains(t.as_str()))
        .count()
}

/// Ranking and business metrics averaged over evaluated users
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationReport {
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub ndcg_at_k: f64,
    pub map: f64,
    /// Share of held-out positives that appear in the user's top-K
    pub click_through_rate: f64,
    /// Success rate of held-out interactions on recommended tools
    pub conversion_rate: f64,
    pub satisfaction: f64,
    pub completion_rate: f64,
    /// Distinct recommended tools over candidate tools
    pub coverage: f64,
    pub users_evaluated: usize,
}

pub struct Evaluator<'a> {
    pub ranker: &'a HybridRanker,
    pub profiles: &'a ProfileStore,
    pub profile_config: &'a ProfileConfig,
    pub method: EnsembleMethod,
    pub k: usize,
}

impl Evaluator<'_> {
    /// Rank every known tool for each holdout user using only what the
    /// models could see at training time
    pub fn evaluate(&self, snapshot: &ModelSnapshot, training: &TrainingSet, holdout: &Holdout) -> EvaluationReport {
        let mut report = EvaluationReport::default();
        if holdout.is_empty() || self.k == 0 {
            return report;
        }

        let candidates: Vec<ToolId> = training
            .tools
            .keys()
            .cloned()
            .chain(training.iter().map(|r| r.tool_id.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if candidates.is_empty() {
            return report;
        }

        let history = training.by_user();
        let mut recommended_anywhere: HashSet<ToolId> = HashSet::new();
        let mut positives = 0usize;
        let mut positive_hits = 0usize;
        let mut on_recommended: Vec<&InteractionRecord> = Vec::new();

        for (user, held) in holdout.by_user() {
            let relevant: HashSet<&str> = held
                .iter()
                .filter(|r| r.normalized_signal() >= RELEVANCE_THRESHOLD)
                .map(|r| r.tool_id.as_str())
                .collect();

            let mut profile = UserProfile::new(user);
            for logged in history.get(user).into_iter().flatten() {
                profile.apply(&logged.record, None, self.profile_config);
            }
            let context = held
                .first()
                .map(|r| r.context.clone())
                .unwrap_or_else(InteractionContext::default);

            let request = ScoringRequest {
                user_id: user,
                profile: Some(&profile),
                context: &context,
                candidates: &candidates,
                method: self.method,
                deadline: None,
            };
            let Ok(scored) = self.ranker.score_candidates(snapshot, self.profiles, &request) else {
                continue;
            };
            let ranked: Vec<ToolId> = self
                .ranker
                .rank(scored, Some(&profile), self.k, context_time(&held), false)
                .into_iter()
                .map(|r| r.tool_id)
                .collect();

            let top: HashSet<&str> = ranked.iter().map(String::as_str).collect();
            on_recommended.extend(held.iter().copied().filter(|r| top.contains(r.tool_id.as_str())));
            recommended_anywhere.extend(ranked.iter().cloned());

            if relevant.is_empty() {
                continue;
            }
            positives += relevant.len();
            positive_hits += hits(&ranked, &relevant, self.k);

            report.precision_at_k += precision_at_k(&ranked, &relevant, self.k);
            report.recall_at_k += recall_at_k(&ranked, &relevant, self.k);
            report.ndcg_at_k += ndcg_at_k(&ranked, &relevant, self.k);
            report.map += average_precision(&ranked, &relevant, self.k);
            report.users_evaluated += 1;
        }

        if report.users_evaluated > 0 {
            let n = report.users_evaluated as f64;
            report.precision_at_k /= n;
            report.recall_at_k /= n;
            report.ndcg_at_k /= n;
            report.map /= n;
        }
        if positives > 0 {
            report.click_through_rate = positive_hits as f64 / positives as f64;
        }
        if !on_recommended.is_empty() {
            let n = on_recommended.len() as f64;
            report.conversion_rate = on_recommended.iter().filter(|r| r.outcome.success).count() as f64 / n;
        }
        let held_n = holdout.records.len() as f64;
        report.satisfaction = holdout.records.iter().map(|r| r.outcome.satisfaction).sum::<f64>() / held_n;
        report.completion_rate = holdout
            .records
            .iter()
            .filter(|r| r.outcome.success && !r.outcome.error)
            .count() as f64
            / held_n;
        report.coverage = recommended_anywhere.len() as f64 / candidates.len() as f64;

        report
    }
}

fn context_time(held: &[&InteractionRecord]) -> chrono::DateTime<chrono::Utc> {
    held.iter()
        .map(|r| r.timestamp)
        .min()
        .unwrap_or_else(chrono::Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<ToolId> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_precision_and_recall() {
        let ranked = ids(&["a", "b", "c", "d"]);
        let relevant: HashSet<&str> = ["a", "c", "z"].into_iter().collect();
        assert!((precision_at_k(&ranked, &relevant, 4) - 0.5).abs() < 1e-12);
        assert!((recall_at_k(&ranked, &relevant, 4) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(recall_at_k(&ranked, &HashSet::new(), 4), 0.0);
    }

    #[test]
    fn test_ndcg_perfect_and_partial() {
        let relevant: HashSet<&str> = ["a", "b"].into_iter().collect();
        assert!((ndcg_at_k(&ids(&["a", "b", "c"]), &relevant, 3) - 1.0).abs() < 1e-12);

        let partial = ndcg_at_k(&ids(&["c", "a", "b"]), &relevant, 3);
        assert!(partial > 0.0 && partial < 1.0);
        assert_eq!(ndcg_at_k(&ids(&["c"]), &HashSet::new(), 3), 0.0);
    }

    #[test]
    fn test_average_precision() {
        let relevant: HashSet<&str> = ["a", "c"].into_iter().collect();
        // hits at ranks 1 and 3: (1/1 + 2/3) / 2
        let ap = average_precision(&ids(&["a", "b", "c"]), &relevant, 3);
        assert!((ap - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
    }
}
