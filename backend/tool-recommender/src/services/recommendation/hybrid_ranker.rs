// ============================================
// Hybrid Ranker
// ============================================
//
// Fuses collaborative, content and sequential scores per candidate, then
// post-processes the ranked list:
//   freshness filter → ordering → novelty cap → category diversity repair
//
// Cold users and tools get the configured cold-start estimate in place of
// the collaborative score.

use super::collaborative_filtering::ColdStartStrategy;
use crate::config::{CollaborativeConfig, HybridConfig};
use crate::error::{RecommendationError, Result};
use crate::models::{
    ComponentScores, Explanation, InteractionContext, Recommendation, RecommendationSource, ToolId,
    Urgency, UserProfile, WorkflowStage,
};
use crate::services::training::ModelSnapshot;
use crate::store::ProfileStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

const EXPLANATION_NEIGHBORS: usize = 3;
/// Cascade tier for candidates only the fallback could score
const FALLBACK_TIER: u8 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnsembleMethod {
    #[default]
    Weighted,
    Stacking,
    Switching,
    Cascade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Collaborative,
    Content,
    Sequential,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Collaborative, Component::Content, Component::Sequential];

    /// Order used by the cascade method
    pub const CASCADE: [Component; 3] = [Component::Collaborative, Component::Sequential, Component::Content];

    pub fn name(self) -> &'static str {
        match self {
            Component::Collaborative => "collaborative",
            Component::Content => "content",
            Component::Sequential => "sequential",
        }
    }

    pub fn score_in(self, scores: &ComponentScores) -> Option<f64> {
        match self {
            Component::Collaborative => scores.collaborative,
            Component::Content => scores.content,
            Component::Sequential => scores.sequential,
        }
    }
}

/// Per-algorithm fusion weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub collaborative: f64,
    pub content: f64,
    pub sequential: f64,
}

impl HybridWeights {
    /// Create default balanced weights
    pub fn balanced() -> Self {
        Self {
            collaborative: 0.4,
            content: 0.3,
            sequential: 0.3,
        }
    }

    pub fn from_config(config: &HybridConfig) -> Self {
        Self {
            collaborative: config.collaborative_weight,
            content: config.content_weight,
            sequential: config.sequential_weight,
        }
    }

    /// Weights must be non-negative with a positive sum
    pub fn validate(&self) -> Result<()> {
        let all = [self.collaborative, self.content, self.sequential];
        if all.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(RecommendationError::Config(format!(
                "Weights must be non-negative (got {:?})",
                self
            )));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(RecommendationError::Config(
                "Weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn weight(&self, component: Component) -> f64 {
        match component {
            Component::Collaborative => self.collaborative,
            Component::Content => self.content,
            Component::Sequential => self.sequential,
        }
    }

    /// Scaled to sum to 1.0
    pub fn normalized(self) -> Self {
        let sum = self.collaborative + self.content + self.sequential;
        if sum <= 0.0 {
            return Self::balanced();
        }
        Self {
            collaborative: self.collaborative / sum,
            content: self.content / sum,
            sequential: self.sequential / sum,
        }
    }
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self::balanced()
    }
}

pub const STACKING_FEATURES: usize = 12;

/// Logistic meta-model over component scores and context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingModel {
    weights: Vec<f64>,
    bias: f64,
    pub samples: usize,
}

impl StackingModel {
    /// Scores (absent → 0), presence flags, stage one-hot, urgency, collaborators
    pub fn features(scores: &ComponentScores, context: &InteractionContext) -> Vec<f64> {
        let mut f = Vec::with_capacity(STACKING_FEATURES);
        for component in Component::ALL {
            f.push(component.score_in(scores).unwrap_or(0.0));
        }
        for component in Component::ALL {
            f.push(if component.score_in(scores).is_some() { 1.0 } else { 0.0 });
        }
        for stage in WorkflowStage::ALL {
            f.push(if context.workflow_stage == Some(stage) { 1.0 } else { 0.0 });
        }
        f.push(if context.urgency == Urgency::High { 1.0 } else { 0.0 });
        f.push(if context.collaborators.is_empty() { 0.0 } else { 1.0 });
        f
    }

    /// Batch gradient descent on log-loss; `None` with fewer than two samples
    pub fn train(samples: &[(Vec<f64>, f64)], epochs: usize, learning_rate: f64) -> Option<Self> {
        if samples.len() < 2 {
            return None;
        }
        let mut model = Self {
            weights: vec![0.0; STACKING_FEATURES],
            bias: 0.0,
            samples: samples.len(),
        };
        let n = samples.len() as f64;

        for _ in 0..epochs {
            let mut grad_w = vec![0.0; STACKING_FEATURES];
            let mut grad_b = 0.0;
            for (features, label) in samples {
                let err = model.predict(features) - label;
                for (g, x) in grad_w.iter_mut().zip(features) {
                    *g += err * x;
                }
                grad_b += err;
            }
            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= learning_rate * g / n;
            }
            model.bias -= learning_rate * grad_b / n;
        }
        Some(model)
    }

    pub fn predict(&self, features: &[f64]) -> f64 {
        let z: f64 = self.bias + self.weights.iter().zip(features).map(|(w, x)| w * x).sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }
}

/// One candidate after fusion, before post-processing
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub tool_id: ToolId,
    pub score: f64,
    pub tier: u8,
    pub components: ComponentScores,
    pub confidence: f64,
    pub popularity: f64,
    pub category: String,
    pub novelty: f64,
    pub contextual_relevance: f64,
    pub explanation: Explanation,
}

impl ScoredCandidate {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then(other.score.total_cmp(&self.score))
            .then(other.confidence.total_cmp(&self.confidence))
            .then(other.popularity.total_cmp(&self.popularity))
            .then_with(|| self.tool_id.cmp(&other.tool_id))
    }
}

/// Inputs for scoring one user's candidate list
pub struct ScoringRequest<'a> {
    pub user_id: &'a str,
    pub profile: Option<&'a UserProfile>,
    pub context: &'a InteractionContext,
    pub candidates: &'a [ToolId],
    pub method: EnsembleMethod,
    /// Scoring past this instant fails with `ScoringUnavailable`
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct HybridRanker {
    config: HybridConfig,
    min_interactions: u32,
    cold_start: ColdStartStrategy,
}

impl HybridRanker {
    pub fn new(config: HybridConfig, collaborative: &CollaborativeConfig) -> Result<Self> {
        HybridWeights::from_config(&config).validate()?;
        Ok(Self {
            config,
            min_interactions: collaborative.min_interactions,
            cold_start: collaborative.cold_start_strategy,
        })
    }

    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    /// Context-adjusted weights, renormalized to sum to 1.0
    pub fn dynamic_weights(&self, base: HybridWeights, context: &InteractionContext, user_interactions: u32) -> HybridWeights {
        if !self.config.dynamic_weighting {
            return base.normalized();
        }
        let mut w = base;

        match context.workflow_stage {
            Some(WorkflowStage::Execution) => w.sequential *= 1.5,
            Some(WorkflowStage::Discovery) => w.content *= 1.3,
            Some(WorkflowStage::Planning) => w.collaborative *= 1.2,
            Some(WorkflowStage::Review) => w.content *= 1.2,
            None => {}
        }
        if user_interactions < self.min_interactions {
            w.content *= 1.5;
            w.collaborative *= 0.5;
        }
        match context.urgency {
            Urgency::High => w.sequential *= 1.2,
            Urgency::Low => w.content *= 1.1,
            Urgency::Normal => {}
        }
        if !context.collaborators.is_empty() {
            w.collaborative *= 1.2;
        }

        w.normalized()
    }

    /// Fused score and cascade tier, `None` when no component has a score
    pub fn fuse(
        &self,
        method: EnsembleMethod,
        scores: &ComponentScores,
        weights: &HybridWeights,
        user_interactions: u32,
        stacking: Option<&StackingModel>,
        context: &InteractionContext,
    ) -> Option<(f64, u8)> {
        if scores.is_empty() {
            return None;
        }

        match method {
            EnsembleMethod::Weighted => Some((weighted(scores, weights), 0)),
            EnsembleMethod::Stacking => match stacking {
                Some(model) => Some((model.predict(&StackingModel::features(scores, context)), 0)),
                None => Some((weighted(scores, weights), 0)),
            },
            EnsembleMethod::Switching => {
                let chosen = if user_interactions >= self.min_interactions {
                    scores.collaborative.or(scores.content)
                } else {
                    scores.content
                };
                Some((chosen.unwrap_or_else(|| weighted(scores, weights)), 0))
            }
            EnsembleMethod::Cascade => Component::CASCADE
                .iter()
                .enumerate()
                .find_map(|(tier, c)| c.score_in(scores).map(|s| (s, tier as u8))),
        }
    }

    /// Score every candidate against the published snapshot
    pub fn score_candidates(
        &self,
        snapshot: &ModelSnapshot,
        profiles: &ProfileStore,
        request: &ScoringRequest,
    ) -> Result<Vec<ScoredCandidate>> {
        let user = request.user_id;
        let recent: Vec<ToolId> = request
            .profile
            .map(|p| p.recent_tools.iter().cloned().collect())
            .unwrap_or_default();
        let stage = request.context.workflow_stage;
        let segment = request.profile.and_then(|p| p.segment.as_deref());
        let user_interactions = request.profile.map(|p| p.interaction_count).unwrap_or(0);

        let collaborative = snapshot.collaborative.as_ref();
        let content = snapshot.content.as_ref();
        let sequential = snapshot.sequential.as_ref();
        let user_vector = content.and_then(|m| m.user_vector(user, &recent));
        let weights = self.dynamic_weights(snapshot.weights, request.context, user_interactions);

        let mut scored = Vec::with_capacity(request.candidates.len());
        for tool_id in request.candidates {
            if let Some(deadline) = request.deadline {
                if Instant::now() > deadline {
                    return Err(RecommendationError::ScoringUnavailable(
                        "scoring budget exceeded".to_string(),
                    ));
                }
            }

            let mut components = ComponentScores {
                collaborative: collaborative.and_then(|m| m.score(user, tool_id, self.min_interactions)),
                content: match (content, &user_vector) {
                    (Some(m), Some(v)) => m.score(v, tool_id),
                    _ => None,
                },
                sequential: sequential.and_then(|m| m.score(tool_id, &recent, stage)),
                fallback: None,
            };

            // Below min_interactions the configured strategy stands in for the
            // collaborative slot; cascade consults it only after every component
            let hint = content.and_then(|m| m.max_similarity(tool_id, &recent));
            let cold = match collaborative {
                Some(m) if components.collaborative.is_none() => {
                    m.cold_start_score(self.cold_start, tool_id, segment, hint)
                }
                Some(_) => None,
                None => hint,
            };
            let mut fusion = components.clone();
            if request.method != EnsembleMethod::Cascade && collaborative.is_some() {
                fusion.collaborative = fusion.collaborative.or(cold);
                components.fallback = cold;
            }
            let fused = self.fuse(
                request.method,
                &fusion,
                &weights,
                user_interactions,
                snapshot.stacking.as_ref(),
                request.context,
            );
            let (score, tier) = match fused {
                Some(fused) => fused,
                None => {
                    let fallback = cold.unwrap_or(0.0);
                    components.fallback = Some(fallback);
                    let tier = if request.method == EnsembleMethod::Cascade { FALLBACK_TIER } else { 0 };
                    (fallback, tier)
                }
            };

            let tool = profiles.tool(tool_id);
            let mut explanation = Explanation::default();
            if let Some(m) = collaborative.filter(|_| components.collaborative.is_some()) {
                explanation.similar_users = m.similar_users(user, EXPLANATION_NEIGHBORS);
            }
            if let Some(m) = content {
                let mut similar: Vec<(ToolId, f64)> = recent
                    .iter()
                    .filter(|t| *t != tool_id)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .filter_map(|t| m.tool_similarity(tool_id, t).map(|s| (t.clone(), s)))
                    .filter(|(_, s)| *s > 0.0)
                    .collect();
                similar.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                similar.truncate(EXPLANATION_NEIGHBORS);
                explanation.similar_tools = similar;
            }
            if let Some(pattern) = sequential.and_then(|m| m.matched_pattern(tool_id, &recent)) {
                explanation.matched_sequence = pattern.tools.clone();
            }

            scored.push(ScoredCandidate {
                tool_id: tool_id.clone(),
                score,
                tier,
                confidence: if components.collaborative.is_some() {
                    collaborative.map_or(0.0, |m| m.confidence(user, tool_id, self.min_interactions))
                } else {
                    0.0
                },
                popularity: collaborative.and_then(|m| m.popularity(tool_id)).unwrap_or(0.0),
                components,
                category: tool.as_ref().map(|t| t.category.clone()).unwrap_or_default(),
                novelty: request.profile.map_or(1.0, |p| p.novelty(tool_id)),
                contextual_relevance: contextual_relevance(tool.as_ref(), stage),
                explanation,
            });
        }

        Ok(scored)
    }

    /// Non-ML scoring from live tool statistics, used when the models cannot
    /// answer in time
    pub fn fallback_candidates(&self, profiles: &ProfileStore, request: &ScoringRequest) -> Vec<ScoredCandidate> {
        let stage = request.context.workflow_stage;
        let tools: HashMap<&ToolId, Option<crate::models::ToolProfile>> = request
            .candidates
            .iter()
            .map(|id| (id, profiles.tool(id)))
            .collect();
        let weighted_usage = |t: &crate::models::ToolProfile| t.usage_count as f64 * t.success_rate();
        let max_usage = tools
            .values()
            .flatten()
            .map(weighted_usage)
            .fold(0.0, f64::max);

        request
            .candidates
            .iter()
            .map(|tool_id| {
                let tool = tools.get(tool_id).and_then(|t| t.as_ref());
                let popularity = match tool {
                    Some(t) if max_usage > 0.0 => (1.0 + weighted_usage(t)).ln() / (1.0 + max_usage).ln(),
                    _ => 0.0,
                };
                ScoredCandidate {
                    tool_id: tool_id.clone(),
                    score: popularity,
                    tier: 0,
                    components: ComponentScores {
                        fallback: Some(popularity),
                        ..Default::default()
                    },
                    confidence: 0.0,
                    popularity,
                    category: tool.map(|t| t.category.clone()).unwrap_or_default(),
                    novelty: request.profile.map_or(1.0, |p| p.novelty(tool_id)),
                    contextual_relevance: contextual_relevance(tool, stage),
                    explanation: Explanation::default(),
                }
            })
            .collect()
    }

    /// Freshness filter, ordering, novelty cap and diversity repair
    pub fn rank(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        profile: Option<&UserProfile>,
        k: usize,
        now: DateTime<Utc>,
        apply_freshness: bool,
    ) -> Vec<Recommendation> {
        if apply_freshness {
            if let Some(profile) = profile {
                let since = now - self.config.freshness_window();
                candidates.retain(|c| !profile.recently_completed(&c.tool_id, since));
            }
        }
        candidates.sort_by(ScoredCandidate::rank_cmp);

        let is_novel = |c: &ScoredCandidate| c.novelty >= self.config.novelty_threshold;
        let novelty_cap = (self.config.max_novelty_fraction * k as f64).ceil() as usize;

        // Novel picks beyond the cap are deferred and only used to fill
        // slots nothing else can.
        let mut selected: Vec<ScoredCandidate> = Vec::with_capacity(k);
        let mut deferred = Vec::new();
        let mut rest = Vec::new();
        let mut novel_count = 0;
        for candidate in candidates {
            if selected.len() >= k {
                rest.push(candidate);
            } else if is_novel(&candidate) && novel_count >= novelty_cap {
                deferred.push(candidate);
            } else {
                novel_count += usize::from(is_novel(&candidate));
                selected.push(candidate);
            }
        }
        let mut leftovers = Vec::new();
        for candidate in deferred {
            if selected.len() < k {
                selected.push(candidate);
            } else {
                leftovers.push(candidate);
            }
        }
        leftovers.extend(rest);
        leftovers.sort_by(ScoredCandidate::rank_cmp);
        novel_count = selected.iter().filter(|c| is_novel(c)).count();

        self.repair_diversity(&mut selected, &mut leftovers, novel_count, novelty_cap, &is_novel);
        selected.sort_by(ScoredCandidate::rank_cmp);

        let mut category_counts: HashMap<&str, usize> = HashMap::new();
        for c in &selected {
            *category_counts.entry(c.category.as_str()).or_insert(0) += 1;
        }
        let len = selected.len().max(1) as f64;
        let diversity: Vec<f64> = selected
            .iter()
            .map(|c| 1.0 - (category_counts[c.category.as_str()] as f64 - 1.0) / len)
            .collect();

        selected
            .into_iter()
            .zip(diversity)
            .map(|(c, diversity)| Recommendation {
                source: if c.components.is_empty() {
                    RecommendationSource::Fallback
                } else {
                    RecommendationSource::Hybrid
                },
                tool_id: c.tool_id,
                score: c.score,
                components: c.components,
                explanation: c.explanation,
                novelty: c.novelty,
                diversity,
                contextual_relevance: c.contextual_relevance,
                collaborative_confidence: c.confidence,
            })
            .collect()
    }

    /// Swap duplicated-category picks for the best unused categories until
    /// `min_category_diversity` is met or nothing can be swapped
    fn repair_diversity(
        &self,
        selected: &mut Vec<ScoredCandidate>,
        leftovers: &mut Vec<ScoredCandidate>,
        mut novel_count: usize,
        novelty_cap: usize,
        is_novel: &dyn Fn(&ScoredCandidate) -> bool,
    ) {
        loop {
            let categories: HashSet<&str> = selected
                .iter()
                .map(|c| c.category.as_str())
                .filter(|c| !c.is_empty())
                .collect();
            if categories.len() >= self.config.min_category_diversity {
                return;
            }

            let mut counts: HashMap<&str, usize> = HashMap::new();
            for c in selected.iter() {
                *counts.entry(c.category.as_str()).or_insert(0) += 1;
            }
            // Lowest-ranked pick whose category is duplicated (or unknown)
            let Some(out_idx) = selected
                .iter()
                .rposition(|c| c.category.is_empty() || counts[c.category.as_str()] > 1)
            else {
                return;
            };
            let out_novel = is_novel(&selected[out_idx]);

            let Some(in_idx) = leftovers.iter().position(|c| {
                !c.category.is_empty()
                    && !categories.contains(c.category.as_str())
                    && (!is_novel(c) || out_novel || novel_count < novelty_cap)
            }) else {
                return;
            };

            let incoming = leftovers.remove(in_idx);
            novel_count = novel_count + usize::from(is_novel(&incoming)) - usize::from(out_novel);
            let outgoing = std::mem::replace(&mut selected[out_idx], incoming);
            leftovers.push(outgoing);
        }
    }
}

fn weighted(scores: &ComponentScores, weights: &HybridWeights) -> f64 {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    let mut plain = Vec::new();
    for component in Component::ALL {
        if let Some(s) = component.score_in(scores) {
            let w = weights.weight(component);
            sum += w * s;
            weight_sum += w;
            plain.push(s);
        }
    }
    if weight_sum > 0.0 {
        sum / weight_sum
    } else if plain.is_empty() {
        0.0
    } else {
        plain.iter().sum::<f64>() / plain.len() as f64
    }
}

fn contextual_relevance(tool: Option<&crate::models::ToolProfile>, stage: Option<WorkflowStage>) -> f64 {
    match (tool, stage) {
        (Some(t), Some(stage)) => t.stage_suitability(stage),
        (Some(t), None) => t.success_rate(),
        (None, _) => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InteractionRecord;

    fn ranker(config: HybridConfig) -> HybridRanker {
        HybridRanker::new(config, &CollaborativeConfig::default()).unwrap()
    }

    fn candidate(id: &str, score: f64, category: &str, novelty: f64) -> ScoredCandidate {
        ScoredCandidate {
            tool_id: id.to_string(),
            score,
            tier: 0,
            components: ComponentScores {
                content: Some(score),
                ..Default::default()
            },
            confidence: 0.0,
            popularity: 0.0,
            category: category.to_string(),
            novelty,
            contextual_relevance: 0.5,
            explanation: Explanation::default(),
        }
    }

    #[test]
    fn test_only_content_present_equals_content() {
        let r = ranker(HybridConfig::default());
        let scores = ComponentScores {
            content: Some(0.42),
            ..Default::default()
        };
        let (score, tier) = r
            .fuse(
                EnsembleMethod::Weighted,
                &scores,
                &HybridWeights::balanced(),
                10,
                None,
                &InteractionContext::default(),
            )
            .unwrap();
        assert!((score - 0.42).abs() < 1e-12);
        assert_eq!(tier, 0);
    }

    #[test]
    fn test_weighted_renormalizes_over_present() {
        let scores = ComponentScores {
            collaborative: Some(1.0),
            sequential: Some(0.0),
            ..Default::default()
        };
        let w = HybridWeights {
            collaborative: 0.4,
            content: 0.3,
            sequential: 0.3,
        };
        assert!((weighted(&scores, &w) - 0.4 / 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_no_components_is_none() {
        let r = ranker(HybridConfig::default());
        for method in [
            EnsembleMethod::Weighted,
            EnsembleMethod::Stacking,
            EnsembleMethod::Switching,
            EnsembleMethod::Cascade,
        ] {
            assert!(r
                .fuse(method, &ComponentScores::default(), &HybridWeights::balanced(), 0, None, &InteractionContext::default())
                .is_none());
        }
    }

    #[test]
    fn test_switching_and_cascade() {
        let r = ranker(HybridConfig::default());
        let scores = ComponentScores {
            collaborative: Some(0.9),
            content: Some(0.2),
            sequential: Some(0.5),
            fallback: None,
        };
        let ctx = InteractionContext::default();
        let w = HybridWeights::balanced();

        assert_eq!(r.fuse(EnsembleMethod::Switching, &scores, &w, 10, None, &ctx), Some((0.9, 0)));
        assert_eq!(r.fuse(EnsembleMethod::Switching, &scores, &w, 1, None, &ctx), Some((0.2, 0)));

        let no_collab = ComponentScores {
            collaborative: None,
            ..scores.clone()
        };
        assert_eq!(r.fuse(EnsembleMethod::Cascade, &no_collab, &w, 10, None, &ctx), Some((0.5, 1)));
    }

    #[test]
    fn test_stacking_without_model_falls_back_to_weighted() {
        let r = ranker(HybridConfig::default());
        let scores = ComponentScores {
            collaborative: Some(0.8),
            content: Some(0.4),
            ..Default::default()
        };
        let w = HybridWeights::balanced();
        let ctx = InteractionContext::default();
        assert_eq!(
            r.fuse(EnsembleMethod::Stacking, &scores, &w, 5, None, &ctx),
            r.fuse(EnsembleMethod::Weighted, &scores, &w, 5, None, &ctx)
        );
    }

    #[test]
    fn test_stacking_model_learns_signal() {
        let ctx = InteractionContext::default();
        let mut samples = Vec::new();
        for i in 0..20 {
            let good = i % 2 == 0;
            let s = if good { 0.9 } else { 0.1 };
            let scores = ComponentScores {
                collaborative: Some(s),
                content: Some(s),
                ..Default::default()
            };
            samples.push((StackingModel::features(&scores, &ctx), if good { 1.0 } else { 0.0 }));
        }
        let model = StackingModel::train(&samples, 500, 0.5).unwrap();
        assert!(model.predict(&samples[0].0) > model.predict(&samples[1].0));
        assert!(StackingModel::train(&samples[..1], 10, 0.5).is_none());
    }

    #[test]
    fn test_dynamic_weights_favor_sequential_in_execution() {
        let r = ranker(HybridConfig::default());
        let base = HybridWeights::balanced();
        let exec = r.dynamic_weights(base, &InteractionContext::with_stage(WorkflowStage::Execution), 10);
        let plain = r.dynamic_weights(base, &InteractionContext::default(), 10);
        assert!(exec.sequential > plain.sequential);
        assert!((exec.collaborative + exec.content + exec.sequential - 1.0).abs() < 1e-12);

        let cold = r.dynamic_weights(base, &InteractionContext::default(), 0);
        assert!(cold.content > plain.content);
        assert!(cold.collaborative < plain.collaborative);
    }

    #[test]
    fn test_dynamic_weighting_disabled_only_normalizes() {
        let r = ranker(HybridConfig {
            dynamic_weighting: false,
            ..Default::default()
        });
        let base = HybridWeights {
            collaborative: 2.0,
            content: 1.0,
            sequential: 1.0,
        };
        let w = r.dynamic_weights(base, &InteractionContext::with_stage(WorkflowStage::Execution), 0);
        assert!((w.collaborative - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_ties_break_by_confidence_popularity_then_id() {
        let r = ranker(HybridConfig {
            min_category_diversity: 0,
            max_novelty_fraction: 1.0,
            ..Default::default()
        });
        let mut a = candidate("b-tool", 0.5, "x", 0.0);
        a.confidence = 0.9;
        let mut b = candidate("a-tool", 0.5, "x", 0.0);
        b.popularity = 0.9;
        let c = candidate("c-tool", 0.5, "x", 0.0);
        let d = candidate("0-tool", 0.5, "x", 0.0);

        let ranked = r.rank(vec![c, d, b, a], None, 4, Utc::now(), true);
        let ids: Vec<_> = ranked.iter().map(|r| r.tool_id.as_str()).collect();
        assert_eq!(ids, vec!["b-tool", "a-tool", "0-tool", "c-tool"]);
    }

    #[test]
    fn test_novelty_cap_defers_novel_picks() {
        let r = ranker(HybridConfig {
            max_novelty_fraction: 0.25,
            novelty_threshold: 0.8,
            min_category_diversity: 0,
            ..Default::default()
        });
        let candidates = vec![
            candidate("n1", 0.9, "x", 1.0),
            candidate("n2", 0.8, "x", 1.0),
            candidate("f1", 0.5, "x", 0.2),
            candidate("f2", 0.4, "x", 0.2),
            candidate("f3", 0.3, "x", 0.2),
        ];
        let ranked = r.rank(candidates, None, 4, Utc::now(), true);
        let ids: Vec<_> = ranked.iter().map(|r| r.tool_id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "f1", "f2", "f3"]);
    }

    #[test]
    fn test_novelty_cap_fills_when_nothing_else_left() {
        let r = ranker(HybridConfig {
            max_novelty_fraction: 0.25,
            min_category_diversity: 0,
            ..Default::default()
        });
        let candidates = vec![candidate("n1", 0.9, "x", 1.0), candidate("n2", 0.8, "x", 1.0)];
        assert_eq!(r.rank(candidates, None, 4, Utc::now(), true).len(), 2);
    }

    #[test]
    fn test_diversity_repair_swaps_in_new_category() {
        let r = ranker(HybridConfig {
            min_category_diversity: 2,
            max_novelty_fraction: 1.0,
            ..Default::default()
        });
        let candidates = vec![
            candidate("mail-1", 0.9, "email", 0.0),
            candidate("mail-2", 0.8, "email", 0.0),
            candidate("mail-3", 0.7, "email", 0.0),
            candidate("chat-1", 0.2, "chat", 0.0),
        ];
        let ranked = r.rank(candidates, None, 3, Utc::now(), true);
        let ids: Vec<_> = ranked.iter().map(|r| r.tool_id.as_str()).collect();
        assert_eq!(ids, vec!["mail-1", "mail-2", "chat-1"]);
        assert!(ranked[2].diversity > ranked[0].diversity);
    }

    #[test]
    fn test_freshness_filter_drops_recent_success() {
        let r = ranker(HybridConfig::default());
        let now = Utc::now();
        let mut profile = UserProfile::new("u1");
        let recent = InteractionRecord::new(
            "u1",
            "gmail-sender",
            now - chrono::Duration::minutes(5),
            crate::models::InteractionOutcome::succeeded(),
        );
        profile.apply(&recent, None, &crate::config::ProfileConfig::default());

        let candidates = vec![candidate("gmail-sender", 0.9, "email", 0.5), candidate("slack-sender", 0.3, "chat", 1.0)];
        let ranked = r.rank(candidates.clone(), Some(&profile), 5, now, true);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].tool_id, "slack-sender");

        assert_eq!(r.rank(candidates, Some(&profile), 5, now, false).len(), 2);
    }
}
