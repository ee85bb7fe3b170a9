use super::{InteractionContext, ToolId, UserId};
use crate::error::{RecommendationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

pub const MAX_RECOMMENDATION_LIMIT: usize = 100;

/// Per-algorithm scores on 0-1; `None` means the algorithm had no signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub collaborative: Option<f64>,
    pub content: Option<f64>,
    pub sequential: Option<f64>,
    /// Cold-start estimate fused in place of an absent collaborative score,
    /// or the whole score when no component answered
    pub fallback: Option<f64>,
}

impl ComponentScores {
    pub fn is_empty(&self) -> bool {
        self.collaborative.is_none() && self.content.is_none() && self.sequential.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub similar_users: Vec<(UserId, f64)>,
    pub similar_tools: Vec<(ToolId, f64)>,
    /// Mined sequence ending in the recommended tool
    pub matched_sequence: Vec<ToolId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationSource {
    Hybrid,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub tool_id: ToolId,
    pub score: f64,
    pub components: ComponentScores,
    pub explanation: Explanation,
    pub novelty: f64,
    pub diversity: f64,
    pub contextual_relevance: f64,
    pub collaborative_confidence: f64,
    pub source: RecommendationSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub context: InteractionContext,
    /// Tools to rank; empty means every known tool
    #[serde(default)]
    pub candidates: Vec<ToolId>,
    pub max_results: usize,
    /// Scoring budget; exceeding it switches to the fallback path
    #[serde(default)]
    pub budget: Option<Duration>,
    /// Evaluation time for freshness filtering, defaults to now
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

impl RecommendationRequest {
    pub fn new(user_id: impl Into<UserId>, candidates: Vec<ToolId>, max_results: usize) -> Self {
        Self {
            user_id: user_id.into(),
            context: InteractionContext::default(),
            candidates,
            max_results,
            budget: None,
            requested_at: None,
        }
    }

    pub fn with_context(mut self, context: InteractionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn at(mut self, requested_at: DateTime<Utc>) -> Self {
        self.requested_at = Some(requested_at);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(RecommendationError::RequestInvalid(
                "user_id must not be empty".to_string(),
            ));
        }
        if self.max_results == 0 {
            return Err(RecommendationError::RequestInvalid(
                "max_results must be positive".to_string(),
            ));
        }
        if self.candidates.iter().any(|c| c.trim().is_empty()) {
            return Err(RecommendationError::RequestInvalid(
                "candidate tool ids must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.max_results.min(MAX_RECOMMENDATION_LIMIT)
    }

    /// Candidates with duplicates removed, first occurrence kept
    pub fn unique_candidates(&self) -> Vec<ToolId> {
        let mut seen = HashSet::new();
        self.candidates
            .iter()
            .filter(|c| seen.insert(c.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(RecommendationRequest::new("u1", vec![], 5).validate().is_ok());
        assert!(RecommendationRequest::new("", vec![], 5).validate().is_err());
        assert!(RecommendationRequest::new("u1", vec![], 0).validate().is_err());
        assert!(RecommendationRequest::new("u1", vec!["".into()], 5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_limit_is_capped() {
        let req = RecommendationRequest::new("u1", vec![], 500);
        assert_eq!(req.limit(), MAX_RECOMMENDATION_LIMIT);
    }

    #[test]
    fn test_unique_candidates_keeps_order() {
        let req = RecommendationRequest::new(
            "u1",
            vec!["b".into(), "a".into(), "b".into()],
            5,
        );
        assert_eq!(req.unique_candidates(), vec!["b".to_string(), "a".to_string()]);
    }
}
