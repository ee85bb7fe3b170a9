// ============================================
// Domain Models
// ============================================
//
// Interaction facts, user/tool profiles and the recommendation value types
// shared by every model in the engine.

mod profiles;
mod recommendation;

pub use profiles::{StageStats, ToolProfile, UserProfile};
pub use recommendation::{
    ComponentScores, Explanation, Recommendation, RecommendationRequest, RecommendationSource,
    MAX_RECOMMENDATION_LIMIT,
};

use crate::error::{RecommendationError, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type ToolId = String;

/// Identity of an interaction; resubmitting the same key is a no-op
pub type InteractionKey = (UserId, ToolId, DateTime<Utc>);

pub const MIN_RATING: f64 = 1.0;
pub const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStage {
    Discovery,
    Planning,
    Execution,
    Review,
}

impl WorkflowStage {
    pub const ALL: [WorkflowStage; 4] = [
        WorkflowStage::Discovery,
        WorkflowStage::Planning,
        WorkflowStage::Execution,
        WorkflowStage::Review,
    ];

    pub fn index(self) -> usize {
        match self {
            WorkflowStage::Discovery => 0,
            WorkflowStage::Planning => 1,
            WorkflowStage::Execution => 2,
            WorkflowStage::Review => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Desktop,
    Mobile,
    Tablet,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Night,
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            17..=21 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }

    pub fn index(self) -> usize {
        match self {
            TimeOfDay::Night => 0,
            TimeOfDay::Morning => 1,
            TimeOfDay::Afternoon => 2,
            TimeOfDay::Evening => 3,
        }
    }
}

/// Task context captured with an interaction or a recommendation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionContext {
    pub workflow_stage: Option<WorkflowStage>,
    pub intent: Option<String>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub collaborators: Vec<UserId>,
    #[serde(default)]
    pub device: Device,
    pub time_of_day: Option<TimeOfDay>,
}

impl InteractionContext {
    pub fn with_stage(stage: WorkflowStage) -> Self {
        Self {
            workflow_stage: Some(stage),
            ..Default::default()
        }
    }

    /// Explicit time of day, or the one implied by `at`
    pub fn time_of_day_at(&self, at: DateTime<Utc>) -> TimeOfDay {
        self.time_of_day
            .unwrap_or_else(|| TimeOfDay::from_hour(at.hour()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionOutcome {
    pub success: bool,
    /// 0.0 - 1.0
    pub satisfaction: f64,
    pub completion_time_ms: u64,
    pub error: bool,
    /// 0.0 - 1.0
    pub engagement: f64,
}

impl InteractionOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            satisfaction: 0.8,
            completion_time_ms: 30_000,
            error: false,
            engagement: 0.8,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            satisfaction: 0.2,
            completion_time_ms: 60_000,
            error: true,
            engagement: 0.3,
        }
    }
}

/// Immutable record of one user/tool interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub user_id: UserId,
    pub tool_id: ToolId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: InteractionContext,
    pub outcome: InteractionOutcome,
    /// Explicit 1-5 rating
    pub rating: Option<u8>,
    pub feedback: Option<String>,
}

impl InteractionRecord {
    pub fn new(
        user_id: impl Into<UserId>,
        tool_id: impl Into<ToolId>,
        timestamp: DateTime<Utc>,
        outcome: InteractionOutcome,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tool_id: tool_id.into(),
            timestamp,
            context: InteractionContext::default(),
            outcome,
            rating: None,
            feedback: None,
        }
    }

    pub fn with_context(mut self, context: InteractionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn key(&self) -> InteractionKey {
        (self.user_id.clone(), self.tool_id.clone(), self.timestamp)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(RecommendationError::RequestInvalid(
                "interaction has empty user_id".to_string(),
            ));
        }
        if self.tool_id.trim().is_empty() {
            return Err(RecommendationError::RequestInvalid(
                "interaction has empty tool_id".to_string(),
            ));
        }
        if let Some(rating) = self.rating {
            if !(1..=5).contains(&rating) {
                return Err(RecommendationError::RequestInvalid(format!(
                    "rating {} outside 1-5",
                    rating
                )));
            }
        }
        for (name, value) in [
            ("satisfaction", self.outcome.satisfaction),
            ("engagement", self.outcome.engagement),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RecommendationError::RequestInvalid(format!(
                    "{} {} outside 0-1",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Training target on the 1-5 rating scale.
    ///
    /// Explicit ratings win. Otherwise the implicit outcome is blended
    /// (success 0.5, engagement 0.3, satisfaction 0.2) and halved on error.
    pub fn feedback_signal(&self) -> f64 {
        if let Some(rating) = self.rating {
            return f64::from(rating).clamp(MIN_RATING, MAX_RATING);
        }

        let success = if self.outcome.success { 1.0 } else { 0.0 };
        let implicit = 0.5 * success + 0.3 * self.outcome.engagement + 0.2 * self.outcome.satisfaction;
        let mut signal = MIN_RATING + (MAX_RATING - MIN_RATING) * implicit;
        if self.outcome.error {
            signal *= 0.5;
        }
        signal.clamp(MIN_RATING, MAX_RATING)
    }

    /// Feedback signal mapped onto 0-1
    pub fn normalized_signal(&self) -> f64 {
        (self.feedback_signal() - MIN_RATING) / (MAX_RATING - MIN_RATING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> InteractionRecord {
        InteractionRecord::new(
            "u1",
            "gmail-sender",
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            InteractionOutcome::succeeded(),
        )
    }

    #[test]
    fn test_explicit_rating_wins() {
        let r = record().with_rating(2);
        assert_eq!(r.feedback_signal(), 2.0);
        assert!((r.normalized_signal() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_implicit_signal_penalizes_errors() {
        let ok = record();
        let mut failed = record();
        failed.outcome = InteractionOutcome::failed();

        assert!(ok.feedback_signal() > 4.0);
        assert!(failed.feedback_signal() < 2.0);
        assert!(failed.feedback_signal() >= MIN_RATING);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(record().validate().is_ok());
        assert!(record().with_rating(6).validate().is_err());

        let mut r = record();
        r.user_id = " ".into();
        assert!(r.validate().is_err());

        let mut r = record();
        r.outcome.engagement = 1.5;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_time_of_day_derived_from_timestamp() {
        let ctx = InteractionContext::default();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap();
        assert_eq!(ctx.time_of_day_at(at), TimeOfDay::Afternoon);

        let explicit = InteractionContext {
            time_of_day: Some(TimeOfDay::Night),
            ..Default::default()
        };
        assert_eq!(explicit.time_of_day_at(at), TimeOfDay::Night);
    }
}
