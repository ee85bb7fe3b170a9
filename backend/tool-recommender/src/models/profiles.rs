use super::{InteractionRecord, ToolId, UserId, WorkflowStage};
use crate::config::ProfileConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Cold-start value of every derived user scalar
const NEUTRAL_SCALAR: f64 = 0.5;

/// Per-user behavioral profile, created lazily on first interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    /// Demographic segment used by the demographic cold-start strategy
    pub segment: Option<String>,
    #[serde(default)]
    pub preferences: HashMap<String, String>,
    #[serde(default)]
    pub preferred_categories: HashMap<String, f64>,
    /// Most recent tool last
    #[serde(default)]
    pub recent_tools: VecDeque<ToolId>,
    #[serde(default)]
    pub tool_counts: HashMap<ToolId, u32>,
    #[serde(default)]
    pub last_success: HashMap<ToolId, DateTime<Utc>>,
    pub interaction_count: u32,
    pub learning_rate: f64,
    pub exploration_tendency: f64,
    pub consistency: f64,
    pub adaptability: f64,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the newest interaction folded into the scalars
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            segment: None,
            preferences: HashMap::new(),
            preferred_categories: HashMap::new(),
            recent_tools: VecDeque::new(),
            tool_counts: HashMap::new(),
            last_success: HashMap::new(),
            interaction_count: 0,
            learning_rate: NEUTRAL_SCALAR,
            exploration_tendency: NEUTRAL_SCALAR,
            consistency: NEUTRAL_SCALAR,
            adaptability: NEUTRAL_SCALAR,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn usage_count(&self, tool_id: &str) -> u32 {
        self.tool_counts.get(tool_id).copied().unwrap_or(0)
    }

    /// 1.0 for a tool the user never touched, shrinking with repeat use
    pub fn novelty(&self, tool_id: &str) -> f64 {
        1.0 / (1.0 + f64::from(self.usage_count(tool_id)))
    }

    pub fn recently_completed(&self, tool_id: &str, since: DateTime<Utc>) -> bool {
        self.last_success
            .get(tool_id)
            .map(|at| *at >= since)
            .unwrap_or(false)
    }

    /// Fold one interaction into the profile.
    ///
    /// Counters always advance. Scalars, the recent window and category
    /// preferences only move for records at least as new as `updated_at`,
    /// so late-arriving records cannot roll them back.
    pub fn apply(&mut self, record: &InteractionRecord, category: Option<&str>, config: &ProfileConfig) {
        let previous_uses = self.usage_count(&record.tool_id);
        let is_new_tool = previous_uses == 0;

        self.interaction_count += 1;
        *self.tool_counts.entry(record.tool_id.clone()).or_insert(0) += 1;

        if record.outcome.success && !record.outcome.error {
            let entry = self
                .last_success
                .entry(record.tool_id.clone())
                .or_insert(record.timestamp);
            if record.timestamp > *entry {
                *entry = record.timestamp;
            }
        }

        if self.updated_at.map_or(false, |at| record.timestamp < at) {
            return;
        }

        let alpha = config.decay_alpha;
        let success = if record.outcome.success { 1.0 } else { 0.0 };
        let novel = if is_new_tool { 1.0 } else { 0.0 };

        self.exploration_tendency = ema(self.exploration_tendency, novel, alpha);
        self.consistency = ema(self.consistency, 1.0 - novel, alpha);
        if is_new_tool {
            self.adaptability = ema(self.adaptability, success, alpha);
        } else {
            self.learning_rate = ema(self.learning_rate, success, alpha);
        }

        if let Some(category) = category.filter(|c| !c.is_empty()) {
            let weight = self
                .preferred_categories
                .entry(category.to_string())
                .or_insert(0.0);
            *weight = ema(*weight, record.normalized_signal(), alpha);
        }

        self.recent_tools.push_back(record.tool_id.clone());
        while self.recent_tools.len() > config.recent_window {
            self.recent_tools.pop_front();
        }

        self.updated_at = Some(record.timestamp);
    }
}

fn ema(current: f64, observation: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * current + alpha * observation
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub uses: u64,
    pub successes: u64,
}

/// Per-tool aggregate statistics, seeded from the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProfile {
    pub tool_id: ToolId,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub usage_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_completion_ms: f64,
    pub satisfaction_sum: f64,
    pub first_use_count: u64,
    pub first_use_successes: u64,
    pub repeat_use_count: u64,
    pub repeat_use_successes: u64,
    #[serde(default)]
    pub stage_stats: HashMap<WorkflowStage, StageStats>,
    /// Usage counts by `TimeOfDay::index`
    #[serde(default)]
    pub time_of_day_counts: [u64; 4],
    pub updated_at: Option<DateTime<Utc>>,
}

impl ToolProfile {
    pub fn new(
        tool_id: impl Into<ToolId>,
        category: impl Into<String>,
        description: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            category: category.into(),
            description: description.into(),
            tags,
            usage_count: 0,
            success_count: 0,
            error_count: 0,
            avg_completion_ms: 0.0,
            satisfaction_sum: 0.0,
            first_use_count: 0,
            first_use_successes: 0,
            repeat_use_count: 0,
            repeat_use_successes: 0,
            stage_stats: HashMap::new(),
            time_of_day_counts: [0; 4],
            updated_at: None,
        }
    }

    /// Profile for a tool seen in an interaction but absent from the catalog
    pub fn unknown(tool_id: impl Into<ToolId>) -> Self {
        Self::new(tool_id, "", "", Vec::new())
    }

    pub fn record(&mut self, record: &InteractionRecord, first_use_by_user: bool) {
        let success = record.outcome.success;

        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        if record.outcome.error {
            self.error_count += 1;
        }
        let n = self.usage_count as f64;
        self.avg_completion_ms += (record.outcome.completion_time_ms as f64 - self.avg_completion_ms) / n;
        self.satisfaction_sum += record.outcome.satisfaction;

        if first_use_by_user {
            self.first_use_count += 1;
            self.first_use_successes += u64::from(success);
        } else {
            self.repeat_use_count += 1;
            self.repeat_use_successes += u64::from(success);
        }

        if let Some(stage) = record.context.workflow_stage {
            let stats = self.stage_stats.entry(stage).or_default();
            stats.uses += 1;
            stats.successes += u64::from(success);
        }
        self.time_of_day_counts[record.context.time_of_day_at(record.timestamp).index()] += 1;

        if self.updated_at.map_or(true, |at| record.timestamp > at) {
            self.updated_at = Some(record.timestamp);
        }
    }

    /// Laplace-smoothed success rate
    pub fn success_rate(&self) -> f64 {
        (self.success_count as f64 + 1.0) / (self.usage_count as f64 + 2.0)
    }

    pub fn satisfaction(&self) -> f64 {
        if self.usage_count == 0 {
            0.5
        } else {
            self.satisfaction_sum / self.usage_count as f64
        }
    }

    /// 0-1, grows with average completion time (one minute ~ 0.63)
    pub fn complexity(&self) -> f64 {
        1.0 - (-self.avg_completion_ms / 60_000.0).exp()
    }

    /// Repeat-use success minus first-use success
    pub fn learning_curve(&self) -> f64 {
        if self.first_use_count == 0 || self.repeat_use_count == 0 {
            return 0.0;
        }
        self.repeat_use_successes as f64 / self.repeat_use_count as f64
            - self.first_use_successes as f64 / self.first_use_count as f64
    }

    /// Smoothed success rate of the tool within a workflow stage
    pub fn stage_suitability(&self, stage: WorkflowStage) -> f64 {
        self.stage_stats
            .get(&stage)
            .map(|s| (s.successes as f64 + 1.0) / (s.uses as f64 + 2.0))
            .unwrap_or(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InteractionContext, InteractionOutcome};
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn config() -> ProfileConfig {
        ProfileConfig {
            recent_window: 3,
            decay_alpha: 0.5,
        }
    }

    #[test]
    fn test_recent_window_is_bounded() {
        let mut profile = UserProfile::new("u1");
        for (i, tool) in ["a", "b", "c", "d"].iter().enumerate() {
            let r = InteractionRecord::new("u1", *tool, at(8 + i as u32), InteractionOutcome::succeeded());
            profile.apply(&r, None, &config());
        }
        assert_eq!(profile.recent_tools, VecDeque::from(vec!["b".to_string(), "c".into(), "d".into()]));
        assert_eq!(profile.interaction_count, 4);
    }

    #[test]
    fn test_out_of_order_record_only_updates_counts() {
        let mut profile = UserProfile::new("u1");
        let newer = InteractionRecord::new("u1", "a", at(12), InteractionOutcome::succeeded());
        profile.apply(&newer, Some("email"), &config());
        let snapshot = profile.clone();

        let older = InteractionRecord::new("u1", "b", at(9), InteractionOutcome::failed());
        profile.apply(&older, Some("chat"), &config());

        assert_eq!(profile.interaction_count, 2);
        assert_eq!(profile.usage_count("b"), 1);
        assert_eq!(profile.exploration_tendency, snapshot.exploration_tendency);
        assert_eq!(profile.recent_tools, snapshot.recent_tools);
        assert_eq!(profile.updated_at, Some(at(12)));
        assert!(!profile.preferred_categories.contains_key("chat"));
    }

    #[test]
    fn test_repeat_use_raises_consistency() {
        let mut profile = UserProfile::new("u1");
        for i in 0..3 {
            let r = InteractionRecord::new("u1", "a", at(8) + Duration::hours(i), InteractionOutcome::succeeded());
            profile.apply(&r, None, &config());
        }
        assert!(profile.consistency > 0.5);
        assert!(profile.exploration_tendency < 0.5);
        assert!(profile.learning_rate > 0.5);
        assert!(profile.novelty("a") < 0.5);
        assert_eq!(profile.novelty("z"), 1.0);
    }

    #[test]
    fn test_tool_profile_stats() {
        let mut tool = ToolProfile::new("gmail-sender", "email", "Send mail", vec![]);
        let first = InteractionRecord::new("u1", "gmail-sender", at(9), InteractionOutcome::failed())
            .with_context(InteractionContext::with_stage(WorkflowStage::Execution));
        let repeat = InteractionRecord::new("u1", "gmail-sender", at(10), InteractionOutcome::succeeded())
            .with_context(InteractionContext::with_stage(WorkflowStage::Execution));
        tool.record(&first, true);
        tool.record(&repeat, false);

        assert_eq!(tool.usage_count, 2);
        assert_eq!(tool.error_count, 1);
        assert!((tool.success_rate() - 0.5).abs() < 1e-9);
        assert!((tool.learning_curve() - 1.0).abs() < 1e-9);
        assert!((tool.stage_suitability(WorkflowStage::Execution) - 0.5).abs() < 1e-9);
        assert_eq!(tool.stage_suitability(WorkflowStage::Review), 0.5);
        assert_eq!(tool.time_of_day_counts[crate::models::TimeOfDay::Morning.index()], 2);
    }
}
