use crate::models::{InteractionRecord, ToolId, ToolProfile, UserId};
use crate::store::{LoggedInteraction, Sequence};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Immutable view of the data a training pass works from
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub records: Vec<LoggedInteraction>,
    pub tools: HashMap<ToolId, ToolProfile>,
    pub segments: HashMap<UserId, String>,
    /// Log position the set was cut at (exclusive)
    pub through: Sequence,
}

impl TrainingSet {
    pub fn new(
        records: Vec<LoggedInteraction>,
        tools: HashMap<ToolId, ToolProfile>,
        segments: HashMap<UserId, String>,
        through: Sequence,
    ) -> Self {
        Self {
            records,
            tools,
            segments,
            through,
        }
    }

    /// Set over plain records numbered from zero, with no tool metadata
    pub fn from_records(records: Vec<InteractionRecord>) -> Self {
        let through = records.len() as Sequence;
        let records = records
            .into_iter()
            .enumerate()
            .map(|(i, record)| LoggedInteraction {
                seq: i as Sequence,
                record,
            })
            .collect();
        Self::new(records, HashMap::new(), HashMap::new(), through)
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolProfile>) -> Self {
        self.tools = tools.into_iter().map(|t| (t.tool_id.clone(), t)).collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InteractionRecord> {
        self.records.iter().map(|l| &l.record)
    }

    /// Records at or beyond a component's watermark
    pub fn since(&self, watermark: Sequence) -> impl Iterator<Item = &InteractionRecord> {
        self.records
            .iter()
            .filter(move |l| l.seq >= watermark)
            .map(|l| &l.record)
    }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.iter().map(|r| r.timestamp).max()
    }

    /// Each user's records in chronological order (log order breaks ties)
    pub fn by_user(&self) -> HashMap<&str, Vec<&LoggedInteraction>> {
        let mut grouped: HashMap<&str, Vec<&LoggedInteraction>> = HashMap::new();
        for logged in &self.records {
            grouped
                .entry(logged.record.user_id.as_str())
                .or_default()
                .push(logged);
        }
        for history in grouped.values_mut() {
            history.sort_by(|a, b| {
                a.record
                    .timestamp
                    .cmp(&b.record.timestamp)
                    .then(a.seq.cmp(&b.seq))
            });
        }
        grouped
    }

    /// Hold out the chronologically last `fraction` of every user's history.
    ///
    /// Users always keep at least one training record.
    pub fn holdout(&self, fraction: f64) -> Holdout {
        let mut seqs = HashSet::new();
        let mut records = Vec::new();

        if fraction > 0.0 {
            for history in self.by_user().values() {
                let n = history.len();
                let take = ((n as f64 * fraction).round() as usize).min(n.saturating_sub(1));
                for logged in &history[n - take..] {
                    seqs.insert(logged.seq);
                    records.push(logged.record.clone());
                }
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.user_id.cmp(&b.user_id)));

        Holdout { records, seqs }
    }

    /// Copy of this set with the holdout records removed
    pub fn without(&self, holdout: &Holdout) -> TrainingSet {
        TrainingSet {
            records: self
                .records
                .iter()
                .filter(|l| !holdout.seqs.contains(&l.seq))
                .cloned()
                .collect(),
            tools: self.tools.clone(),
            segments: self.segments.clone(),
            through: self.through,
        }
    }
}

/// Evaluation split: most recent interactions per user
#[derive(Debug, Clone, Default)]
pub struct Holdout {
    pub records: Vec<InteractionRecord>,
    seqs: HashSet<Sequence>,
}

impl Holdout {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn by_user(&self) -> HashMap<&str, Vec<&InteractionRecord>> {
        let mut grouped: HashMap<&str, Vec<&InteractionRecord>> = HashMap::new();
        for record in &self.records {
            grouped.entry(record.user_id.as_str()).or_default().push(record);
        }
        grouped
    }
}
