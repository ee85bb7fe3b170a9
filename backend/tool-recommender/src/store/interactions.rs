use crate::models::{InteractionKey, InteractionRecord};
use parking_lot::RwLock;
use std::collections::HashSet;

/// Position of a record in the append-only log
pub type Sequence = u64;

/// Record plus its log position
#[derive(Debug, Clone)]
pub struct LoggedInteraction {
    pub seq: Sequence,
    pub record: InteractionRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(Sequence),
    Duplicate,
}

#[derive(Default)]
struct Log {
    records: Vec<InteractionRecord>,
    keys: HashSet<InteractionKey>,
}

/// Append-only interaction log, idempotent per `(user, tool, timestamp)`.
///
/// The tail beyond a snapshot's watermark is the training queue.
#[derive(Default)]
pub struct InteractionStore {
    log: RwLock<Log>,
}

impl InteractionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: InteractionRecord) -> AppendOutcome {
        let mut log = self.log.write();
        if !log.keys.insert(record.key()) {
            return AppendOutcome::Duplicate;
        }
        let seq = log.records.len() as Sequence;
        log.records.push(record);
        AppendOutcome::Appended(seq)
    }

    pub fn len(&self) -> Sequence {
        self.log.read().records.len() as Sequence
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records in `[from, to)`, clamped to the log bounds
    pub fn range(&self, from: Sequence, to: Sequence) -> Vec<LoggedInteraction> {
        let log = self.log.read();
        let end = (to as usize).min(log.records.len());
        let start = (from as usize).min(end);
        log.records[start..end]
            .iter()
            .enumerate()
            .map(|(offset, record)| LoggedInteraction {
                seq: (start + offset) as Sequence,
                record: record.clone(),
            })
            .collect()
    }

    /// Number of records at or beyond `watermark`
    pub fn pending_since(&self, watermark: Sequence) -> usize {
        self.len().saturating_sub(watermark) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InteractionOutcome;
    use chrono::{TimeZone, Utc};

    fn record(tool: &str, minute: u32) -> InteractionRecord {
        InteractionRecord::new(
            "u1",
            tool,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            InteractionOutcome::succeeded(),
        )
    }

    #[test]
    fn test_duplicate_append_is_noop() {
        let store = InteractionStore::new();
        assert_eq!(store.append(record("a", 0)), AppendOutcome::Appended(0));
        assert_eq!(store.append(record("a", 0)), AppendOutcome::Duplicate);
        assert_eq!(store.append(record("a", 1)), AppendOutcome::Appended(1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_range_is_clamped_and_sequenced() {
        let store = InteractionStore::new();
        for m in 0..5 {
            store.append(record("a", m));
        }
        let tail = store.range(3, 100);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 3);
        assert!(store.range(10, 20).is_empty());
        assert_eq!(store.pending_since(2), 3);
        assert_eq!(store.pending_since(9), 0);
    }
}
