use crate::error::{RecommendationError, Result};
use crate::services::recommendation::{
    CollaborativeFilteringModel, Component, ContentBasedModel, HybridWeights, SequentialModel, StackingModel,
};
use crate::store::Sequence;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the serving path reads, published as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    /// Every component was trained on log positions below this
    pub cutoff: Sequence,
    pub collaborative: Option<CollaborativeFilteringModel>,
    pub content: Option<ContentBasedModel>,
    pub sequential: Option<SequentialModel>,
    pub weights: HybridWeights,
    pub stacking: Option<StackingModel>,
}

impl ModelSnapshot {
    pub fn empty(weights: HybridWeights) -> Self {
        Self {
            version: 0,
            trained_at: Utc::now(),
            cutoff: 0,
            collaborative: None,
            content: None,
            sequential: None,
            weights,
            stacking: None,
        }
    }

    pub fn has_models(&self) -> bool {
        self.collaborative.is_some() || self.content.is_some() || self.sequential.is_some()
    }

    /// Copy keeping a single component, for measuring it in isolation
    pub fn only(&self, component: Component) -> Self {
        Self {
            version: self.version,
            trained_at: self.trained_at,
            cutoff: self.cutoff,
            collaborative: self.collaborative.clone().filter(|_| component == Component::Collaborative),
            content: self.content.clone().filter(|_| component == Component::Content),
            sequential: self.sequential.clone().filter(|_| component == Component::Sequential),
            weights: self.weights,
            stacking: None,
        }
    }

    pub fn watermark(&self, component: Component) -> Option<Sequence> {
        match component {
            Component::Collaborative => self.collaborative.as_ref().map(|m| m.metadata.trained_through),
            Component::Content => self.content.as_ref().map(|m| m.metadata.trained_through),
            Component::Sequential => self.sequential.as_ref().map(|m| m.metadata.trained_through),
        }
    }

    /// Lowest watermark across the trained components
    pub fn min_trained_through(&self) -> Sequence {
        Component::ALL
            .into_iter()
            .filter_map(|c| self.watermark(c))
            .min()
            .unwrap_or(0)
    }

    /// No component may be ahead of the cutoff and vector sizes must agree
    pub fn consistency_check(&self) -> Result<()> {
        let components = [
            ("collaborative", self.collaborative.as_ref().map(|m| (m.metadata.trained_through, m.dimensions_consistent()))),
            ("content", self.content.as_ref().map(|m| (m.metadata.trained_through, m.dimensions_consistent()))),
            ("sequential", self.sequential.as_ref().map(|m| (m.metadata.trained_through, true))),
        ];

        for (name, state) in components {
            let Some((through, consistent)) = state else {
                continue;
            };
            if through > self.cutoff {
                return Err(RecommendationError::Internal(format!(
                    "{} model trained through {} beyond snapshot cutoff {}",
                    name, through, self.cutoff
                )));
            }
            if !consistent {
                return Err(RecommendationError::Internal(format!(
                    "{} model has inconsistent vector dimensions",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Move every watermark to `at`. A restored snapshot refers to a log
    /// that no longer exists, so positions restart with the new log.
    pub fn rebase(&mut self, at: Sequence) {
        self.cutoff = at;
        if let Some(m) = self.collaborative.as_mut() {
            m.metadata.trained_through = at;
        }
        if let Some(m) = self.content.as_mut() {
            m.metadata.trained_through = at;
        }
        if let Some(m) = self.sequential.as_mut() {
            m.metadata.trained_through = at;
        }
    }

    /// Write to a sibling temp file, then rename over `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!(version = self.version, path = %path.display(), "Snapshot persisted");
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let snapshot: Self = serde_json::from_slice(&raw)?;
        snapshot.consistency_check()?;
        info!(
            version = snapshot.version,
            cutoff = snapshot.cutoff,
            path = %path.display(),
            "Snapshot restored"
        );
        Ok(snapshot)
    }
}

/// Published snapshot; readers clone the `Arc` and never see a partial swap
#[derive(Debug)]
pub struct SnapshotHandle {
    current: RwLock<Arc<ModelSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: ModelSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<ModelSnapshot> {
        self.current.read().clone()
    }

    pub fn publish(&self, snapshot: ModelSnapshot) -> Arc<ModelSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = snapshot.clone();
        snapshot
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollaborativeConfig;
    use crate::models::{InteractionOutcome, InteractionRecord};
    use crate::services::training::TrainingSet;
    use std::sync::atomic::AtomicBool;

    fn trained_snapshot() -> ModelSnapshot {
        let base = Utc::now();
        let records = (0..6)
            .map(|i| {
                InteractionRecord::new(
                    format!("u{}", i % 2),
                    format!("t{}", i % 3),
                    base + chrono::Duration::seconds(i),
                    InteractionOutcome::succeeded(),
                )
            })
            .collect();
        let data = TrainingSet::from_records(records);
        let cf = CollaborativeFilteringModel::train(&data, &CollaborativeConfig::default(), &AtomicBool::new(false)).unwrap();

        ModelSnapshot {
            version: 3,
            cutoff: data.through,
            collaborative: Some(cf),
            ..ModelSnapshot::empty(HybridWeights::balanced())
        }
    }

    #[test]
    fn test_consistency_rejects_component_beyond_cutoff() {
        let mut snapshot = trained_snapshot();
        assert!(snapshot.consistency_check().is_ok());

        snapshot.cutoff = 2;
        assert!(snapshot.consistency_check().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("snapshot.json");
        let snapshot = trained_snapshot();

        snapshot.save_to(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let restored = ModelSnapshot::load_from(&path).unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(restored.cutoff, snapshot.cutoff);
        assert!(restored.collaborative.is_some());
    }

    #[test]
    fn test_handle_publish_swaps_whole_snapshot() {
        let handle = SnapshotHandle::new(ModelSnapshot::empty(HybridWeights::balanced()));
        let before = handle.load();

        handle.publish(trained_snapshot());
        assert_eq!(before.version, 0);
        assert!(!before.has_models());
        assert_eq!(handle.version(), 3);
        assert!(handle.load().has_models());
    }
}
