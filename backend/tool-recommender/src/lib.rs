//! Hybrid tool recommendation with online learning.
//!
//! [`RecommendationEngine`] owns the interaction log, user and tool profiles
//! and the published model snapshot. Collaborative, content and sequential
//! models are trained off the serving path and swapped in whole.

pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod services;
pub mod store;

pub use config::EngineConfig;
pub use error::{RecommendationError, Result};
pub use models::{
    InteractionContext, InteractionOutcome, InteractionRecord, Recommendation, RecommendationRequest,
    RecommendationSource, WorkflowStage,
};
pub use services::recommendation::{AnalyticsReport, RecommendationEngine, RecordOutcome};
pub use services::training::{TrainingMode, TrainingResult};
pub use store::{InMemoryCatalog, ToolCatalog, ToolMetadata};
