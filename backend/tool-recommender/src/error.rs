use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecommendationError>;

#[derive(Debug, Error)]
pub enum RecommendationError {
    /// Not enough interactions to train or score
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// A single model failed during a training pass; other models are unaffected
    #[error("Model training failed ({model}): {reason}")]
    ModelTrainingFailure { model: String, reason: String },

    #[error("Training exceeded time budget of {0:?}")]
    TrainingTimeout(Duration),

    #[error("Scoring unavailable: {0}")]
    ScoringUnavailable(String),

    #[error("Invalid request: {0}")]
    RequestInvalid(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecommendationError {
    pub fn training(model: impl Into<String>, reason: impl Into<String>) -> Self {
        RecommendationError::ModelTrainingFailure {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller should answer with fallback recommendations
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RecommendationError::RequestInvalid(_))
    }
}

impl From<envy::Error> for RecommendationError {
    fn from(err: envy::Error) -> Self {
        RecommendationError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RecommendationError {
    fn from(err: tokio::task::JoinError) -> Self {
        RecommendationError::Internal(format!("training task failed: {}", err))
    }
}

impl From<prometheus::Error> for RecommendationError {
    fn from(err: prometheus::Error) -> Self {
        RecommendationError::Internal(format!("metrics registration failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_error_display() {
        let err = RecommendationError::training("collaborative", "diverged");
        assert_eq!(
            err.to_string(),
            "Model training failed (collaborative): diverged"
        );
    }

    #[test]
    fn test_request_invalid_is_not_recoverable() {
        assert!(!RecommendationError::RequestInvalid("empty user".into()).is_recoverable());
        assert!(RecommendationError::ScoringUnavailable("no snapshot".into()).is_recoverable());
    }
}
