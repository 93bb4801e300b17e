//! Unified error handling for the sync client.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("engine error: {0}")]
    Engine(#[from] tillsync_engine::Error),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("step '{0}' timed out")]
    StepTimeout(String),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),
}

impl ClientError {
    /// Convenience constructor for transaction step failures.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        ClientError::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ClientError::step("debit-inventory", "stock row missing");
        assert_eq!(
            err.to_string(),
            "step 'debit-inventory' failed: stock row missing"
        );

        let err = ClientError::StepTimeout("post-order".into());
        assert_eq!(err.to_string(), "step 'post-order' timed out");
    }
}
