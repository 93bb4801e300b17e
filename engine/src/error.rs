//! Error types for the Tillsync engine.

use crate::{ConflictId, EntityId};
use thiserror::Error;

/// All possible errors from the Tillsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("invalid conflict export: {0}")]
    InvalidExport(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::ConflictNotFound("cfl-1".into());
        assert_eq!(err.to_string(), "conflict not found: cfl-1");

        let err = Error::InvalidExport("not a JSON array".into());
        assert_eq!(err.to_string(), "invalid conflict export: not a JSON array");
    }
}
