//! Error types shared across the engine and store boundaries.

use std::time::Duration;

/// Failures reported by a package engine adapter.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The addressed release or repository does not exist in the engine.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool { matches!(self, EngineError::NotFound(_)) }
    pub fn is_cancelled(&self) -> bool { matches!(self, EngineError::Cancelled) }
}

/// True when any error in the chain is an engine not-found.
pub fn is_engine_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.downcast_ref::<EngineError>().map(EngineError::is_not_found).unwrap_or(false))
}

/// True when the chain carries an engine cancellation, i.e. the controller is
/// shutting down rather than the operation failing.
pub fn is_engine_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.downcast_ref::<EngineError>().map(EngineError::is_cancelled).unwrap_or(false))
}

/// Failures reported by the declarative object store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic concurrency check failed; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_found_through_context() {
        let err = anyhow::Error::new(EngineError::Cancelled).context("helm upgrade");
        assert!(is_engine_cancelled(&err));
        assert!(!is_engine_not_found(&err));
        let timeout = anyhow::Error::new(EngineError::Timeout(std::time::Duration::from_secs(1)));
        assert!(!is_engine_cancelled(&timeout));
    }
}
