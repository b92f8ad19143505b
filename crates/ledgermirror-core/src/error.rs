//! Error types for the ledgermirror pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried locally with backoff, never surfaced.
    Transient,
    /// Recorded, the chunk is skipped and the checkpoint still advances.
    Permanent,
    /// Invalid operator request, rejected before any side effect.
    Configuration,
}

/// Errors that can occur while ingesting, deriving or recovering.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timed out after {after_ms}ms: {operation}")]
    Timeout { operation: String, after_ms: u64 },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("invalid request: {0}")]
    Config(String),

    #[error("unknown worker '{0}'")]
    UnknownWorker(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::Timeout { .. } | Self::Rpc(_) | Self::Storage(_) => {
                ErrorClass::Transient
            }
            Self::Config(_) | Self::UnknownWorker(_) => ErrorClass::Configuration,
            Self::Permanent(_) | Self::Handler { .. } | Self::Aborted { .. } | Self::Other(_) => {
                ErrorClass::Permanent
            }
        }
    }

    /// Returns `true` if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Shorthand for a malformed-data failure raised by a processor.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Permanent(format!("malformed payload: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(IndexerError::Rpc("connection reset".into()).is_transient());
        assert!(IndexerError::Timeout { operation: "chunk".into(), after_ms: 10 }.is_transient());
        assert_eq!(IndexerError::permanent("bad shape").class(), ErrorClass::Permanent);
        assert_eq!(
            IndexerError::UnknownWorker("nope".into()).class(),
            ErrorClass::Configuration
        );
    }

    #[test]
    fn json_errors_are_permanent() {
        let err: IndexerError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.class(), ErrorClass::Permanent);
    }
}
