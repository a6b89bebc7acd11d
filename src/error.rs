//! Custom error types for the wfst-search decoder.
//!
//! Every failure inside the decoder is reported as a [`SearchError`] and bubbled
//! up with `?` to the orchestrator boundary. The variants follow the failure
//! classes of the decoder: configuration, transducer structure, resources and
//! call sequence.

use std::io;
use thiserror::Error;

/// Primary error type for the decoder, covering all possible error cases.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Invalid option value or unsupported option combination.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transducer exceeds an addressable limit or a fixed bound
    /// (layers, pushdown stack).
    #[error("Structure error: {0}")]
    Structure(String),

    /// A memory pool reached its element limit.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// An operation was called in the wrong lifecycle state.
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// Malformed transducer or weight data.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Worker failures and broken internal invariants.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SearchError {
    /// Short label used for metric dimensions.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::Config(_) => "config",
            SearchError::Structure(_) => "structure",
            SearchError::OutOfMemory(_) => "out_of_memory",
            SearchError::Sequence(_) => "sequence",
            SearchError::InvalidInput(_) => "invalid_input",
            SearchError::Internal(_) => "internal",
            SearchError::Io(_) => "io",
            SearchError::Json(_) => "json",
        }
    }
}

/// Convenience type alias for Results with SearchError.
pub type Result<T> = std::result::Result<T, SearchError>;

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to the error.
    fn with_static_context(self, context: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| SearchError::InvalidInput(format!("{}: {}", f(), e)))
    }

    fn with_static_context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| SearchError::InvalidInput(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SearchError::Sequence("load transducer first".to_string());
        assert_eq!(err.to_string(), "Sequence error: load transducer first");
        assert_eq!(err.kind(), "sequence");
    }

    #[test]
    fn test_with_context() {
        let parsed: std::result::Result<u32, std::num::ParseIntError> = "x".parse();
        let err = parsed.with_context(|| "reading unit".to_string()).unwrap_err();
        assert!(matches!(err, SearchError::InvalidInput(_)));
        assert!(err.to_string().contains("reading unit"));
    }
}
