/// Structured error types for the chatvault-core library.
///
/// Uses `thiserror` for better API surface and error composition.
/// The orchestration crate (chatvault-etl) can still use `anyhow` for
/// convenience, but library consumers get structured, composable errors.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for chatvault-core operations
#[derive(Error, Debug)]
pub enum EtlError {
    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// JSON parsing or serialization failed
    #[error("JSON error at {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },

    /// Source file or directory not found
    #[error("Source not found: {path:?}")]
    NotFound { path: PathBuf },

    /// Container archive could not be read
    #[error("Malformed archive {path:?}: {reason}")]
    MalformedArchive { path: PathBuf, reason: String },

    /// Multiple eligible JSON members and no selection hint
    #[error("Ambiguous archive source, candidates: {}", candidates.join(", "))]
    AmbiguousSource { candidates: Vec<String> },

    /// Raw document failed structural validation
    #[error("Schema validation failed: {reason}")]
    Schema { reason: String },

    /// Phase state machine violation
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    /// Unrecognized phase name
    #[error("Invalid phase name '{name}' (expected extract, transform or load)")]
    InvalidPhase { name: String },

    /// Unrecognized phase status
    #[error("Invalid phase status '{name}' (expected pending, running, completed or failed)")]
    InvalidStatus { name: String },

    /// Checkpoint schema version mismatch
    #[error("Incompatible checkpoint version {found} (expected {expected})")]
    CheckpointVersion { found: u32, expected: u32 },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

/// Result type alias for chatvault-core operations
pub type Result<T> = std::result::Result<T, EtlError>;

impl EtlError {
    /// Create a JSON error with context
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Create a not-found error
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a malformed archive error
    pub fn malformed_archive(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a schema validation error
    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EtlError::schema("missing conversations list");
        assert_eq!(
            err.to_string(),
            "Schema validation failed: missing conversations list"
        );

        let err = EtlError::AmbiguousSource {
            candidates: vec!["a.json".into(), "b.json".into()],
        };
        assert!(err.to_string().contains("a.json"));
        assert!(err.to_string().contains("b.json"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let etl_err: EtlError = io_err.into();

        assert!(matches!(etl_err, EtlError::Io { .. }));
    }
}
