//! Error types for Magpie

use thiserror::Error;

/// Main error type for the fragment store
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A required field was missing or malformed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller referenced something that does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An internal invariant was violated inside a transaction
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// A stored vector payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Database operation failed
    #[error("Database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Schema bootstrap failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Embedding collaborator failed
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Attach the operation name to a raw sqlx failure.
pub(crate) trait DbContext<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> DbContext<T> for std::result::Result<T, sqlx::Error> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| MemoryError::Database { op, source })
    }
}

impl MemoryError {
    /// True for failures that signal caller misuse rather than storage trouble.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, MemoryError::Validation(_) | MemoryError::NotFound(_))
    }
}

/// Reject empty or whitespace-only required fields.
pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::Validation(format!("{field} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_rejects_blank_values() {
        assert!(require("agent", "ada").is_ok());
        let err = require("agent", "  \t").unwrap_err();
        assert_eq!(err.to_string(), "Validation error: agent is required");
        assert!(err.is_caller_error());
    }

    #[test]
    fn database_errors_name_the_operation() {
        let err = Err::<(), _>(sqlx::Error::RowNotFound).op("get_state").unwrap_err();
        assert!(err.to_string().starts_with("Database error during get_state"));
        assert!(!err.is_caller_error());
        assert!(std::error::Error::source(&err).is_some());
    }
}
