//! Error types for the grid crate.

use thiserror::Error;
use trellis_llm::LlmError;

/// Result type alias using the grid error type.
pub type Result<T> = std::result::Result<T, GridError>;

/// Error type for grid operations.
#[derive(Debug, Error)]
pub enum GridError {
    /// The reasoning service returned data that does not conform to the
    /// requested schema or references invalid item positions.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// The reasoning service or an enrichment collaborator failed outright.
    #[error("Upstream failure: {0}")]
    Upstream(#[source] LlmError),

    /// Index bookkeeping broke an internal invariant. This is a programming
    /// error, not bad collaborator data.
    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),
}

impl GridError {
    /// Create a schema violation error.
    pub fn schema_violation(msg: impl Into<String>) -> Self {
        Self::SchemaViolation(msg.into())
    }

    /// Create an index-out-of-range error.
    pub fn index_out_of_range(msg: impl Into<String>) -> Self {
        Self::IndexOutOfRange(msg.into())
    }
}

impl From<LlmError> for GridError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Schema(msg) => GridError::SchemaViolation(msg),
            other => GridError::Upstream(other),
        }
    }
}
