//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// A channel segment does not fit inside the site's pixel buffer
    #[error("Segment [{offset}, {offset}+{length}) exceeds buffer of {width} pixels")]
    SegmentOutOfRange {
        offset: usize,
        length: usize,
        width: usize,
    },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for configuration text
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Shorthand for an [`DomainError::InvalidFieldValue`].
    pub fn invalid(
        field: impl Into<String>,
        value: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidFieldValue {
            field: field.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
