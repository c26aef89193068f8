//! Validation errors for core domain values

use thiserror::Error;

/// Errors raised while validating names and image references
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImage {
        reference: String,
        reason: &'static str,
    },
}
