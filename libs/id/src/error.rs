//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The name string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The name exceeds the maximum length.
    #[error("{kind} '{value}' is longer than {max} characters")]
    TooLong {
        kind: &'static str,
        value: String,
        max: usize,
    },

    /// The name contains a character outside the allowed set.
    #[error("{kind} '{value}' contains illegal character '{character}'")]
    IllegalCharacter {
        kind: &'static str,
        value: String,
        character: char,
    },

    /// A composite id does not have the expected number of parts.
    #[error("invalid {kind} '{value}': expected {expected}")]
    InvalidFormat {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
