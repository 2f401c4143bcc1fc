//! Error types for the host value model.

use thiserror::Error;

/// Why a [`Callable`](crate::Callable) invocation failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The target method does not exist or the callable is null.
    #[error("invalid method")]
    InvalidMethod,

    /// The object the callable is bound to no longer exists.
    #[error("instance is null")]
    InstanceIsNull,

    /// More arguments were supplied than the callable accepts.
    #[error("too many arguments: expected {expected}, got {given}")]
    TooManyArguments { expected: usize, given: usize },

    /// Fewer arguments were supplied than the callable requires.
    #[error("too few arguments: expected {expected}, got {given}")]
    TooFewArguments { expected: usize, given: usize },

    /// An argument had the wrong type.
    #[error("invalid argument #{index}: expected {expected}, got {found}")]
    InvalidArgument {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    /// The callee reported a failure of its own.
    #[error("{message}")]
    Failed { message: String },
}

impl CallError {
    pub fn failed(message: impl Into<String>) -> Self {
        CallError::Failed {
            message: message.into(),
        }
    }

    /// Build the matching arity error for `given` arguments against a fixed `expected`.
    pub fn arity(expected: usize, given: usize) -> Option<Self> {
        use std::cmp::Ordering;
        match given.cmp(&expected) {
            Ordering::Equal => None,
            Ordering::Greater => Some(CallError::TooManyArguments { expected, given }),
            Ordering::Less => Some(CallError::TooFewArguments { expected, given }),
        }
    }
}

/// Failure to extract a Rust value from a [`Variant`](crate::Variant).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("integer overflow: {value} doesn't fit in {target_type}")]
    IntegerOverflow {
        value: i64,
        target_type: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_errors() {
        assert_eq!(CallError::arity(2, 2), None);
        assert_eq!(
            CallError::arity(1, 3),
            Some(CallError::TooManyArguments {
                expected: 1,
                given: 3
            })
        );
        assert_eq!(
            CallError::arity(2, 0).map(|e| e.to_string()),
            Some("too few arguments: expected 2, got 0".to_string())
        );
    }
}
