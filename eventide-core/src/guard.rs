//! Business-rule guards for aggregate command methods.
//!
//! Guards run before any event is applied, so a failed guard leaves the
//! aggregate untouched.

use thiserror::Error;

/// A business rule rejected a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// An argument is invalid regardless of aggregate state.
    #[error("invalid argument `{argument}`: {message}")]
    InvalidArgument { argument: String, message: String },
    /// The command is not allowed in the aggregate's current state.
    #[error("invalid state: {message}")]
    InvalidState { message: String },
}

impl GuardError {
    /// The rule's message without the argument name.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument { message, .. } | Self::InvalidState { message } => message,
        }
    }
}

/// Require `condition` to hold for `argument`.
///
/// # Errors
///
/// Returns [`GuardError::InvalidArgument`] when `condition` is false.
pub fn argument(condition: bool, argument: &str, message: &str) -> Result<(), GuardError> {
    if condition {
        Ok(())
    } else {
        Err(GuardError::InvalidArgument {
            argument: argument.to_string(),
            message: message.to_string(),
        })
    }
}

/// Require the aggregate to be in a state where `condition` holds.
///
/// # Errors
///
/// Returns [`GuardError::InvalidState`] when `condition` is false.
pub fn state(condition: bool, message: &str) -> Result<(), GuardError> {
    if condition {
        Ok(())
    } else {
        Err(GuardError::InvalidState {
            message: message.to_string(),
        })
    }
}

/// Require a non-empty, non-blank string argument.
///
/// # Errors
///
/// Returns [`GuardError::InvalidArgument`] when `value` is empty or only
/// whitespace.
pub fn not_empty(value: &str, argument: &str) -> Result<(), GuardError> {
    self::argument(
        !value.trim().is_empty(),
        argument,
        "must not be null or empty",
    )
}
