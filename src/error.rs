//! Error types for the Callgate crate.

use std::convert::Infallible;

use thiserror::Error;

/// Errors raised while building or configuring a gate.
#[derive(Error, Debug)]
pub enum CallgateError {
    /// A limit or window value that can never admit anything.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// No async runtime to host the window resetter
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Callgate operations.
pub type Result<T> = std::result::Result<T, CallgateError>;

/// Error returned by a gated call.
///
/// `E` is the error type of the wrapped action. It is passed through
/// unchanged; the gate never retries or rewrites it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError<E = Infallible> {
    /// The gate was shut down before the caller was admitted.
    #[error("admission gate is closed")]
    Closed,

    /// The action itself failed after being admitted.
    #[error("action failed: {0}")]
    Action(E),
}

impl<E> GateError<E> {
    /// Returns `true` if the call was refused because the gate is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, GateError::Closed)
    }

    /// Extract the action's own error, if that is what failed.
    pub fn into_action_error(self) -> Option<E> {
        match self {
            GateError::Action(e) => Some(e),
            GateError::Closed => None,
        }
    }
}

impl GateError<Infallible> {
    /// Re-type an admission-only error for use with any action error type.
    pub fn widen<E>(self) -> GateError<E> {
        match self {
            GateError::Closed => GateError::Closed,
            GateError::Action(never) => match never {},
        }
    }
}
