//! Fiber error taxonomy

use thiserror::Error;

use super::item::{Fault, TypeTag};
use super::wait::Need;

/// Errors raised by the fiber engine.
///
/// Everything except [`FiberError::Unhandled`] is a protocol violation by a
/// continuation or host and always fails the turn.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FiberError {
    #[error("frame '{target}' registered more than one resume handler")]
    MultipleResumeHandler { target: String },

    #[error("frame '{target}' returned without registering a resume handler")]
    NoResumeHandler { target: String },

    #[error("invalid need: expected {need}, have {have}")]
    InvalidNeed { need: Need, have: Need },

    #[error("cannot {operation} while a continuation is running")]
    Busy { operation: &'static str },

    #[error("invalid type: expected '{expected}', got '{actual}'")]
    InvalidType { expected: TypeTag, actual: TypeTag },

    #[error("no continuation registered for '{0}'")]
    UnknownContinuation(String),

    #[error("unhandled fault: {0}")]
    Unhandled(Fault),
}

impl FiberError {
    pub fn is_violation(&self) -> bool {
        !matches!(self, FiberError::Unhandled(_))
    }
}
