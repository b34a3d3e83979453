//! Engine error types

use crate::handle::GuestHandle;
use thiserror::Error;

/// Errors raised by the engine API and the script evaluator.
#[derive(Debug, Error)]
pub enum VmError {
    /// Script source failed to parse
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// Operation applied to a value of the wrong type
    #[error("TypeError: {0}")]
    Type(String),

    /// Unknown identifier
    #[error("ReferenceError: {0}")]
    Reference(String),

    /// A handle was used after its last release
    #[error("handle is not alive")]
    NotAlive,

    /// A handle from one engine instance was passed to another
    #[error("handle belongs to a different vm")]
    WrongVm,

    /// An uncaught script exception; the handle is owned by the caller
    #[error("uncaught exception: {message}")]
    Exception {
        /// Handle to the thrown guest value
        handle: GuestHandle,
        /// Best-effort string rendering of the thrown value
        message: String,
    },
}

impl VmError {
    /// Create a type error
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::Type(msg.into())
    }

    /// Create a reference error
    pub fn reference_error(msg: impl Into<String>) -> Self {
        Self::Reference(msg.into())
    }

    /// Create a syntax error
    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }
}

/// Result type for engine operations
pub type VmResult<T> = std::result::Result<T, VmError>;
