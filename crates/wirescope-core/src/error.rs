//! Error type shared by every registry and module
//!
//! Each variant carries the complete, human-readable message. `Display`
//! prints the message verbatim so operators see exactly which name and
//! constraint failed.

use thiserror::Error;

/// Core error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed or missing configuration key or shape
    #[error("{0}")]
    InvalidConfig(String),

    /// Referenced tap, input, handler type, policy or module does not exist
    #[error("{0}")]
    NotFound(String),

    /// Duplicate name at any registry level
    #[error("{0}")]
    NameConflict(String),

    /// Declared input type disagrees with the tap's recorded type
    #[error("{0}")]
    TypeMismatch(String),

    /// Handler chaining violates a handler's accepted upstream set
    #[error("{0}")]
    ChainIncompatible(String),

    /// A module's `start()` reported an operational failure
    #[error("{0}")]
    RuntimeStartFailure(String),

    /// Object is still referenced and cannot be removed
    #[error("{0}")]
    InUse(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Short, stable identifier for each error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfig,
    NotFound,
    NameConflict,
    TypeMismatch,
    ChainIncompatible,
    RuntimeStartFailure,
    InUse,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::NameConflict(_) => ErrorKind::NameConflict,
            CoreError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            CoreError::ChainIncompatible(_) => ErrorKind::ChainIncompatible,
            CoreError::RuntimeStartFailure(_) => ErrorKind::RuntimeStartFailure,
            CoreError::InUse(_) => ErrorKind::InUse,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CoreError::InvalidConfig(m)
            | CoreError::NotFound(m)
            | CoreError::NameConflict(m)
            | CoreError::TypeMismatch(m)
            | CoreError::ChainIncompatible(m)
            | CoreError::RuntimeStartFailure(m)
            | CoreError::InUse(m) => m,
        }
    }

    /// Prefix the message with `context`, keeping the error kind
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        let message = format!("{}: {}", context, self.message());
        self.with_message(message)
    }

    fn with_message(self, message: String) -> Self {
        match self {
            CoreError::InvalidConfig(_) => CoreError::InvalidConfig(message),
            CoreError::NotFound(_) => CoreError::NotFound(message),
            CoreError::NameConflict(_) => CoreError::NameConflict(message),
            CoreError::TypeMismatch(_) => CoreError::TypeMismatch(message),
            CoreError::ChainIncompatible(_) => CoreError::ChainIncompatible(message),
            CoreError::RuntimeStartFailure(_) => CoreError::RuntimeStartFailure(message),
            CoreError::InUse(_) => CoreError::InUse(message),
        }
    }
}
