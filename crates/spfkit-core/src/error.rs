//! Evaluation errors
//!
//! Each variant is terminal for the domain being evaluated and maps onto one
//! of the SPF result categories.

use crate::result::SpfResult;
use thiserror::Error;

/// Error raised while evaluating a policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpfError {
    /// No applicable policy
    #[error("none: {0}")]
    None(String),

    /// Malformed policy or macro, or a processing limit was exceeded
    #[error("permerror: {0}")]
    PermError(String),

    /// Transient DNS failure
    #[error("temperror: {0}")]
    TempError(String),
}

impl SpfError {
    pub fn none(msg: impl Into<String>) -> Self {
        SpfError::None(msg.into())
    }

    pub fn perm(msg: impl Into<String>) -> Self {
        SpfError::PermError(msg.into())
    }

    pub fn temp(msg: impl Into<String>) -> Self {
        SpfError::TempError(msg.into())
    }

    /// Result category this error resolves to
    pub fn result(&self) -> SpfResult {
        match self {
            SpfError::None(_) => SpfResult::None,
            SpfError::PermError(_) => SpfResult::PermError,
            SpfError::TempError(_) => SpfResult::TempError,
        }
    }
}
