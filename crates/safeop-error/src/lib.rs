//! # safeop Error
//!
//! Error taxonomy for the safeop operation-resilience layer.
//!
//! Operations wrapped by the resilience layer fail with an [`OperationError`].
//! The variants form a tagged union over the shapes a failure can take
//! (precondition failure, deadline expiry, backend error payload, generic
//! failure with message/code/cause) so that classification never has to
//! guess at optional fields.
//!
//! ## Example
//!
//! ```
//! use safeop_error::{OperationError, Result};
//!
//! fn load_profile(id: &str) -> Result<()> {
//!     if id.is_empty() {
//!         return Err(OperationError::failed("invalid profile id").with_code("22P02"));
//!     }
//!     Ok(())
//! }
//!
//! let err = load_profile("").unwrap_err();
//! assert_eq!(err.code(), Some("22P02"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use thiserror::Error;

/// The error type produced by wrapped operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// A precondition was not met before the operation ran
    #[error("Pre-operation validation failed: {0}")]
    Validation(String),

    /// The operation did not finish before its deadline
    #[error("Operation timeout after {timeout_ms}ms ({operation_id})")]
    Timeout {
        /// Identifier of the timed-out execution
        operation_id: String,
        /// Configured deadline
        timeout_ms: u64,
        /// Time actually spent before giving up
        elapsed_ms: u64,
    },

    /// The backend answered with an error payload
    #[error("Backend error: {message}")]
    Backend {
        /// Error message reported by the backend
        message: String,
        /// Status or error code reported by the backend
        code: Option<String>,
        /// Additional detail text, if any
        details: Option<String>,
    },

    /// Any other failure raised by the operation
    #[error("{message}")]
    Failed {
        /// Human readable message
        message: String,
        /// Optional status or error code
        code: Option<String>,
        /// Text of the underlying cause, if any
        cause: Option<String>,
    },
}

impl OperationError {
    /// Creates a generic failure from a message
    pub fn failed(message: impl Into<String>) -> Self {
        OperationError::Failed {
            message: message.into(),
            code: None,
            cause: None,
        }
    }

    /// Creates a backend failure from a message
    pub fn backend(message: impl Into<String>) -> Self {
        OperationError::Backend {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Creates a precondition failure
    pub fn validation(reason: impl Into<String>) -> Self {
        OperationError::Validation(reason.into())
    }

    /// Attaches a status or error code.
    ///
    /// Only `Backend` and `Failed` carry a code; other variants are returned unchanged.
    pub fn with_code(mut self, new_code: impl Into<String>) -> Self {
        match &mut self {
            OperationError::Backend { code, .. } | OperationError::Failed { code, .. } => {
                *code = Some(new_code.into());
            }
            _ => {}
        }
        self
    }

    /// Attaches the text of an underlying cause to a `Failed` error
    pub fn with_cause(mut self, new_cause: impl Into<String>) -> Self {
        if let OperationError::Failed { cause, .. } = &mut self {
            *cause = Some(new_cause.into());
        }
        self
    }

    /// Full display message of this error
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Status or error code, if the failure carried one
    pub fn code(&self) -> Option<&str> {
        match self {
            OperationError::Backend { code, .. } | OperationError::Failed { code, .. } => {
                code.as_deref()
            }
            _ => None,
        }
    }

    /// Cause or detail text, if any
    pub fn cause(&self) -> Option<&str> {
        match self {
            OperationError::Backend { details, .. } => details.as_deref(),
            OperationError::Failed { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Returns true for precondition failures
    pub fn is_validation(&self) -> bool {
        matches!(self, OperationError::Validation(_))
    }

    /// Returns true when the operation hit its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, OperationError::Timeout { .. })
    }
}

/// Convenient Result type using OperationError
pub type Result<T> = std::result::Result<T, OperationError>;

/// Severity attached to classified errors and logged failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Severity {
    /// Informational, nothing for the user to do
    Low,
    /// Recoverable or user-fixable
    Medium,
    /// The operation could not complete
    High,
    /// A critical operation could not complete
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Extension trait for turning foreign errors into operation failures
pub trait ErrorContext<T> {
    /// Adds context to an error
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Adds context using a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| OperationError::Failed {
            message: format!("{}: {}", ctx.into(), e),
            code: None,
            cause: Some(e.to_string()),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| OperationError::Failed {
            message: format!("{}: {}", f(), e),
            code: None,
            cause: Some(e.to_string()),
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| OperationError::failed(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| OperationError::failed(f()))
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        OperationError::Failed {
            message: format!("{:?}: {}", err.kind(), err),
            code: None,
            cause: err.get_ref().map(|inner| inner.to_string()),
        }
    }
}
