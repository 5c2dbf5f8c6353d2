//! Error classification
//!
//! Maps a failure to an [`ErrorKind`], a retryability flag and a severity.
//! Classification is a pure function of the error's message and code; the
//! checks run in a fixed priority order and the first match wins.

use safeop_error::{OperationError, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "fetch",
    "connection",
    "offline",
    "disconnected",
    "unreachable",
    "timeout",
    "dns",
    "resolve",
    "connectivity",
];

const RATE_LIMIT_KEYWORDS: &[&str] = &["rate limit", "too many requests"];
const SERVER_KEYWORDS: &[&str] = &["internal server error"];
const TIMEOUT_KEYWORDS: &[&str] = &["timed out"];
const AUTH_KEYWORDS: &[&str] = &["unauthorized", "authentication"];
const PERMISSION_KEYWORDS: &[&str] = &["permission", "forbidden"];
const VALIDATION_KEYWORDS: &[&str] = &["constraint", "validation", "invalid"];

/// Failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity problem between client and backend
    Network,
    /// Backend asked the client to slow down
    RateLimit,
    /// Backend failed internally (5xx)
    ServerError,
    /// Request did not complete in time
    Timeout,
    /// Session missing or expired
    AuthError,
    /// Caller lacks the rights for this operation
    PermissionError,
    /// Input rejected by the backend
    ValidationError,
    /// Anything not recognised
    Unknown,
}

impl ErrorKind {
    /// User-facing description of a failure of this kind
    pub fn user_message(&self, operation_name: &str) -> String {
        match self {
            ErrorKind::Network => {
                "Connection problem. Please check your internet connection and try again."
                    .to_string()
            }
            ErrorKind::RateLimit => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            ErrorKind::AuthError => {
                "Your session has expired. Please refresh the page and log in again.".to_string()
            }
            ErrorKind::PermissionError => {
                "You don't have permission to perform this action.".to_string()
            }
            ErrorKind::ValidationError => {
                "The data provided is invalid. Please check your input and try again.".to_string()
            }
            _ => format!(
                "{} failed. Please try again or contact support if the issue persists.",
                operation_name
            ),
        }
    }

    /// Whether a failure of this kind may be parked in the offline queue
    pub fn is_queueable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::AuthError | ErrorKind::PermissionError | ErrorKind::ValidationError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Recovery step recommended for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry, waiting longer than usual
    RetryWithLongerDelay,
    /// Retry with a longer deadline
    RetryWithLongerTimeout,
    /// Ask the user to sign in again
    RequireReauth,
    /// Tell the user the action is not allowed
    ShowPermissionError,
    /// Ask the user to fix their input
    ValidateInputData,
    /// Show a generic failure message
    ShowGenericError,
}

/// Result of classifying a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    /// Failure category
    pub kind: ErrorKind,
    /// Whether another attempt may succeed
    pub is_retryable: bool,
    /// Severity of the failure
    pub severity: Severity,
    /// Recommended recovery step
    pub suggested_action: SuggestedAction,
}

impl ErrorAnalysis {
    fn new(
        kind: ErrorKind,
        is_retryable: bool,
        severity: Severity,
        suggested_action: SuggestedAction,
    ) -> Self {
        Self {
            kind,
            is_retryable,
            severity,
            suggested_action,
        }
    }

    /// Analysis of an unrecognised failure
    pub fn unknown() -> Self {
        Self::new(
            ErrorKind::Unknown,
            false,
            Severity::Medium,
            SuggestedAction::ShowGenericError,
        )
    }
}

/// Classifies an operation failure
pub fn classify(error: &OperationError) -> ErrorAnalysis {
    match error.cause() {
        Some(cause) => classify_parts(&format!("{} {}", error, cause), error.code()),
        None => classify_parts(&error.to_string(), error.code()),
    }
}

/// Classifies a failure from its raw message and optional status/error code
pub fn classify_parts(message: &str, code: Option<&str>) -> ErrorAnalysis {
    let msg = message.to_lowercase();
    let code = code.map(str::trim).filter(|c| !c.is_empty());

    if msg.trim().is_empty() && code.is_none() {
        return ErrorAnalysis::unknown();
    }

    let status = code.and_then(|c| c.parse::<u16>().ok());
    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| msg.contains(k));

    if contains_any(NETWORK_KEYWORDS) {
        return ErrorAnalysis::new(
            ErrorKind::Network,
            true,
            Severity::Medium,
            SuggestedAction::RetryWithBackoff,
        );
    }

    if contains_any(RATE_LIMIT_KEYWORDS) || status == Some(429) {
        return ErrorAnalysis::new(
            ErrorKind::RateLimit,
            true,
            Severity::Medium,
            SuggestedAction::RetryWithLongerDelay,
        );
    }

    if contains_any(SERVER_KEYWORDS) || matches!(status, Some(500..=599)) {
        return ErrorAnalysis::new(
            ErrorKind::ServerError,
            true,
            Severity::High,
            SuggestedAction::RetryWithBackoff,
        );
    }

    if contains_any(TIMEOUT_KEYWORDS)
        || status == Some(408)
        || code.is_some_and(|c| c.eq_ignore_ascii_case("etimedout"))
    {
        return ErrorAnalysis::new(
            ErrorKind::Timeout,
            true,
            Severity::Medium,
            SuggestedAction::RetryWithLongerTimeout,
        );
    }

    if contains_any(AUTH_KEYWORDS) || status == Some(401) {
        return ErrorAnalysis::new(
            ErrorKind::AuthError,
            false,
            Severity::High,
            SuggestedAction::RequireReauth,
        );
    }

    if contains_any(PERMISSION_KEYWORDS) || status == Some(403) {
        return ErrorAnalysis::new(
            ErrorKind::PermissionError,
            false,
            Severity::High,
            SuggestedAction::ShowPermissionError,
        );
    }

    if contains_any(VALIDATION_KEYWORDS) {
        return ErrorAnalysis::new(
            ErrorKind::ValidationError,
            false,
            Severity::Medium,
            SuggestedAction::ValidateInputData,
        );
    }

    ErrorAnalysis::unknown()
}
