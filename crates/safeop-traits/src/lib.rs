//! # safeop Traits
//!
//! Interfaces between the resilience layer and the collaborators it calls into.
//! The layer never talks to a concrete backend SDK, UI toolkit or logger; it is
//! handed implementations of these traits instead.
//!
//! ## Core Traits
//!
//! - [`Backend`] - Auth-user lookup, table queries, auth-state subscription
//! - [`Notifier`] - Transient user notifications (banner/toast)
//! - [`ErrorSink`] - Structured error logging
//! - [`Sleeper`] - Injectable delay used between retries and queue items
//!
//! ## Backend replies
//!
//! Backend calls answer with a `{data, error}` pair. [`BackendReply`] turns such
//! a reply into a `Result`, so an error payload is raised as an
//! [`OperationError`] instead of flowing back to the caller as data:
//!
//! ```
//! use safeop_traits::{BackendError, BackendReply, BackendResponse};
//!
//! let ok: BackendResponse<u32> = BackendResponse::ok(7);
//! assert_eq!(ok.into_data().unwrap(), Some(7));
//!
//! let failed: BackendResponse<u32> = BackendResponse::err(BackendError::new("JWT expired"));
//! assert!(failed.into_data().is_err());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use safeop_error::{OperationError, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

pub use safeop_error;

/// Error payload returned by the backend alongside (or instead of) data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendError {
    /// Error message
    pub message: String,
    /// Status or error code (HTTP status or database error code)
    #[serde(default)]
    pub code: Option<String>,
    /// Additional detail text
    #[serde(default)]
    pub details: Option<String>,
    /// Hint supplied by the backend
    #[serde(default)]
    pub hint: Option<String>,
}

impl BackendError {
    /// Creates a backend error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
            hint: None,
        }
    }

    /// Sets the code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<BackendError> for OperationError {
    fn from(err: BackendError) -> Self {
        let message = if err.message.is_empty() {
            err.details
                .clone()
                .unwrap_or_else(|| "Unknown database error".to_string())
        } else {
            err.message
        };
        OperationError::Backend {
            message,
            code: err.code,
            details: err.details,
        }
    }
}

/// A `{data, error}` shaped backend reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse<T> {
    /// Payload, absent when the call failed or returned nothing
    #[serde(default)]
    pub data: Option<T>,
    /// Error payload, present when the call failed
    #[serde(default)]
    pub error: Option<BackendError>,
}

impl<T> BackendResponse<T> {
    /// Successful reply carrying data
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    /// Successful reply without data
    pub fn empty() -> Self {
        Self {
            data: None,
            error: None,
        }
    }

    /// Failed reply
    pub fn err(error: BackendError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }

    /// Returns true when the reply carries an error payload
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Conversion of an operation's raw reply into data or a raised error
pub trait BackendReply {
    /// Data handed back to the caller on success
    type Data;

    /// Splits the reply into data or a normalized error
    fn into_data(self) -> Result<Self::Data, OperationError>;
}

impl<T> BackendReply for BackendResponse<T> {
    type Data = Option<T>;

    fn into_data(self) -> Result<Self::Data, OperationError> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.data),
        }
    }
}

impl BackendReply for serde_json::Value {
    type Data = serde_json::Value;

    fn into_data(self) -> Result<Self::Data, OperationError> {
        let error = match self.get("error") {
            Some(error) if !error.is_null() => error,
            _ => return Ok(self),
        };

        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
            .unwrap_or_else(|| error.to_string());
        let code = error.get("code").and_then(|c| match c {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let details = error
            .get("details")
            .and_then(|d| d.as_str())
            .map(str::to_string);

        Err(OperationError::Backend {
            message,
            code,
            details,
        })
    }
}

/// Authenticated user as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    /// Backend user id
    pub id: String,
    /// Email address, when known
    #[serde(default)]
    pub email: Option<String>,
}

impl AuthUser {
    /// Creates a user with an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Auth-state change published by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A user signed in
    SignedIn(AuthUser),
    /// The session token was refreshed
    TokenRefreshed(AuthUser),
    /// The user record changed
    UserUpdated(AuthUser),
    /// The user signed out or the session ended
    SignedOut,
}

/// Last known auth state, derived from [`AuthEvent`]s
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    /// No event seen yet
    #[default]
    Unknown,
    /// A session is active
    SignedIn {
        /// Id of the signed-in user
        user_id: String,
    },
    /// No session
    SignedOut,
}

impl AuthState {
    /// Applies an auth event, returning the resulting state
    pub fn apply(&self, event: &AuthEvent) -> AuthState {
        match event {
            AuthEvent::SignedIn(user)
            | AuthEvent::TokenRefreshed(user)
            | AuthEvent::UserUpdated(user) => AuthState::SignedIn {
                user_id: user.id.clone(),
            },
            AuthEvent::SignedOut => AuthState::SignedOut,
        }
    }

    /// Returns true when a session is known to be active
    pub fn is_signed_in(&self) -> bool {
        matches!(self, AuthState::SignedIn { .. })
    }
}

/// Backend client used by the resilience layer
#[async_trait]
pub trait Backend: Send + Sync {
    /// Looks up the currently authenticated user
    async fn current_user(&self) -> BackendResponse<Option<AuthUser>>;

    /// Runs a bounded select against a table
    async fn select(
        &self,
        table: &str,
        columns: &str,
        limit: usize,
    ) -> BackendResponse<serde_json::Value>;

    /// Subscribes to auth-state changes
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Notification style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Neutral information
    Info,
    /// Something completed
    Success,
    /// Degraded but working
    Warning,
    /// Something failed
    Error,
}

impl NotificationLevel {
    /// How long a notification of this level stays visible by default
    pub fn default_duration(&self) -> Duration {
        Duration::from_millis(5000)
    }
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Sink for user-facing notifications
pub trait Notifier: Send + Sync {
    /// Shows a transient notification
    fn notify(&self, message: &str, level: NotificationLevel, duration: Duration);
}

/// Sink for structured error records
pub trait ErrorSink: Send + Sync {
    /// Records an error under a category with a severity and free-form context
    fn log_error(
        &self,
        category: &str,
        error: &OperationError,
        severity: Severity,
        context: &BTreeMap<String, String>,
    );
}

/// Injectable delay
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Waits for the given duration
    async fn sleep(&self, duration: Duration);
}
