//! # safeop Testing Infrastructure
//!
//! Testing utilities for the safeop resilience layer:
//! - Mock backend with scripted query replies and auth events
//! - Recording notifier, sleeper and error sink
//! - Scripted operation outcomes
//! - Edge-case error messages and property-based strategies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use safeop_testing::*;
//!
//! let sleeper = RecordingSleeper::new();
//! let script = Script::new(vec![Err(network_error()), Ok(5)]);
//!
//! proptest! {
//!     #[test]
//!     fn network_messages_retry(msg in network_message()) {
//!         // ...
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use proptest::prelude::*;
use safeop_error::{OperationError, Severity};
use safeop_traits::{
    AuthEvent, AuthUser, Backend, BackendResponse, ErrorSink, NotificationLevel, Notifier, Sleeper,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Edge Case Error Messages
// ============================================================================

/// Error messages seen from real backends, grouped by expected category
pub struct EdgeCaseMessages;

impl EdgeCaseMessages {
    /// Connectivity failures
    pub const NETWORK: &'static [&'static str] = &[
        "TypeError: Failed to fetch",
        "NetworkError when attempting to fetch resource.",
        "Connection refused",
        "The Internet connection appears to be offline.",
        "Host unreachable",
        "getaddrinfo ENOTFOUND: DNS lookup failed",
        "Request timeout",
    ];

    /// Rate limiting
    pub const RATE_LIMIT: &'static [&'static str] =
        &["Rate limit exceeded", "429 Too Many Requests"];

    /// Backend-side failures
    pub const SERVER: &'static [&'static str] = &["Internal Server Error"];

    /// Deadline failures that do not mention "timeout"
    pub const TIMEOUT: &'static [&'static str] = &["Statement timed out", "Upstream timed out"];

    /// Session failures
    pub const AUTH: &'static [&'static str] = &["Unauthorized", "Authentication failed: JWT expired"];

    /// Authorization failures
    pub const PERMISSION: &'static [&'static str] = &[
        "permission denied for table user_profiles",
        "Forbidden",
    ];

    /// Input rejected by the backend
    pub const VALIDATION: &'static [&'static str] = &[
        "duplicate key value violates unique constraint \"user_profiles_pkey\"",
        "Validation failed: email",
        "invalid input syntax for type uuid",
    ];

    /// Messages matching no category
    pub const UNKNOWN: &'static [&'static str] = &["Something happened", "PGRST116"];
}

/// A network error as raised by a fetch-based client
pub fn network_error() -> OperationError {
    OperationError::failed("TypeError: Failed to fetch")
}

/// A backend validation error
pub fn validation_error() -> OperationError {
    OperationError::backend("duplicate key value violates unique constraint").with_code("23505")
}

// ============================================================================
// Mock Backend
// ============================================================================

/// One recorded `select` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectCall {
    /// Table queried
    pub table: String,
    /// Columns requested
    pub columns: String,
    /// Row limit
    pub limit: usize,
}

/// In-memory [`Backend`] with scripted replies
pub struct MockBackend {
    user: Mutex<Option<AuthUser>>,
    select_replies: Mutex<VecDeque<BackendResponse<serde_json::Value>>>,
    select_delay: Mutex<Duration>,
    selects: Mutex<Vec<SelectCall>>,
    user_lookups: Mutex<usize>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for MockBackend {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            user: Mutex::new(None),
            select_replies: Mutex::new(VecDeque::new()),
            select_delay: Mutex::new(Duration::ZERO),
            selects: Mutex::new(Vec::new()),
            user_lookups: Mutex::new(0),
            events,
        }
    }
}

impl MockBackend {
    /// Create a backend with no signed-in user
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend with a signed-in user
    pub fn signed_in(user_id: &str) -> Self {
        let backend = Self::new();
        backend.set_user(Some(AuthUser::new(user_id)));
        backend
    }

    /// Wrap in an `Arc`
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Set the user returned by `current_user`
    pub fn set_user(&self, user: Option<AuthUser>) {
        *lock(&self.user) = user;
    }

    /// Queue a reply for the next `select`; unscripted calls return `[]`
    pub fn push_select_reply(&self, reply: BackendResponse<serde_json::Value>) {
        lock(&self.select_replies).push_back(reply);
    }

    /// Delay every `select` by `delay`
    pub fn set_select_delay(&self, delay: Duration) {
        *lock(&self.select_delay) = delay;
    }

    /// Recorded `select` calls
    pub fn selects(&self) -> Vec<SelectCall> {
        lock(&self.selects).clone()
    }

    /// Number of `current_user` lookups
    pub fn user_lookups(&self) -> usize {
        *lock(&self.user_lookups)
    }

    /// Publish an auth event to subscribers
    pub fn emit(&self, event: AuthEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn current_user(&self) -> BackendResponse<Option<AuthUser>> {
        *lock(&self.user_lookups) += 1;
        BackendResponse::ok(lock(&self.user).clone())
    }

    async fn select(
        &self,
        table: &str,
        columns: &str,
        limit: usize,
    ) -> BackendResponse<serde_json::Value> {
        lock(&self.selects).push(SelectCall {
            table: table.to_string(),
            columns: columns.to_string(),
            limit,
        });

        let delay = *lock(&self.select_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        lock(&self.select_replies)
            .pop_front()
            .unwrap_or_else(|| BackendResponse::ok(serde_json::json!([])))
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Recording Collaborators
// ============================================================================

/// One recorded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Text shown
    pub message: String,
    /// Style
    pub level: NotificationLevel,
    /// How long it stays visible
    pub duration: Duration,
}

/// [`Notifier`] that records every call
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications so far
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.seen).clone()
    }

    /// Notifications of one level
    pub fn with_level(&self, level: NotificationLevel) -> Vec<Notification> {
        lock(&self.seen)
            .iter()
            .filter(|n| n.level == level)
            .cloned()
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, level: NotificationLevel, duration: Duration) {
        lock(&self.seen).push(Notification {
            message: message.to_string(),
            level,
            duration,
        });
    }
}

type SleepHook = Box<dyn Fn(usize, Duration) + Send + Sync>;

/// [`Sleeper`] that records requested delays and returns immediately.
///
/// An optional hook runs on each sleep with the 0-based call index, which
/// lets tests change connectivity "during" a backoff delay.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
    hook: Option<SleepHook>,
}

impl RecordingSleeper {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` on every sleep
    pub fn with_hook(mut self, hook: impl Fn(usize, Duration) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Requested delays in order
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.slept).clone()
    }

    /// Sum of requested delays
    pub fn total(&self) -> Duration {
        lock(&self.slept).iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        let index = {
            let mut slept = lock(&self.slept);
            slept.push(duration);
            slept.len() - 1
        };
        if let Some(hook) = &self.hook {
            hook(index, duration);
        }
    }
}

/// One recorded error-sink call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedError {
    /// Category
    pub category: String,
    /// Error text
    pub message: String,
    /// Severity
    pub severity: Severity,
    /// Context map
    pub context: BTreeMap<String, String>,
}

/// [`ErrorSink`] that records every call
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    logged: Mutex<Vec<LoggedError>>,
}

impl RecordingErrorSink {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded errors
    pub fn logged(&self) -> Vec<LoggedError> {
        lock(&self.logged).clone()
    }

    /// Recorded errors in one category
    pub fn in_category(&self, category: &str) -> Vec<LoggedError> {
        lock(&self.logged)
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn log_error(
        &self,
        category: &str,
        error: &OperationError,
        severity: Severity,
        context: &BTreeMap<String, String>,
    ) {
        lock(&self.logged).push(LoggedError {
            category: category.to_string(),
            message: error.to_string(),
            severity,
            context: context.clone(),
        });
    }
}

// ============================================================================
// Scripted Outcomes
// ============================================================================

/// Shared script of attempt outcomes.
///
/// Each call to [`Script::next`] pops the next outcome; once the script runs
/// out the last outcome repeats.
#[derive(Debug)]
pub struct Script<T> {
    outcomes: Mutex<VecDeque<Result<T, OperationError>>>,
    last: Mutex<Option<Result<T, OperationError>>>,
    calls: Mutex<usize>,
}

impl<T: Clone> Script<T> {
    /// Create a shared script
    pub fn new(outcomes: Vec<Result<T, OperationError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            last: Mutex::new(None),
            calls: Mutex::new(0),
        })
    }

    /// Script that always fails with `error`
    pub fn always_err(error: OperationError) -> Arc<Self> {
        Self::new(vec![Err(error)])
    }

    /// Next outcome
    pub fn next(&self) -> Result<T, OperationError> {
        *lock(&self.calls) += 1;
        let mut last = lock(&self.last);
        if let Some(outcome) = lock(&self.outcomes).pop_front() {
            *last = Some(outcome);
        }
        last.clone()
            .unwrap_or_else(|| Err(OperationError::failed("script is empty")))
    }

    /// Number of outcomes handed out
    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

// ============================================================================
// Property-Based Testing Strategies
// ============================================================================

/// Network keywords recognised by the classifier
pub const NETWORK_KEYWORDS: &[&str] = &[
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

/// Messages embedding a network keyword in arbitrary case and surroundings
pub fn network_message() -> impl Strategy<Value = String> {
    (
        "[a-z ]{0,12}",
        prop::sample::select(NETWORK_KEYWORDS),
        any::<bool>(),
        "[a-z ]{0,12}",
    )
        .prop_map(|(prefix, keyword, upper, suffix)| {
            let keyword = if upper {
                keyword.to_uppercase()
            } else {
                keyword.to_string()
            };
            format!("{prefix}{keyword}{suffix}")
        })
}

/// Arbitrary printable messages, including empty ones
pub fn any_error_message() -> impl Strategy<Value = String> {
    "\\PC{0,64}"
}

/// Optional status or error codes
pub fn any_error_code() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        (100u16..600u16).prop_map(|c| Some(c.to_string())),
        "[A-Z0-9]{1,8}".prop_map(Some),
    ]
}

/// Retry attempt numbers, including 0 and very large values
pub fn attempt_number() -> impl Strategy<Value = u32> {
    prop_oneof![0u32..=12u32, any::<u32>()]
}

// ============================================================================
// Tests
// ============================================================================
