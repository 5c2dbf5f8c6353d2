//! Retry state machine
//!
//! Decides, after each failed attempt, whether the orchestrator retries,
//! parks the operation in the offline queue, or gives up. Transitions are
//! pure: the machine never sleeps or reads connectivity itself, callers pass
//! the current state in and act on the returned [`RecoveryStep`].

use crate::backoff::BackoffConfig;
use crate::classifier::ErrorAnalysis;
use std::time::Duration;

/// Phase of a single `execute_with_recovery` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Checking preconditions
    Validating,
    /// An attempt is in flight
    Executing,
    /// Waiting out a backoff delay
    Retrying,
    /// Handing the operation to the offline queue
    Queuing,
    /// An attempt succeeded
    Succeeded,
    /// Recovery gave up
    Failed,
}

impl RecoveryPhase {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryPhase::Queuing | RecoveryPhase::Succeeded | RecoveryPhase::Failed
        )
    }
}

/// What the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Run the operation again now
    Execute,
    /// Sleep for `delay`, then report back through [`RetryMachine::on_wake`]
    Retry {
        /// 1-based retry number
        attempt: u32,
        /// Backoff delay before the retry
        delay: Duration,
    },
    /// Park the operation in the offline queue
    Queue,
    /// Surface the failure
    Fail,
}

/// Per-call retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Retries allowed after the first failure
    pub budget: u32,
    /// Whether retries are allowed at all
    pub enable_retry: bool,
    /// Whether the operation may be queued while offline
    pub enable_offline_queue: bool,
}

/// Retry decisions for one operation call
#[derive(Debug, Clone)]
pub struct RetryMachine {
    settings: RetrySettings,
    backoff: BackoffConfig,
    phase: RecoveryPhase,
    attempt: u32,
    last_analysis: Option<ErrorAnalysis>,
}

impl RetryMachine {
    /// Create a machine in the `Validating` phase
    pub fn new(settings: RetrySettings, backoff: BackoffConfig) -> Self {
        Self {
            settings,
            backoff,
            phase: RecoveryPhase::Validating,
            attempt: 0,
            last_analysis: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Retries taken so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Retries left in the budget
    pub fn remaining(&self) -> u32 {
        self.settings.budget.saturating_sub(self.attempt)
    }

    /// Analysis of the most recent failure
    pub fn last_analysis(&self) -> Option<&ErrorAnalysis> {
        self.last_analysis.as_ref()
    }

    /// Preconditions held
    pub fn on_validated(&mut self) -> RecoveryStep {
        self.phase = RecoveryPhase::Executing;
        RecoveryStep::Execute
    }

    /// Preconditions failed. Never retried, never queued.
    pub fn on_validation_failed(&mut self) -> RecoveryStep {
        self.phase = RecoveryPhase::Failed;
        RecoveryStep::Fail
    }

    /// An attempt succeeded
    pub fn on_success(&mut self) {
        self.phase = RecoveryPhase::Succeeded;
    }

    /// An attempt failed with `analysis` while connectivity was `online`
    pub fn on_failure(&mut self, analysis: ErrorAnalysis, online: bool) -> RecoveryStep {
        self.last_analysis = Some(analysis);

        if analysis.is_retryable
            && self.settings.enable_retry
            && online
            && self.attempt < self.settings.budget
        {
            self.attempt += 1;
            self.phase = RecoveryPhase::Retrying;
            return RecoveryStep::Retry {
                attempt: self.attempt,
                delay: self.backoff.jittered_delay_for(self.attempt),
            };
        }

        self.settle(online)
    }

    /// The backoff delay elapsed; connectivity is now `online`
    pub fn on_wake(&mut self, online: bool) -> RecoveryStep {
        if online {
            self.phase = RecoveryPhase::Executing;
            RecoveryStep::Execute
        } else {
            self.settle(false)
        }
    }

    fn settle(&mut self, online: bool) -> RecoveryStep {
        let queueable = self
            .last_analysis
            .map(|a| a.kind.is_queueable())
            .unwrap_or(false);

        if !online && self.settings.enable_offline_queue && queueable {
            self.phase = RecoveryPhase::Queuing;
            RecoveryStep::Queue
        } else {
            self.phase = RecoveryPhase::Failed;
            RecoveryStep::Fail
        }
    }
}
