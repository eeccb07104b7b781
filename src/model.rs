//! Core data model.
//!
//! An item is one unit of work submitted to a lane. It carries an opaque
//! payload for its handler plus the lifecycle state the scheduler owns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier.
    pub id: ItemId,

    /// The lane this item belongs to. Never changes.
    pub queue_name: String,

    /// Handler input. The scheduler never looks inside.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub status: Status,

    /// Number of dispatch attempts so far.
    pub attempts: u32,

    /// Attempts allowed before the item is marked failed.
    pub max_attempts: u32,

    /// Per-attempt handler deadline.
    pub timeout_ms: u64,

    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Handler output, set on completion.
    pub result: Option<serde_json::Value>,

    /// Why the most recent attempt failed.
    pub last_error: Option<Failure>,
}

impl Item {
    /// Build a pending item, filling unset options from the scheduler defaults.
    pub fn new(
        queue_name: &str,
        payload: serde_json::Value,
        options: &EnqueueOptions,
        config: &SchedulerConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::generate(queue_name, now),
            queue_name: queue_name.to_string(),
            payload,
            status: Status::Pending,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(config.default_max_attempts)
                .max(1),
            timeout_ms: options
                .timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(config.default_timeout_ms),
            added_at: now,
            updated_at: now,
            result: None,
            last_error: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether another attempt is allowed after a failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Move to `to`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, to: Status) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// pending -> processing, counting the attempt.
    pub fn begin_attempt(&mut self) -> Result<()> {
        self.transition(Status::Processing)?;
        self.attempts += 1;
        Ok(())
    }

    /// processing -> completed.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<()> {
        self.transition(Status::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// processing -> pending or failed, depending on remaining attempts.
    /// Returns the status the item landed in.
    pub fn fail(&mut self, failure: Failure) -> Result<Status> {
        let next = if self.has_attempts_left() {
            Status::Pending
        } else {
            Status::Failed
        };
        self.transition(next)?;
        self.last_error = Some(failure);
        Ok(next)
    }
}

/// Newtype for item IDs: `<queue>_<unix millis>_<random suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn generate(queue_name: &str, at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{queue_name}_{}_{}",
            at.timestamp_millis(),
            &suffix[..9]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for admission.
    Pending,
    /// Handler running.
    Processing,
    /// Handler succeeded. Terminal.
    Completed,
    /// Attempts exhausted. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending) // retry
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Why a dispatch attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// The handler returned an error.
    Handler { message: String },
    /// The handler did not settle before the item's deadline.
    Timeout { timeout_ms: u64 },
    /// The handler task panicked.
    Panicked { message: String },
}

impl Failure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Failure::Timeout { .. })
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Handler { message } => f.write_str(message),
            Failure::Timeout { timeout_ms } => {
                write!(f, "processing timeout after {timeout_ms}ms")
            }
            Failure::Panicked { message } => write!(f, "handler panicked: {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-item overrides for [`crate::scheduler::Scheduler::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub(crate) max_attempts: Option<u32>,
    pub(crate) timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-lane status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl LaneStats {
    /// Nothing waiting and nothing running.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
