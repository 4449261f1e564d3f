//! Scheduled-job queue collaborator.
//!
//! Each operation is atomic for a single job. Nothing here serializes
//! operations across jobs; callers must not assume more than that.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{EntityId, UserId};

/// Opaque handle returned by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which mail a job sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Debounced "task updated" mail.
    #[default]
    TaskUpdated,
    /// One-off mail to a user newly assigned to a task.
    Assigned,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::TaskUpdated => "task_updated",
            JobKind::Assigned => "assigned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_updated" => Some(JobKind::TaskUpdated),
            "assigned" => Some(JobKind::Assigned),
            _ => None,
        }
    }
}

/// What a notification job is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub kind: JobKind,
    pub recipient: UserId,
    pub subject: EntityId,
}

impl JobPayload {
    pub fn task_updated(recipient: UserId, subject: EntityId) -> Self {
        Self {
            kind: JobKind::TaskUpdated,
            recipient,
            subject,
        }
    }

    pub fn assigned(recipient: UserId, subject: EntityId) -> Self {
        Self {
            kind: JobKind::Assigned,
            recipient,
            subject,
        }
    }
}

/// Lifecycle of a notification job.
///
/// `Pending → Cancelled`, or `Pending → Running → Sent | Suppressed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    /// Claimed by a worker; cancellation no longer possible.
    Running,
    Cancelled,
    Sent,
    Suppressed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Cancelled => "cancelled",
            JobState::Sent => "sent",
            JobState::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "cancelled" => Some(JobState::Cancelled),
            "sent" => Some(JobState::Sent),
            "suppressed" => Some(JobState::Suppressed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Sent | JobState::Suppressed)
    }
}

/// A queued notification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub handle: JobHandle,
    pub payload: JobPayload,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    /// Set while `Running`; a lease older than the worker's limit is
    /// handed back to `Pending`.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NotificationJob {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.fire_at <= now
    }
}

/// Selects pending jobs by subject, recipient and/or kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub subject: Option<EntityId>,
    pub recipient: Option<UserId>,
    pub kind: Option<JobKind>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn subject(id: EntityId) -> Self {
        Self {
            subject: Some(id),
            ..Default::default()
        }
    }

    pub fn recipient(mut self, id: UserId) -> Self {
        self.recipient = Some(id);
        self
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, payload: &JobPayload) -> bool {
        self.subject.is_none_or(|s| s == payload.subject)
            && self.recipient.is_none_or(|r| r == payload.recipient)
            && self.kind.is_none_or(|k| k == payload.kind)
    }
}

/// Durable delayed-job queue.
pub trait JobQueue: Send + Sync {
    /// Schedule `payload` to fire after `delay`.
    fn enqueue(&self, delay: Duration, payload: JobPayload) -> Result<JobHandle>;

    /// Jobs still in `Pending`, in fire order.
    fn list_pending(&self, filter: &JobFilter) -> Result<Vec<NotificationJob>>;

    /// Cancel a pending job. `Ok(false)` when it already left `Pending`.
    fn cancel(&self, handle: &JobHandle) -> Result<bool>;

    /// Move up to `limit` due jobs to `Running`, stamping `claimed_at = now`,
    /// and return them.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<NotificationJob>>;

    /// Return `Running` jobs claimed before `claimed_before` to `Pending`.
    /// Covers workers that died between claim and finish.
    fn reclaim_expired(&self, claimed_before: DateTime<Utc>) -> Result<usize>;

    /// Record the terminal state of a claimed job.
    fn finish(&self, handle: &JobHandle, state: JobState) -> Result<()>;

    fn job(&self, handle: &JobHandle) -> Result<Option<NotificationJob>>;
}
