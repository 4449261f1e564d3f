//! Notification debouncing.
//!
//! Turns a relationship-stamp change on a notifiable entity into exactly one
//! pending job per recipient. Older pending jobs for the same
//! (recipient, subject) pair are cancelled first, so a burst of edits within
//! the delay collapses into the last one. Cancellation is best effort: a job
//! a worker already claimed is left alone and neutralized by the
//! dispatcher's re-check.

use std::time::Duration;

use actiontrack_core::error::Result;
use actiontrack_core::traits::{JobFilter, JobHandle, JobKind, JobPayload, JobQueue};
use actiontrack_core::types::{EntityId, UserId};
use chrono::{DateTime, Utc};

/// What one debounce pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebounceReport {
    pub subject: Option<EntityId>,
    pub recipients: Vec<UserId>,
    pub cancelled: Vec<JobHandle>,
    /// Pending when listed, but gone by the time we tried to cancel.
    pub missed: usize,
    pub enqueued: Vec<JobHandle>,
}

pub struct NotificationDebouncer<'a> {
    queue: &'a dyn JobQueue,
    delay: Duration,
}

impl<'a> NotificationDebouncer<'a> {
    pub fn new(queue: &'a dyn JobQueue, delay: Duration) -> Self {
        Self { queue, delay }
    }

    /// Trigger condition: the relationship stamp moved in the committed write
    /// and the entity is currently notifiable.
    pub fn should_trigger(
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        notifiable: bool,
    ) -> bool {
        notifiable && after.is_some() && before != after
    }

    /// Subscribers minus the acting user, deduplicated, in input order.
    pub fn recipients(subscribers: &[UserId], actor: UserId) -> Vec<UserId> {
        let mut out: Vec<UserId> = Vec::with_capacity(subscribers.len());
        for &user in subscribers {
            if user != actor && !out.contains(&user) {
                out.push(user);
            }
        }
        out
    }

    /// Cancel stale pending jobs for `subject` and enqueue fresh ones.
    pub fn schedule(
        &self,
        subject: EntityId,
        subscribers: &[UserId],
        actor: UserId,
    ) -> Result<DebounceReport> {
        let recipients = Self::recipients(subscribers, actor);
        let mut report = DebounceReport {
            subject: Some(subject),
            recipients: recipients.clone(),
            ..Default::default()
        };
        if recipients.is_empty() {
            tracing::debug!("No recipients for {subject} (actor {actor})");
            return Ok(report);
        }

        let pending = self
            .queue
            .list_pending(&JobFilter::subject(subject).kind(JobKind::TaskUpdated))?;
        for job in pending
            .into_iter()
            .filter(|j| recipients.contains(&j.payload.recipient))
        {
            match self.queue.cancel(&job.handle) {
                Ok(true) => report.cancelled.push(job.handle),
                Ok(false) => report.missed += 1,
                Err(e) => {
                    tracing::debug!("Cancel of {} failed, continuing: {e}", job.handle);
                    report.missed += 1;
                }
            }
        }

        for recipient in recipients {
            let handle = self
                .queue
                .enqueue(self.delay, JobPayload::task_updated(recipient, subject))?;
            report.enqueued.push(handle);
        }

        tracing::info!(
            "⏳ Debounced {subject}: {} cancelled, {} scheduled in {}s",
            report.cancelled.len(),
            report.enqueued.len(),
            self.delay.as_secs()
        );
        Ok(report)
    }
}
