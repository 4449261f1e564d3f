//! Task notification dispatch — runs when a job's delay has elapsed.
//!
//! The payload may be stale by now, so everything is re-read: the subject,
//! the recipient, the subscription and the subject's eligibility. Any miss
//! suppresses the job quietly; this re-check is what keeps duplicate or
//! uncancelled jobs from producing mail.
//!
//! Two mails exist: the debounced "task updated" mail and the one-off
//! assignment mail sent when a user is subscribed to a task.

use std::sync::Arc;

use actiontrack_core::config::TypeRegistry;
use actiontrack_core::error::Result;
use actiontrack_core::traits::{EntityStore, JobKind, JobPayload, JobState, Mailer, OutgoingMail};
use actiontrack_core::types::{Endpoint, Entity, Link, LinkKind, User, UserId};

use crate::classify;

/// Why a fired job produced no mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Task notifications are switched off globally.
    Disabled,
    SubjectGone,
    RecipientGone,
    Unsubscribed,
    /// Draft, archived, or notifications off for the subject.
    Ineligible,
}

/// Result of dispatching one job.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handed to the mailer. Transport failures are the mailer's concern.
    Sent(OutgoingMail),
    Suppressed(SuppressReason),
}

impl DispatchOutcome {
    /// Terminal job state for this outcome.
    pub fn job_state(&self) -> JobState {
        match self {
            DispatchOutcome::Sent(_) => JobState::Sent,
            DispatchOutcome::Suppressed(_) => JobState::Suppressed,
        }
    }
}

pub struct TaskDispatcher {
    store: Arc<dyn EntityStore>,
    mailer: Arc<dyn Mailer>,
    types: Arc<TypeRegistry>,
    enabled: bool,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn EntityStore>,
        mailer: Arc<dyn Mailer>,
        types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            store,
            mailer,
            types,
            enabled: true,
        }
    }

    /// Suppress every job (global notifications switch).
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Re-check eligibility and send at most one mail.
    pub async fn dispatch(&self, payload: &JobPayload) -> Result<DispatchOutcome> {
        let (subject, recipient, subscription) = match self.recheck(payload)? {
            Ok(checked) => checked,
            Err(reason) => {
                tracing::debug!(
                    "Suppressed {} mail for {} on {}: {reason:?}",
                    payload.kind.as_str(),
                    payload.recipient,
                    payload.subject
                );
                return Ok(DispatchOutcome::Suppressed(reason));
            }
        };

        let mail = match payload.kind {
            JobKind::TaskUpdated => {
                let actor = self.user_opt(subject.relationship_updated_by)?;
                compose(&self.types, &subject, &recipient, actor.as_ref())
            }
            JobKind::Assigned => {
                let actor = self.user_opt(subscription.created_by)?;
                compose_assignment(&self.types, &subject, &recipient, actor.as_ref())
            }
        };
        if let Err(e) = self.mailer.send(&mail).await {
            tracing::warn!(
                "⚠️ {} failed to deliver task mail to {}: {e}",
                self.mailer.name(),
                recipient.email
            );
        } else {
            tracing::info!(
                "📧 {} mail sent to {} for {}",
                payload.kind.as_str(),
                recipient.email,
                subject.id
            );
        }
        Ok(DispatchOutcome::Sent(mail))
    }

    fn user_opt(&self, id: Option<UserId>) -> Result<Option<User>> {
        match id {
            Some(id) => self.store.user(id),
            None => Ok(None),
        }
    }

    fn recheck(
        &self,
        payload: &JobPayload,
    ) -> Result<std::result::Result<(Entity, User, Link), SuppressReason>> {
        if !self.enabled {
            return Ok(Err(SuppressReason::Disabled));
        }
        let Some(subject) = self.store.entity(payload.subject)? else {
            return Ok(Err(SuppressReason::SubjectGone));
        };
        let Some(recipient) = self.store.user(payload.recipient)? else {
            return Ok(Err(SuppressReason::RecipientGone));
        };
        let Some(subscription) = self.store.find_link(
            LinkKind::UserMeasure,
            Endpoint::User(recipient.id),
            Endpoint::Entity(subject.id),
        )?
        else {
            return Ok(Err(SuppressReason::Unsubscribed));
        };
        let eligible = match payload.kind {
            JobKind::TaskUpdated => classify::is_notifiable(&self.types, &subject),
            JobKind::Assigned => classify::assignment_notifiable(&subject),
        };
        if !eligible {
            return Ok(Err(SuppressReason::Ineligible));
        }
        Ok(Ok((subject, recipient, subscription)))
    }
}

/// Plain-text task update mail.
pub fn compose(
    types: &TypeRegistry,
    subject: &Entity,
    recipient: &User,
    actor: Option<&User>,
) -> OutgoingMail {
    let label = types.type_label(subject);
    let mut body = format!(
        "Hello {},\n\nThe {} \"{}\" you are assigned to has been updated",
        recipient.name,
        label.to_lowercase(),
        subject.title
    );
    if let Some(actor) = actor {
        body.push_str(&format!(" by {}", actor.name));
    }
    body.push_str(".\n");
    OutgoingMail {
        to: recipient.email.clone(),
        to_name: Some(recipient.name.clone()),
        subject: format!("{label} updated: {}", subject.title),
        body,
    }
}

/// Plain-text mail to a user newly assigned to a task.
pub fn compose_assignment(
    types: &TypeRegistry,
    subject: &Entity,
    recipient: &User,
    actor: Option<&User>,
) -> OutgoingMail {
    let label = types.type_label(subject);
    let mut body = format!(
        "Hello {},\n\nYou have been assigned to the {} \"{}\"",
        recipient.name,
        label.to_lowercase(),
        subject.title
    );
    if let Some(actor) = actor {
        body.push_str(&format!(" by {}", actor.name));
    }
    body.push_str(".\n");
    OutgoingMail {
        to: recipient.email.clone(),
        to_name: Some(recipient.name.clone()),
        subject: format!("{label} assigned: {}", subject.title),
        body,
    }
}
