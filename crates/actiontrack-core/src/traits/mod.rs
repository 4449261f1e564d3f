//! Collaborator traits the notification core is written against.

pub mod mailer;
pub mod queue;
pub mod store;

pub use mailer::{Mailer, OutgoingMail};
pub use queue::{JobFilter, JobHandle, JobKind, JobPayload, JobQueue, JobState, NotificationJob};
pub use store::{BatchOutcome, EntityStore, Write, WriteBatch};
