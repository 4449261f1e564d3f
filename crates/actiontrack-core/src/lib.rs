//! # ActionTrack Core
//!
//! Shared vocabulary for the activity-tracking backend: entities, users and
//! the link records between them, configuration, the error type, the
//! authorization policy and the collaborator traits (store, job queue,
//! mailer) that the notification core is written against.

pub mod config;
pub mod error;
pub mod policy;
pub mod traits;
pub mod types;

pub use config::TrackerConfig;
pub use error::{Result, TrackerError};
pub use types::{Endpoint, Entity, EntityId, EntityKind, Link, LinkId, LinkKind, User, UserId};
