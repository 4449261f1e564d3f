//! # ActionTrack Scheduler
//!
//! Change classification, relationship stamping and debounced task
//! notifications for the activity tracker.
//!
//! ## Design Principles
//! - Request paths stay synchronous: classify, stamp and enqueue inside the
//!   caller's thread, never send mail there
//! - SQLite persistence — jobs survive restarts, one file per deployment
//! - Tokio timers only — the worker sleeps between polls
//! - Dispatch re-checks everything; stale jobs are suppressed, not sent
//!
//! ## Architecture
//! ```text
//! Tracker (request side)
//!   ├── update_entity → classify → Save (+ stamp when notifiable)
//!   ├── link create/update/destroy → TouchPropagator → Stamp both ends
//!   ├── subscribe → assignment job (fires at once)
//!   └── after commit → NotificationDebouncer
//!                        ├── cancel pending jobs for (recipient, subject)
//!                        └── enqueue one job per subscriber, now + delay
//!
//! NotificationWorker (tokio interval)
//!   ├── reclaim_expired → stale leases back to pending
//!   ├── claim_due → TaskDispatcher
//!   │                ├── re-check entity, subscription, eligibility
//!   │                └── Mailer::send (SMTP / outbox)
//!   └── finish → sent | suppressed
//! ```

pub mod classify;
pub mod debounce;
pub mod dispatch;
pub mod engine;
pub mod persistence;
pub mod queue;
pub mod service;
pub mod store;
pub mod touch;
pub mod validate;

pub use classify::{Verdict, assignment_notifiable, classify, classify_with, is_notifiable};
pub use debounce::{DebounceReport, NotificationDebouncer};
pub use dispatch::{DispatchOutcome, SuppressReason, TaskDispatcher};
pub use engine::{NotificationWorker, WorkerStats, spawn_worker};
pub use persistence::TrackerDb;
pub use queue::MemoryJobQueue;
pub use service::{Committed, EntityPatch, NewEntity, Tracker};
pub use store::MemoryStore;
pub use touch::TouchPropagator;
pub use validate::Validator;
