//! Mail delivery collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A rendered e-mail ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Delivers mail. Retries and dead-lettering belong to the implementation.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Short name for logs ("smtp", "outbox", ...).
    fn name(&self) -> &str;

    async fn send(&self, mail: &OutgoingMail) -> Result<()>;
}
