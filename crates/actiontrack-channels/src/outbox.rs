//! In-memory mailer. Keeps every mail it is handed, so it is only for tests
//! and for embedders that drain it with [`OutboxMailer::clear`].

use std::sync::Mutex;

use actiontrack_core::error::Result;
use actiontrack_core::traits::{Mailer, OutgoingMail};
use async_trait::async_trait;

#[derive(Default)]
pub struct OutboxMailer {
    sent: Mutex<Vec<OutgoingMail>>,
}

impl OutboxMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        tracing::info!("📭 Outbox: '{}' → {}", mail.subject, mail.to);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(mail.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbox_records_and_clears() {
        let outbox = OutboxMailer::new();
        let mail = OutgoingMail {
            to: "bo@example.org".into(),
            to_name: None,
            subject: "Task updated: Survey".into(),
            body: String::new(),
        };
        outbox.send(&mail).await.unwrap();
        outbox.send(&mail).await.unwrap();
        assert_eq!(outbox.sent().len(), 2);
        outbox.clear();
        assert!(outbox.sent().is_empty());
    }
}
