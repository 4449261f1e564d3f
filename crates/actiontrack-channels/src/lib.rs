//! # ActionTrack Channels
//! Mail delivery for task notifications.

pub mod email;
pub mod outbox;

use std::sync::Arc;

use actiontrack_core::config::MailConfig;
use actiontrack_core::error::{Result, TrackerError};
use actiontrack_core::traits::Mailer;

pub use email::SmtpMailer;
pub use outbox::OutboxMailer;

/// The SMTP mailer for a configuration. Delivery needs a real transport, so
/// a disabled `[mail]` section is an error; the outbox is only for tests and
/// embedders that read it back.
pub fn mailer_from_config(config: &MailConfig) -> Result<Arc<dyn Mailer>> {
    if !config.enabled {
        return Err(TrackerError::Config(
            "mail.enabled is false; configure [mail] SMTP settings before running the worker"
                .into(),
        ));
    }
    tracing::info!("📧 Mail via SMTP {}:{}", config.smtp_host, config.smtp_port);
    Ok(Arc::new(SmtpMailer::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_mail_is_rejected() {
        let err = mailer_from_config(&MailConfig::default()).err();
        assert!(matches!(err, Some(TrackerError::Config(_))));
    }

    #[tokio::test]
    async fn test_enabled_mail_uses_smtp() {
        let config = MailConfig {
            enabled: true,
            smtp_host: "smtp.example.org".into(),
            ..Default::default()
        };
        let mailer = mailer_from_config(&config).unwrap();
        assert_eq!(mailer.name(), "smtp");
    }
}
