//! SMTP mail delivery (async lettre). Works with any STARTTLS relay:
//! Gmail, Outlook, or a local MTA.

use actiontrack_core::config::MailConfig;
use actiontrack_core::error::{Result, TrackerError};
use actiontrack_core::traits::{Mailer, OutgoingMail};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the transport. No connection is made until the first send.
    pub fn new(config: &MailConfig) -> Result<Self> {
        if config.smtp_host.trim().is_empty() {
            return Err(TrackerError::Config("mail.smtp_host is required".into()));
        }
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| TrackerError::Mail(format!("Invalid from: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| TrackerError::Mail(format!("SMTP relay: {e}")))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    /// Render an [`OutgoingMail`] as a plain-text lettre message.
    pub fn build_message(&self, mail: &OutgoingMail) -> Result<Message> {
        let address: Address = mail
            .to
            .parse()
            .map_err(|e| TrackerError::Mail(format!("Invalid to: {e}")))?;
        let to = Mailbox::new(mail.to_name.clone(), address);

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(|e| TrackerError::Mail(format!("Build email: {e}")))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        let message = self.build_message(mail)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| TrackerError::Mail(format!("SMTP send: {e}")))?;
        tracing::info!("📤 Email sent to: {}", mail.to);
        Ok(())
    }
}
