//! Mail transport — outbound SMTP via async lettre.

use async_trait::async_trait;
use courier_core::config::MailConfig;
use courier_core::error::{CourierError, Result};
use courier_core::traits::MailChannel;
use courier_core::types::RenderedEmail;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// SMTP mail transport. One `send` call delivers one rendered message to the
/// whole recipient list. Misconfiguration (bad sender, unusable relay) is
/// reported as a failed send, never a panic.
pub struct MailTransport {
    config: MailConfig,
}

impl MailTransport {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    /// Assemble the message: sender, recipient list, multipart text + HTML.
    /// Recipients that fail address parsing are skipped with a warning.
    pub fn build_email(&self, to: &[String], message: &RenderedEmail) -> Result<Message> {
        let from_name = self.config.from_name.as_deref().unwrap_or("Portal");
        let from_mailbox: Mailbox = format!("{from_name} <{}>", self.config.from_address)
            .parse()
            .map_err(|e| CourierError::Channel(format!("Invalid from address: {e}")))?;

        let mut builder = Message::builder()
            .from(from_mailbox)
            .subject(message.subject.as_str());

        let mut recipients = 0;
        for addr in to {
            match addr.parse::<Mailbox>() {
                Ok(mailbox) => {
                    builder = builder.to(mailbox);
                    recipients += 1;
                }
                Err(e) => tracing::warn!("skipping unparseable address {addr}: {e}"),
            }
        }
        if recipients == 0 {
            return Err(CourierError::Channel("No valid recipient addresses".into()));
        }

        builder
            .multipart(MultiPart::alternative_plain_html(
                message.text.clone(),
                message.html.clone(),
            ))
            .map_err(|e| CourierError::Channel(format!("Build email: {e}")))
    }
}

#[async_trait]
impl MailChannel for MailTransport {
    async fn send(&self, to: &[String], message: &RenderedEmail) -> Result<()> {
        let email = self.build_email(to, message)?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.clone(),
        );
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)
            .map_err(|e| CourierError::Channel(format!("SMTP relay: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| CourierError::Channel(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Mail sent to {} recipient(s)", to.len());
        Ok(())
    }
}
