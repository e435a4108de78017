//! SMTP delivery for alert emails and carrier SMS/MMS gateways

use crate::domain::error::DeliveryError;
use crate::infra::config::Config;
use crate::services::dispatcher::{AlertSender, Snapshot};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Instant;
use tracing::info;

const ATTACHMENT_NAME: &str = "snapshot.jpg";

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// STARTTLS relay to `[smtp] host:port`, authenticating when a username is set
    pub fn new(config: &Config) -> Result<Self, DeliveryError> {
        let from = parse_mailbox(config.smtp_from())?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(config.smtp_host())
            .map_err(|e| DeliveryError::Send { recipient: config.smtp_host().to_string(), source: Box::new(e) })?
            .port(config.smtp_port());
        if !config.smtp_username().is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp_username().to_string(),
                config.smtp_password().to_string(),
            ));
        }

        Ok(Self { transport: builder.build(), from })
    }
}

#[async_trait]
impl AlertSender for SmtpMailer {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        snapshot: Option<&Snapshot>,
    ) -> Result<(), DeliveryError> {
        let start = Instant::now();
        let message = build_message(&self.from, recipient, subject, body, snapshot)?;

        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Send { recipient: recipient.to_string(), source: Box::new(e) })?;

        info!(
            recipient = %recipient,
            attachment = %snapshot.is_some(),
            latency_ms = %start.elapsed().as_millis(),
            "email_sent"
        );
        Ok(())
    }
}

/// Plain-text message, with the snapshot as a `snapshot.jpg` attachment when present
pub fn build_message(
    from: &Mailbox,
    recipient: &str,
    subject: &str,
    body: &str,
    snapshot: Option<&Snapshot>,
) -> Result<Message, DeliveryError> {
    let builder = Message::builder().from(from.clone()).to(parse_mailbox(recipient)?).subject(subject);

    let message = match snapshot {
        Some(snapshot) => {
            let content_type = ContentType::parse(&snapshot.content_type)
                .map_err(|e| DeliveryError::Message(Box::new(e)))?;
            let attachment =
                Attachment::new(ATTACHMENT_NAME.to_string()).body(snapshot.bytes.to_vec(), content_type);
            builder.multipart(
                MultiPart::mixed().singlepart(SinglePart::plain(body.to_string())).singlepart(attachment),
            )
        }
        None => builder.header(ContentType::TEXT_PLAIN).body(body.to_string()),
    };

    message.map_err(|e| DeliveryError::Message(Box::new(e)))
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| DeliveryError::Address { address: address.to_string(), source: Box::new(e) })
}
