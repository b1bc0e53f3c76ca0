//! Email inbox — SMTP via lettre for outbound, RFC822 parsing via
//! mail-parser for inbound.

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType as LettreContentType;
use lettre::message::{Attachment as EmailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as Email, Tokio1Executor};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::InboxError;
use crate::inbox::{ChannelKind, Inbox, OutgoingEnvelope};
use crate::models::{
    Attachment, Contact, ContentType, Disposition, IncomingMessage, Message, MessageDirection,
    MessageStatus, SenderType,
};
use crate::textutil::strip_html;

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration for one email inbox.
#[derive(Debug, Clone)]
pub struct EmailInboxConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailInboxConfig {
    /// Build config from environment variables. Returns `None` if
    /// `DESKRELAY_SMTP_HOST` is not set (email sending disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("DESKRELAY_SMTP_HOST").ok()?;
        let smtp_port: u16 = std::env::var("DESKRELAY_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("DESKRELAY_SMTP_USERNAME").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("DESKRELAY_SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("DESKRELAY_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

// ── Inbox ───────────────────────────────────────────────────────────

/// An email transport backed by an async SMTP connection pool.
pub struct EmailInbox {
    id: i64,
    config: EmailInboxConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailInbox {
    pub fn new(id: i64, config: EmailInboxConfig) -> Result<Self, InboxError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .map_err(|e| InboxError::BuildFailed {
                channel: "email".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.smtp_port)
            .credentials(creds)
            .build();
        Ok(Self {
            id,
            config,
            transport,
        })
    }
}

#[async_trait]
impl Inbox for EmailInbox {
    fn id(&self) -> i64 {
        self.id
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn from_address(&self) -> &str {
        &self.config.from_address
    }

    async fn send(&self, envelope: &OutgoingEnvelope) -> Result<(), InboxError> {
        let email = build_email(envelope)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| InboxError::SendFailed {
                channel: "email".into(),
                reason: e.to_string(),
            })?;
        tracing::info!(to = %envelope.to, "Email sent");
        Ok(())
    }
}

/// Build a lettre message from an envelope, with threading headers and
/// attachment parts.
fn build_email(envelope: &OutgoingEnvelope) -> Result<Email, InboxError> {
    let from: Mailbox = envelope
        .from
        .parse()
        .map_err(|e| InboxError::InvalidAddress {
            address: envelope.from.clone(),
            reason: format!("{e}"),
        })?;
    let to: Mailbox = envelope
        .to
        .parse()
        .map_err(|e| InboxError::InvalidAddress {
            address: envelope.to.clone(),
            reason: format!("{e}"),
        })?;

    let mut builder = Email::builder()
        .from(from)
        .to(to)
        .subject(&envelope.subject);

    if let Some(ref in_reply_to) = envelope.in_reply_to {
        builder = builder.in_reply_to(angle_bracket(in_reply_to));
    }
    if !envelope.references.is_empty() {
        let refs: Vec<String> = envelope.references.iter().map(|r| angle_bracket(r)).collect();
        builder = builder.references(refs.join(" "));
    }

    let mut body = MultiPart::mixed().singlepart(SinglePart::html(envelope.content.clone()));
    for attachment in &envelope.attachments {
        let content_type = LettreContentType::parse(&attachment.content_type).map_err(|e| {
            InboxError::BuildFailed {
                channel: "email".into(),
                reason: format!("bad attachment content type {}: {e}", attachment.content_type),
            }
        })?;
        let part = match (attachment.disposition, &attachment.content_id) {
            (Disposition::Inline, Some(cid)) => {
                EmailAttachment::new_inline(cid.clone()).body(attachment.content.clone(), content_type)
            }
            _ => EmailAttachment::new(attachment.name.clone())
                .body(attachment.content.clone(), content_type),
        };
        body = body.singlepart(part);
    }

    builder.multipart(body).map_err(|e| InboxError::BuildFailed {
        channel: "email".into(),
        reason: e.to_string(),
    })
}

/// Ensure a message id carries angle brackets for header composition.
fn angle_bracket(id: &str) -> String {
    let trimmed = id.trim();
    if trimmed.starts_with('<') {
        trimmed.to_string()
    } else {
        format!("<{trimmed}>")
    }
}

// ── Inbound parsing ─────────────────────────────────────────────────

/// Parse a raw RFC822 email into a pipeline `IncomingMessage`.
///
/// Returns `None` when the payload is not parseable as email at all;
/// missing optional headers degrade gracefully.
pub fn parse_incoming_email(raw: &[u8], inbox_id: i64) -> Option<IncomingMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender_address = parsed
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())?;
    let sender_name = parsed
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.name())
        .unwrap_or_default()
        .to_string();
    let (first_name, last_name) = split_name(&sender_name, &sender_address);

    let subject = parsed.subject().map(|s| s.to_string());
    let source_id = parsed.message_id().map(normalize_message_id);
    let in_reply_to = header_message_ids(parsed.header("In-Reply-To")).into_iter().next();
    let references = header_message_ids(parsed.header("References"));

    let (content, content_type) = if let Some(html) = parsed.body_html(0) {
        (html.to_string(), ContentType::Html)
    } else if let Some(text) = parsed.body_text(0) {
        (text.to_string(), ContentType::Text)
    } else {
        (String::new(), ContentType::Text)
    };

    let attachments: Vec<Attachment> = parsed
        .attachments()
        .map(|part| {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            Attachment {
                name: part.attachment_name().unwrap_or("attachment").to_string(),
                content_type,
                content: part.contents().to_vec(),
                content_id: part.content_id().map(|s| s.to_string()),
                disposition: Disposition::Attachment,
            }
        })
        .collect();

    let message = Message {
        id: 0,
        uuid: Uuid::nil(),
        conversation_id: 0,
        conversation_uuid: Uuid::nil(),
        direction: MessageDirection::Incoming,
        sender_id: 0,
        sender_type: SenderType::Contact,
        status: MessageStatus::Received,
        content,
        content_type,
        source_id,
        in_reply_to,
        references,
        attachments,
        private: false,
        inbox_id,
        subject,
        meta: serde_json::json!({}),
        created_at: Utc::now(),
    };

    Some(IncomingMessage {
        message,
        contact: Contact {
            id: 0,
            first_name,
            last_name,
            email: sender_address,
            inbox_id,
        },
        inbox_id,
    })
}

/// Message ids are stored bracketless so index lookups match regardless
/// of how the client formatted the header.
fn normalize_message_id(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn header_message_ids(value: Option<&HeaderValue>) -> Vec<String> {
    match value {
        Some(HeaderValue::Text(text)) => text
            .split_whitespace()
            .map(normalize_message_id)
            .filter(|s| !s.is_empty())
            .collect(),
        Some(HeaderValue::TextList(list)) => list
            .iter()
            .map(|t| normalize_message_id(t))
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn split_name(display_name: &str, address: &str) -> (String, String) {
    let name = if display_name.trim().is_empty() {
        strip_html(address.split('@').next().unwrap_or(address))
    } else {
        display_name.trim().to_string()
    };
    match name.split_once(' ') {
        Some((first, last)) => (first.to_string(), last.trim().to_string()),
        None => (name, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_REPLY: &[u8] = b"From: Alice Doe <alice@example.com>\r\n\
To: support@helpdesk.test\r\n\
Subject: Re: Broken login\r\n\
Message-ID: <reply-1@example.com>\r\n\
In-Reply-To: <orig-1@helpdesk.test>\r\n\
References: <orig-1@helpdesk.test> <orig-0@helpdesk.test>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Still broken for me.\r\n";

    #[test]
    fn parses_threading_headers() {
        let incoming = parse_incoming_email(RAW_REPLY, 4).unwrap();
        let msg = &incoming.message;
        assert_eq!(msg.source_id.as_deref(), Some("reply-1@example.com"));
        assert_eq!(msg.in_reply_to.as_deref(), Some("orig-1@helpdesk.test"));
        assert_eq!(
            msg.references,
            vec!["orig-1@helpdesk.test".to_string(), "orig-0@helpdesk.test".to_string()]
        );
        assert_eq!(msg.subject.as_deref(), Some("Re: Broken login"));
        assert_eq!(msg.direction, MessageDirection::Incoming);
        assert_eq!(msg.status, MessageStatus::Received);
        assert_eq!(msg.inbox_id, 4);
        assert!(msg.content.contains("Still broken"));
    }

    #[test]
    fn parses_contact_identity() {
        let incoming = parse_incoming_email(RAW_REPLY, 1).unwrap();
        assert_eq!(incoming.contact.email, "alice@example.com");
        assert_eq!(incoming.contact.first_name, "Alice");
        assert_eq!(incoming.contact.last_name, "Doe");
    }

    #[test]
    fn garbage_input_returns_none_or_degrades() {
        // No From header means no contact identity; must not panic.
        assert!(parse_incoming_email(b"not an email at all", 1).is_none());
    }

    #[test]
    fn message_id_normalization() {
        assert_eq!(normalize_message_id(" <a@b> "), "a@b");
        assert_eq!(normalize_message_id("a@b"), "a@b");
        assert_eq!(angle_bracket("a@b"), "<a@b>");
        assert_eq!(angle_bracket("<a@b>"), "<a@b>");
    }

    #[test]
    fn split_name_falls_back_to_address_local_part() {
        let (first, last) = split_name("", "bob@example.com");
        assert_eq!(first, "bob");
        assert_eq!(last, "");
    }
}
