//! Per-transaction message envelope.
//!
//! Created on `MAIL FROM`, filled by `RCPT TO` and body capture, handed to
//! the pipeline after the terminator line. Body decoding is delegated to
//! `mail-parser`; only the fields the pipeline seals are mapped out.

use std::time::SystemTime;

use mail_parser::{MessageParser, MimeHeaders, PartType};
use thiserror::Error;
use uuid::Uuid;

use crate::net::buffer::PooledBuffer;
use crate::smtp::address::Address;

/// Envelope mutation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("recipient limit of {0} reached")]
    TooManyRecipients(usize),

    #[error("message body could not be parsed")]
    Malformed,

    #[error("no body captured")]
    MissingBody,
}

/// A decoded attachment or inline part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    pub inline: bool,
    pub data: Vec<u8>,
}

/// Fields mapped out of the parsed body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl MessageContent {
    /// Body to seal: plain text if present, HTML otherwise.
    pub fn preferred_body(&self) -> &str {
        self.text
            .as_deref()
            .or(self.html.as_deref())
            .unwrap_or_default()
    }
}

/// One mail transaction.
#[derive(Debug)]
pub struct Envelope {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender: Address,
    pub recipients: Vec<Address>,
    pub raw: Option<PooledBuffer>,
    pub content: Option<MessageContent>,
    pub size: usize,
    /// Whether the body arrived over TLS.
    pub secure: bool,
    pub received_at: SystemTime,
}

impl Envelope {
    /// Start a transaction for `sender`.
    pub fn new(session_id: Uuid, sender: Address) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            sender,
            recipients: Vec::new(),
            raw: None,
            content: None,
            size: 0,
            secure: false,
            received_at: SystemTime::now(),
        }
    }

    /// Append a recipient, refusing once `max` are held.
    ///
    /// A repeated recipient is accepted without being listed twice.
    pub fn add_recipient(&mut self, recipient: Address, max: usize) -> Result<(), EnvelopeError> {
        if self.recipients.contains(&recipient) {
            return Ok(());
        }
        if self.recipients.len() >= max {
            return Err(EnvelopeError::TooManyRecipients(max));
        }
        self.recipients.push(recipient);
        Ok(())
    }

    /// Attach the captured body.
    pub fn set_body(&mut self, raw: PooledBuffer, secure: bool) {
        self.size = raw.len();
        self.secure = secure;
        self.received_at = SystemTime::now();
        self.raw = Some(raw);
    }

    /// Decode the captured body into [`MessageContent`].
    pub fn parse_body(&mut self) -> Result<&MessageContent, EnvelopeError> {
        let raw = self.raw.as_ref().ok_or(EnvelopeError::MissingBody)?;
        let content = parse_content(raw)?;
        Ok(self.content.insert(content))
    }

    /// Return the capture buffer to its pool.
    pub fn release_body(&mut self) {
        self.raw = None;
    }
}

fn parse_content(raw: &[u8]) -> Result<MessageContent, EnvelopeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(EnvelopeError::Malformed);
    }
    if !starts_with_header_field(raw) {
        return Ok(plain_text(raw));
    }
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(EnvelopeError::Malformed)?;

    let text = message.text_bodies().find_map(|part| match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        _ => None,
    });
    let html = message.html_bodies().find_map(|part| match &part.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    });

    let attachments: Vec<Attachment> = message
        .attachments()
        .map(|part| Attachment {
            filename: part.attachment_name().map(str::to_string),
            content_type: part.content_type().map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            }),
            content_id: part
                .content_id()
                .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string()),
            inline: part.content_disposition().is_some_and(|d| d.is_inline()),
            data: part.contents().to_vec(),
        })
        .collect();

    let subject = message.subject().map(str::to_string);
    if text.is_none() && html.is_none() && attachments.is_empty() && subject.is_none() {
        return Ok(plain_text(raw));
    }
    Ok(MessageContent {
        subject,
        text,
        html,
        attachments,
    })
}

/// Whether the first line is a `name:` header field.
fn starts_with_header_field(raw: &[u8]) -> bool {
    let first = raw.split(|&b| b == b'\n').next().unwrap_or_default();
    match first.iter().position(|&b| b == b':') {
        Some(0) | None => false,
        Some(colon) => first[..colon].iter().all(u8::is_ascii_graphic),
    }
}

fn plain_text(raw: &[u8]) -> MessageContent {
    MessageContent {
        text: Some(String::from_utf8_lossy(raw).into_owned()),
        ..MessageContent::default()
    }
}
