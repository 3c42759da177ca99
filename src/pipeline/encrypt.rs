//! Per-recipient sealing.
//!
//! For every resolved recipient the sender, recipient list, subject, body
//! and attachments are sealed to that recipient's public key. One failure
//! fails the envelope.

use std::time::SystemTime;

use async_trait::async_trait;
use uuid::Uuid;

use crate::crypto::{seal, RecipientKey, SealError, SealedBox};
use crate::pipeline::{Middleware, Next, PipelineContext, PipelineError};
use crate::smtp::address::Address;
use crate::smtp::envelope::{Attachment, MessageContent};

/// A sealed attachment. Only the MIME metadata stays readable.
#[derive(Debug, Clone)]
pub struct SealedAttachment {
    pub filename: Option<SealedBox>,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    pub inline: bool,
    pub data: SealedBox,
}

/// What the ingress hands on for one recipient.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub id: Uuid,
    pub envelope_id: Uuid,
    pub to: Address,
    pub from: SealedBox,
    pub to_list: SealedBox,
    pub subject: SealedBox,
    pub body: SealedBox,
    pub attachments: Vec<SealedAttachment>,
    /// Captured body size in bytes.
    pub size: usize,
    pub received_at: SystemTime,
    pub valid_until: SystemTime,
    /// The body arrived without TLS.
    pub insecure: bool,
}

pub struct Encryption;

#[async_trait]
impl Middleware for Encryption {
    fn name(&self) -> &'static str {
        "encryption"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), PipelineError> {
        if ctx.envelope.content.is_none() {
            ctx.envelope
                .parse_body()
                .map_err(|_| PipelineError::Malformed)?;
        }
        let content = ctx
            .envelope
            .content
            .as_ref()
            .ok_or(PipelineError::Malformed)?;

        let to_list = ctx
            .envelope
            .recipients
            .iter()
            .map(Address::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let from = ctx.envelope.sender.to_string();

        for recipient in &ctx.recipients {
            let key = &recipient.account.public_key;
            let sealed = SealedMessage {
                id: Uuid::new_v4(),
                envelope_id: ctx.envelope.id,
                to: recipient.address.clone(),
                from: seal(key, from.as_bytes())?,
                to_list: seal(key, to_list.as_bytes())?,
                subject: seal(key, content.subject.as_deref().unwrap_or_default().as_bytes())?,
                body: seal(key, content.preferred_body().as_bytes())?,
                attachments: seal_attachments(key, content)?,
                size: ctx.envelope.size,
                received_at: ctx.envelope.received_at,
                valid_until: ctx.envelope.received_at + recipient.account.retention,
                insecure: !ctx.envelope.secure,
            };
            ctx.sealed.push(sealed);
        }

        tracing::debug!(
            envelope_id = %ctx.envelope.id,
            sealed = ctx.sealed.len(),
            "Envelope sealed"
        );
        next.run(ctx).await
    }
}

fn seal_attachments(
    key: &RecipientKey,
    content: &MessageContent,
) -> Result<Vec<SealedAttachment>, SealError> {
    content
        .attachments
        .iter()
        .map(|attachment: &Attachment| -> Result<SealedAttachment, SealError> {
            Ok(SealedAttachment {
                filename: attachment
                    .filename
                    .as_deref()
                    .map(|name| seal(key, name.as_bytes()))
                    .transpose()?,
                content_type: attachment.content_type.clone(),
                content_id: attachment.content_id.clone(),
                inline: attachment.inline,
                data: seal(key, &attachment.data)?,
            })
        })
        .collect()
}
