//! Hand-off of sealed messages.
//!
//! Storage is somebody else's job; the ingress only needs a place to put
//! what it accepted. `TracingSink` logs metadata and is the default for the
//! binary. `CollectingSink` keeps messages in memory for embedding and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::SealedMessage;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for sealed messages.
#[async_trait]
pub trait MailSink: Send + Sync {
    async fn deliver(&self, messages: Vec<SealedMessage>) -> Result<(), DeliveryError>;
}

/// Logs one event per sealed message.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl MailSink for TracingSink {
    async fn deliver(&self, messages: Vec<SealedMessage>) -> Result<(), DeliveryError> {
        for message in &messages {
            tracing::info!(
                message_id = %message.id,
                envelope_id = %message.envelope_id,
                to = %message.to,
                size = message.size,
                attachments = message.attachments.len(),
                insecure = message.insecure,
                "Sealed message ready"
            );
        }
        Ok(())
    }
}

/// Keeps every delivered message.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<SealedMessage>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything delivered so far.
    pub fn take(&self) -> Vec<SealedMessage> {
        self.messages
            .lock()
            .map(|mut messages| std::mem::take(&mut *messages))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MailSink for CollectingSink {
    async fn deliver(&self, messages: Vec<SealedMessage>) -> Result<(), DeliveryError> {
        let mut held = self
            .messages
            .lock()
            .map_err(|_| DeliveryError::Unavailable("collector poisoned".into()))?;
        held.extend(messages);
        Ok(())
    }
}
