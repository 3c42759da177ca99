//! Recipient resolution.
//!
//! Looks every envelope recipient up in the account directory. Unknown
//! recipients are dropped without telling the peer; a failed lookup fails
//! the whole envelope. One deadline bounds the resolution of all
//! recipients together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::directory::AccountDirectory;
use crate::observability::metrics;
use crate::pipeline::{Middleware, Next, PipelineContext, PipelineError, ResolvedRecipient};
use crate::smtp::address::Address;

pub struct RecipientResolution {
    directory: Arc<dyn AccountDirectory>,
    timeout: Duration,
}

impl RecipientResolution {
    pub fn new(directory: Arc<dyn AccountDirectory>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    async fn resolve(&self, addresses: &[Address]) -> Result<Vec<ResolvedRecipient>, PipelineError> {
        let mut resolved = Vec::with_capacity(addresses.len());
        for address in addresses {
            match self.directory.lookup(address).await {
                Ok(Some(account)) => {
                    metrics::record_directory_lookup("found");
                    resolved.push(ResolvedRecipient {
                        address: address.clone(),
                        account,
                    });
                }
                Ok(None) => {
                    metrics::record_directory_lookup("unknown");
                    tracing::debug!(recipient = %address, "Dropping unknown recipient");
                }
                Err(e) => {
                    metrics::record_directory_lookup("error");
                    tracing::warn!(recipient = %address, error = %e, "Directory lookup failed");
                    return Err(e.into());
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Middleware for RecipientResolution {
    fn name(&self) -> &'static str {
        "recipient_resolution"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), PipelineError> {
        let resolved = tokio::time::timeout(self.timeout, self.resolve(&ctx.envelope.recipients))
            .await
            .map_err(|_| {
                metrics::record_directory_lookup("timeout");
                tracing::warn!(
                    envelope_id = %ctx.envelope.id,
                    timeout = ?self.timeout,
                    "Recipient resolution timed out"
                );
                PipelineError::Timeout(self.timeout)
            })??;
        ctx.recipients.extend(resolved);
        next.run(ctx).await
    }
}
