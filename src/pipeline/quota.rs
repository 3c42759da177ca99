//! Quota enforcement.
//!
//! Rejects the whole envelope if it is larger than any resolved recipient
//! accepts, or would push any recipient's mailbox past its quota.

use async_trait::async_trait;

use crate::pipeline::{Middleware, Next, PipelineContext, PipelineError};

pub struct QuotaEnforcement;

#[async_trait]
impl Middleware for QuotaEnforcement {
    fn name(&self) -> &'static str {
        "quota_enforcement"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), PipelineError> {
        let size = ctx.envelope.size as u64;
        for recipient in &ctx.recipients {
            let account = &recipient.account;
            if let Some(limit) = account.max_message_size {
                if size > limit {
                    tracing::info!(recipient = %recipient.address, size, limit, "Message exceeds recipient size limit");
                    return Err(PipelineError::MessageTooLarge { size, limit });
                }
            }
            if let Some(quota) = account.max_mailbox_size {
                let used = account.current_mailbox_size.unwrap_or(0);
                if used.saturating_add(size) > quota {
                    tracing::info!(recipient = %recipient.address, size, used, quota, "Mailbox quota exceeded");
                    return Err(PipelineError::QuotaExceeded);
                }
            }
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MailboxSecret;
    use crate::pipeline::{testing, Pipeline, ResolvedRecipient};
    use crate::smtp::address::Address;

    /// Seeds the context with one resolved recipient.
    struct Seed(crate::directory::AccountInfo);

    #[async_trait]
    impl Middleware for Seed {
        fn name(&self) -> &'static str {
            "seed"
        }

        async fn handle(
            &self,
            ctx: &mut PipelineContext,
            next: Next<'_>,
        ) -> Result<(), PipelineError> {
            ctx.recipients.push(ResolvedRecipient {
                address: Address::parse("<b@letter.me>").unwrap(),
                account: self.0.clone(),
            });
            next.run(ctx).await
        }
    }

    async fn run_with(
        max_message: Option<u64>,
        max_mailbox: Option<u64>,
        current: Option<u64>,
    ) -> Result<(), PipelineError> {
        let mut account = testing::account(MailboxSecret::generate().public_key());
        account.max_message_size = max_message;
        account.max_mailbox_size = max_mailbox;
        account.current_mailbox_size = current;

        let pipeline = Pipeline::builder()
            .with(Seed(account))
            .with(QuotaEnforcement)
            .build(|_| {});
        let (env, _pool) = testing::envelope(&["<b@letter.me>"], &[b'x'; 100]);
        pipeline.run(env).await.map(|_| ())
    }

    #[tokio::test]
    async fn within_limits_passes() {
        assert!(run_with(Some(100), Some(1000), Some(900)).await.is_ok());
        assert!(run_with(None, None, None).await.is_ok());
    }

    #[tokio::test]
    async fn oversize_for_recipient() {
        assert!(matches!(
            run_with(Some(99), None, None).await,
            Err(PipelineError::MessageTooLarge { size: 100, limit: 99 })
        ));
    }

    #[tokio::test]
    async fn mailbox_full() {
        assert!(matches!(
            run_with(None, Some(1000), Some(901)).await,
            Err(PipelineError::QuotaExceeded)
        ));
    }
}
