//! Envelope processing pipeline.
//!
//! # Data Flow
//! ```text
//! Envelope (after DATA)
//!     → resolve.rs  (directory lookup, unknown recipients dropped)
//!     → quota.rs    (size and mailbox limits, whole-envelope reject)
//!     → encrypt.rs  (seal per recipient public key)
//!     → terminal    (release capture buffer)
//!     → Vec<SealedMessage>
//! ```
//!
//! # Design Decisions
//! - Built once at startup, shared by every session
//! - Each middleware receives `next` and decides whether to continue
//! - The first middleware added runs first
//! - Any error rejects the whole envelope; nothing partial is returned

pub mod encrypt;
pub mod quota;
pub mod resolve;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::SealError;
use crate::directory::{AccountDirectory, AccountInfo, DirectoryError};
use crate::smtp::address::Address;
use crate::smtp::envelope::Envelope;
use crate::smtp::response::Reply;

pub use encrypt::{Encryption, SealedAttachment, SealedMessage};
pub use quota::QuotaEnforcement;
pub use resolve::RecipientResolution;

/// Reasons the pipeline rejects an envelope.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error("directory lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("message of {size} bytes exceeds recipient limit of {limit}")]
    MessageTooLarge { size: u64, limit: u64 },

    #[error("mailbox quota exceeded")]
    QuotaExceeded,

    #[error("message body is malformed")]
    Malformed,

    #[error("sealing failed: {0}")]
    Seal(#[from] SealError),
}

impl PipelineError {
    /// The reply sent to the peer for this failure.
    pub fn reply(&self) -> Reply {
        match self {
            PipelineError::MessageTooLarge { .. } => Reply::MessageTooLarge,
            PipelineError::QuotaExceeded => Reply::QuotaExceeded,
            PipelineError::Malformed => Reply::MalformedMessage,
            PipelineError::Directory(_) | PipelineError::Timeout(_) | PipelineError::Seal(_) => {
                Reply::ProcessingFailed
            }
        }
    }
}

/// A recipient the directory knows about.
#[derive(Debug, Clone)]
pub struct ResolvedRecipient {
    pub address: Address,
    pub account: AccountInfo,
}

/// Mutable state threaded through the middlewares.
#[derive(Debug)]
pub struct PipelineContext {
    pub envelope: Envelope,
    pub recipients: Vec<ResolvedRecipient>,
    pub sealed: Vec<SealedMessage>,
}

impl PipelineContext {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            recipients: Vec::new(),
            sealed: Vec::new(),
        }
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Process the context, then call `next.run(ctx)` to continue, or return
    /// early to short-circuit.
    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), PipelineError>;
}

/// Final step, run after the last middleware.
pub type Terminal = Box<dyn Fn(&mut PipelineContext) + Send + Sync>;

/// Continuation handed to each middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    /// Run the remaining middlewares and the terminal step.
    pub async fn run(self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                tracing::trace!(middleware = middleware.name(), "Running middleware");
                let next = Next {
                    rest,
                    terminal: self.terminal,
                };
                middleware.handle(ctx, next).await
            }
            None => {
                (self.terminal)(ctx);
                Ok(())
            }
        }
    }
}

/// Terminal step of the standard pipeline: hand the capture buffer back.
pub fn release_buffers(ctx: &mut PipelineContext) {
    ctx.envelope.release_body();
}

/// Ordered middleware chain.
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Terminal,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder {
            middlewares: Vec::new(),
        }
    }

    /// Resolution, quota enforcement and encryption, in that order.
    pub fn standard(directory: Arc<dyn AccountDirectory>, lookup_timeout: Duration) -> Self {
        Self::builder()
            .with(RecipientResolution::new(directory, lookup_timeout))
            .with(QuotaEnforcement)
            .with(Encryption)
            .build(release_buffers)
    }

    /// Names of the configured middlewares, in execution order.
    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Process one envelope.
    ///
    /// The capture buffer is released on every path.
    pub async fn run(&self, envelope: Envelope) -> Result<Vec<SealedMessage>, PipelineError> {
        let mut ctx = PipelineContext::new(envelope);
        let next = Next {
            rest: &self.middlewares,
            terminal: &self.terminal,
        };
        let result = next.run(&mut ctx).await;
        ctx.envelope.release_body();
        result?;
        Ok(ctx.sealed)
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Append a middleware; it runs after the ones already added.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Finish with the terminal step.
    pub fn build(self, terminal: impl Fn(&mut PipelineContext) + Send + Sync + 'static) -> Pipeline {
        Pipeline {
            middlewares: self.middlewares,
            terminal: Box::new(terminal),
        }
    }
}
