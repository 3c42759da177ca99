//! Account directory client.
//!
//! The directory owns mailbox accounts; this crate only asks it one
//! question per recipient: does the mailbox exist, and if so, what is its
//! public key and what are its quota limits.
//!
//! # Data Flow
//! ```text
//! pipeline::resolve
//!     → AccountDirectory::lookup(address)
//!         → http.rs   (remote directory, JSON over HTTP)
//!         → memory.rs (static accounts from config)
//!     → Option<AccountInfo>
//! ```
//!
//! # Design Decisions
//! - Lookups are idempotent; retries are left to the caller
//! - Unknown mailboxes are `Ok(None)`, never an error
//! - The caller applies the timeout so every backend gets the same bound

pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::DirectoryConfig;
use crate::crypto::{RecipientKey, SealError};
use crate::smtp::address::Address;

pub use http::HttpDirectory;
pub use memory::MemoryDirectory;

/// Public information about one mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub public_key: RecipientKey,
    pub max_message_size: Option<u64>,
    pub max_mailbox_size: Option<u64>,
    pub current_mailbox_size: Option<u64>,
    pub retention: Duration,
}

/// Directory call failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Transport(String),

    #[error("directory answered with status {0}")]
    Status(u16),

    #[error("directory response is invalid: {0}")]
    InvalidResponse(String),

    #[error("account {address} has an unusable public key: {source}")]
    InvalidKey { address: String, source: SealError },
}

/// Resolves recipient addresses to account information.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Look up `address`. `Ok(None)` means the mailbox does not exist.
    async fn lookup(&self, address: &Address) -> Result<Option<AccountInfo>, DirectoryError>;
}

/// Build the directory described by the configuration: remote when a URL is
/// set, otherwise the static account list.
pub fn from_config(config: &DirectoryConfig) -> Result<Arc<dyn AccountDirectory>, DirectoryError> {
    match &config.url {
        Some(url) => {
            tracing::info!(url = %url, "Using HTTP account directory");
            Ok(Arc::new(HttpDirectory::new(url, config.timeout())?))
        }
        None => {
            tracing::info!(accounts = config.accounts.len(), "Using static account directory");
            Ok(Arc::new(MemoryDirectory::from_config(&config.accounts)?))
        }
    }
}
