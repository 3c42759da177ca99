//! In-memory account directory.
//!
//! Serves the static `directory.accounts` list and backs tests. Addresses
//! are matched case-insensitively.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::AccountConfig;
use crate::crypto::RecipientKey;
use crate::directory::{AccountDirectory, AccountInfo, DirectoryError};
use crate::smtp::address::Address;

/// Concurrent map of address → account.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    accounts: DashMap<String, AccountInfo>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured accounts.
    pub fn from_config(accounts: &[AccountConfig]) -> Result<Self, DirectoryError> {
        let directory = Self::new();
        for account in accounts {
            let address = Address::parse(&account.address).map_err(|e| {
                DirectoryError::InvalidResponse(format!("{}: {}", account.address, e))
            })?;
            let public_key = RecipientKey::from_base64(&account.public_key).map_err(|source| {
                DirectoryError::InvalidKey {
                    address: account.address.clone(),
                    source,
                }
            })?;
            directory.insert(
                &address,
                AccountInfo {
                    public_key,
                    max_message_size: account.max_message_size,
                    max_mailbox_size: account.max_mailbox_size,
                    current_mailbox_size: account.current_mailbox_size,
                    retention: Duration::from_secs(account.retention_secs),
                },
            );
        }
        Ok(directory)
    }

    /// Add or replace an account.
    pub fn insert(&self, address: &Address, info: AccountInfo) {
        self.accounts.insert(key(address), info);
    }

    /// Remove an account, returning it if present.
    pub fn remove(&self, address: &Address) -> Option<AccountInfo> {
        self.accounts.remove(&key(address)).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

fn key(address: &Address) -> String {
    address.to_string().to_ascii_lowercase()
}

#[async_trait]
impl AccountDirectory for MemoryDirectory {
    async fn lookup(&self, address: &Address) -> Result<Option<AccountInfo>, DirectoryError> {
        Ok(self.accounts.get(&key(address)).map(|entry| entry.value().clone()))
    }
}
