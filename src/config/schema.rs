//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the inbound mail server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Protocol-level settings (hostname, limits, timeouts).
    pub smtp: SmtpConfig,

    /// Optional STARTTLS material. Without it STARTTLS is not advertised.
    pub tls: Option<TlsConfig>,

    /// Account directory used to resolve recipients.
    pub directory: DirectoryConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener and protocol configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Hostname announced in the greeting and used for the recipient domain check.
    pub hostname: String,

    /// Extra domains accepted in `RCPT TO` besides `hostname`.
    pub accepted_domains: Vec<String>,

    /// Bind address (e.g., "0.0.0.0:2525").
    pub bind_address: String,

    /// Maximum concurrent sessions (admission control).
    pub max_sessions: usize,

    /// Maximum recipients per envelope.
    pub max_recipients: usize,

    /// Maximum captured body size in bytes.
    pub max_envelope_size: usize,

    /// Maximum command line length in bytes.
    pub max_line_length: usize,

    /// Idle timeout in seconds, refreshed on every read.
    pub idle_timeout_secs: u64,

    /// Number of capture buffers kept warm in the buffer pool.
    pub pooled_buffers: usize,

    /// Whether the peer waits for the pipeline before the final reply.
    pub delivery_mode: DeliveryMode,

    /// Detached pipeline runs allowed at once; further ones wait for a slot.
    pub max_detached_deliveries: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            accepted_domains: Vec::new(),
            bind_address: "0.0.0.0:2525".to_string(),
            max_sessions: 1024,
            max_recipients: 100,
            max_envelope_size: 25 * 1024 * 1024,
            max_line_length: 4096,
            idle_timeout_secs: 60,
            pooled_buffers: 16,
            delivery_mode: DeliveryMode::Synchronous,
            max_detached_deliveries: 64,
        }
    }
}

impl SmtpConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Check whether `domain` is served by this instance (case-insensitive).
    pub fn serves_domain(&self, domain: &str) -> bool {
        self.hostname.eq_ignore_ascii_case(domain)
            || self
                .accepted_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }
}

/// When the final DATA reply is sent relative to pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Run the pipeline, then answer with its outcome.
    #[default]
    Synchronous,
    /// Answer immediately and run the pipeline in a background task.
    Detached,
}

/// STARTTLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Client certificate verification mode.
    #[serde(default)]
    pub client_auth: ClientAuth,

    /// CA bundle (PEM) used to verify client certificates.
    #[serde(default)]
    pub client_ca_path: Option<String>,

    /// What to do when a STARTTLS handshake fails.
    #[serde(default)]
    pub on_handshake_failure: HandshakeFailurePolicy,
}

/// Client certificate verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    /// Do not request a client certificate.
    #[default]
    None,
    /// Verify a client certificate if one is presented.
    Optional,
    /// Refuse handshakes without a verifiable client certificate.
    Required,
}

/// Session policy after a failed STARTTLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeFailurePolicy {
    /// Keep the session on the recovered plaintext stream.
    #[default]
    Continue,
    /// Close the session.
    Close,
}

/// Account directory configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// HTTP endpoint of the account directory. When unset, `accounts` is used.
    pub url: Option<String>,

    /// Per-lookup timeout in milliseconds.
    pub timeout_ms: u64,

    /// Static accounts served by the in-memory directory.
    pub accounts: Vec<AccountConfig>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 2000,
            accounts: Vec::new(),
        }
    }
}

impl DirectoryConfig {
    /// Lookup timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A statically configured mailbox.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Mailbox address.
    pub address: String,

    /// Base64 X25519 public key.
    pub public_key: String,

    /// Largest message accepted for this mailbox.
    #[serde(default)]
    pub max_message_size: Option<u64>,

    /// Mailbox quota in bytes.
    #[serde(default)]
    pub max_mailbox_size: Option<u64>,

    /// Current mailbox usage in bytes.
    #[serde(default)]
    pub current_mailbox_size: Option<u64>,

    /// How long messages are kept, in seconds.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_retention_secs() -> u64 {
    30 * 24 * 60 * 60
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline applied to every open connection once shutdown starts, in seconds.
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}

impl ShutdownConfig {
    /// Grace period as a [`Duration`].
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
