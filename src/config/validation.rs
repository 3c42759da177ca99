//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//! - Check that TLS material and directory endpoints are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::{ClientAuth, ServerConfig};
use crate::crypto::RecipientKey;
use crate::smtp::address::Address;

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required value is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A numeric limit is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// A socket address does not parse.
    #[error("{field} is not a valid socket address: {value}")]
    InvalidSocketAddr { field: &'static str, value: String },

    /// The hostname is not a usable domain name.
    #[error("smtp.hostname is not a valid domain: {0}")]
    InvalidHostname(String),

    /// A referenced file does not exist.
    #[error("{field} points to a missing file: {path}")]
    MissingFile { field: &'static str, path: String },

    /// Client certificate verification needs a CA bundle.
    #[error("tls.client_ca_path is required when tls.client_auth is not \"none\"")]
    MissingClientCa,

    /// The directory URL is not an http(s) URL.
    #[error("directory.url is invalid: {0}")]
    InvalidUrl(String),

    /// A static account entry is unusable.
    #[error("directory.accounts[{index}] is invalid: {reason}")]
    InvalidAccount { index: usize, reason: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let smtp = &config.smtp;

    if smtp.hostname.is_empty() {
        errors.push(ValidationError::Empty("smtp.hostname"));
    } else if !is_domain(&smtp.hostname) {
        errors.push(ValidationError::InvalidHostname(smtp.hostname.clone()));
    }
    for domain in &smtp.accepted_domains {
        if !is_domain(domain) {
            errors.push(ValidationError::InvalidHostname(domain.clone()));
        }
    }

    if smtp.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidSocketAddr {
            field: "smtp.bind_address",
            value: smtp.bind_address.clone(),
        });
    }

    let limits = [
        ("smtp.max_sessions", smtp.max_sessions as u64),
        ("smtp.max_recipients", smtp.max_recipients as u64),
        ("smtp.max_envelope_size", smtp.max_envelope_size as u64),
        ("smtp.max_line_length", smtp.max_line_length as u64),
        ("smtp.idle_timeout_secs", smtp.idle_timeout_secs),
        ("smtp.max_detached_deliveries", smtp.max_detached_deliveries as u64),
        ("directory.timeout_ms", config.directory.timeout_ms),
    ];
    for (field, value) in limits {
        if value == 0 {
            errors.push(ValidationError::Zero(field));
        }
    }

    if let Some(tls) = &config.tls {
        check_file(&mut errors, "tls.cert_path", &tls.cert_path);
        check_file(&mut errors, "tls.key_path", &tls.key_path);
        match (&tls.client_auth, &tls.client_ca_path) {
            (ClientAuth::None, _) => {}
            (_, None) => errors.push(ValidationError::MissingClientCa),
            (_, Some(path)) => check_file(&mut errors, "tls.client_ca_path", path),
        }
    }

    if let Some(raw) = &config.directory.url {
        match url::Url::parse(raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => errors.push(ValidationError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            ))),
            Err(e) => errors.push(ValidationError::InvalidUrl(e.to_string())),
        }
    }

    for (index, account) in config.directory.accounts.iter().enumerate() {
        if let Err(e) = Address::parse(&account.address) {
            errors.push(ValidationError::InvalidAccount {
                index,
                reason: e.to_string(),
            });
        }
        if let Err(e) = RecipientKey::from_base64(&account.public_key) {
            errors.push(ValidationError::InvalidAccount {
                index,
                reason: e.to_string(),
            });
        }
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidSocketAddr {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_file(errors: &mut Vec<ValidationError>, field: &'static str, path: &str) {
    if !Path::new(path).is_file() {
        errors.push(ValidationError::MissingFile {
            field,
            path: path.to_string(),
        });
    }
}

/// Loose RFC 1035 check: dot-separated labels of alphanumerics and hyphens.
fn is_domain(value: &str) -> bool {
    value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}
