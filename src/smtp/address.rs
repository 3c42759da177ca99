//! Mailbox address parsing.
//!
//! Paths arrive from the wire as `<local@domain>`; configuration and the
//! account directory use the bare form. Both go through [`Address::parse`].

use std::fmt;
use thiserror::Error;

/// Shortest accepted input in bytes, brackets counted when present. `a@b`
/// (3) is refused; `a@bc` and `<a@b>` pass the length check.
pub const MIN_PATH_LEN: usize = 4;

/// Longest accepted path.
pub const MAX_PATH_LEN: usize = 253;

const MAX_LABEL_LEN: usize = 63;

/// Reason an address was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address length {0} is outside {MIN_PATH_LEN}..={MAX_PATH_LEN}")]
    Length(usize),

    #[error("unbalanced angle brackets")]
    Brackets,

    #[error("malformed local part")]
    LocalPart,

    #[error("malformed domain")]
    Domain,
}

/// A syntactically valid mailbox address.
///
/// The domain is stored lowercased; the local part is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    local: String,
    domain: String,
}

impl Address {
    /// Parse a bracketed or bare address.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.len() < MIN_PATH_LEN || raw.len() > MAX_PATH_LEN {
            return Err(AddressError::Length(raw.len()));
        }

        let inner = match (raw.starts_with('<'), raw.ends_with('>')) {
            (true, true) => &raw[1..raw.len() - 1],
            (false, false) => raw,
            _ => return Err(AddressError::Brackets),
        };

        let (local, domain) = inner.rsplit_once('@').ok_or(AddressError::LocalPart)?;
        if !is_local_part(local) {
            return Err(AddressError::LocalPart);
        }
        if !is_domain(domain) {
            return Err(AddressError::Domain);
        }

        Ok(Self {
            local: local.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    /// Local part, before the `@`.
    pub fn local_part(&self) -> &str {
        &self.local
    }

    /// Lowercased domain, after the `@`.
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_local_part(local: &str) -> bool {
    !local.is_empty()
        && local.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+/=?^_`{|}~.-".contains(&b)
        })
}

fn is_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.split('.').all(|label| {
            let bytes = label.as_bytes();
            !bytes.is_empty()
                && bytes.len() <= MAX_LABEL_LEN
                && bytes[0].is_ascii_alphanumeric()
                && bytes[bytes.len() - 1].is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        })
}
