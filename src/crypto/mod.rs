//! Envelope sealing.
//!
//! Message parts are sealed to each recipient's X25519 public key before
//! they leave the ingress. The server only ever holds public keys.

pub mod seal;

pub use seal::{open, seal, MailboxSecret, RecipientKey, SealError, SealedBox};
