//! Anonymous public-key sealing of message parts.
//!
//! Each call generates a fresh X25519 ephemeral key pair, agrees a shared
//! secret with the recipient's static key, derives a one-time symmetric key
//! with HKDF-SHA256 and encrypts with XChaCha20-Poly1305.
//!
//! ## Security Notes
//!
//! - Ephemeral secrets never leave `seal`
//! - Derived keys are zeroized on drop
//! - Non-contributory (low-order) recipient keys are refused
//! - Nonces are random 192-bit values from OsRng

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the XChaCha20 nonce in bytes.
pub const NONCE_SIZE: usize = 24;

const KDF_INFO: &[u8] = b"mx-ingress seal v1";

/// Errors raised while sealing or opening.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Key material is not valid base64.
    #[error("invalid key encoding: {0}")]
    InvalidEncoding(String),

    /// The recipient key is a low-order point.
    #[error("recipient key is not contributory")]
    WeakKey,

    /// Key derivation failed.
    #[error("key derivation failed")]
    Kdf,

    /// AEAD encryption or authentication failed.
    #[error("cipher operation failed")]
    Cipher,
}

/// A mailbox's X25519 public key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientKey {
    bytes: [u8; PUBLIC_KEY_SIZE],
}

impl RecipientKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SealError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| SealError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Decode from standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, SealError> {
        let raw = B64
            .decode(encoded.trim())
            .map_err(|e| SealError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&raw)
    }

    /// Encode as standard base64.
    pub fn to_base64(&self) -> String {
        B64.encode(self.bytes)
    }

    /// Get the key as bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for RecipientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecipientKey({:02x}{:02x}..)", self.bytes[0], self.bytes[1])
    }
}

/// A mailbox's static secret. The server never holds one outside tests and
/// tooling; it exists so that sealed output can be verified.
pub struct MailboxSecret {
    secret: StaticSecret,
}

impl MailboxSecret {
    /// Generate a new random secret.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// The matching public key.
    pub fn public_key(&self) -> RecipientKey {
        RecipientKey {
            bytes: PublicKey::from(&self.secret).to_bytes(),
        }
    }
}

impl std::fmt::Debug for MailboxSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MailboxSecret([REDACTED])")
    }
}

/// Ciphertext plus everything the recipient needs to open it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Sender-side ephemeral public key.
    pub ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    /// Random XChaCha20 nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the Poly1305 tag appended.
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    /// Total encoded size in bytes.
    pub fn len(&self) -> usize {
        PUBLIC_KEY_SIZE + NONCE_SIZE + self.ciphertext.len()
    }

    /// Whether the ciphertext is empty (never true for a valid box).
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

impl std::fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBox")
            .field("len", &self.len())
            .finish()
    }
}

/// Seal `plaintext` so that only the holder of `recipient`'s secret can read it.
pub fn seal(recipient: &RecipientKey, plaintext: &[u8]) -> Result<SealedBox, SealError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.bytes));
    if !shared.was_contributory() {
        return Err(SealError::WeakKey);
    }

    let key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient.bytes)?;
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(key.as_ref().into());
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &ephemeral_public,
            },
        )
        .map_err(|_| SealError::Cipher)?;

    Ok(SealedBox {
        ephemeral_public,
        nonce,
        ciphertext,
    })
}

/// Open a box sealed to `secret`'s public key.
pub fn open(secret: &MailboxSecret, sealed: &SealedBox) -> Result<Vec<u8>, SealError> {
    let recipient_public = PublicKey::from(&secret.secret).to_bytes();
    let shared = secret
        .secret
        .diffie_hellman(&PublicKey::from(sealed.ephemeral_public));
    if !shared.was_contributory() {
        return Err(SealError::WeakKey);
    }

    let key = derive_key(shared.as_bytes(), &sealed.ephemeral_public, &recipient_public)?;
    let cipher = XChaCha20Poly1305::new(key.as_ref().into());
    cipher
        .decrypt(
            XNonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: &sealed.ephemeral_public,
            },
        )
        .map_err(|_| SealError::Cipher)
}

fn derive_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; PUBLIC_KEY_SIZE],
    recipient_public: &[u8; PUBLIC_KEY_SIZE],
) -> Result<Zeroizing<[u8; 32]>, SealError> {
    let mut salt = [0u8; PUBLIC_KEY_SIZE * 2];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral_public);
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, okm.as_mut())
        .map_err(|_| SealError::Kdf)?;
    Ok(okm)
}
