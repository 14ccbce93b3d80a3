//! Key material: public keys, signers and certificate-wrapped signers
//!
//! The engine never assumes where keys live. Host applications hand it
//! anything implementing [`Signer`]; the agent ring and the publickey
//! authenticator only rely on the trait surface below.
//!
//! Signatures cross these APIs in SSH wire form:
//! `string(algorithm name) || string(raw signature)`.

mod certificate;
mod loader;
mod pair;
mod public;

use std::fmt;
use std::sync::Arc;

use russh::keys::ssh_key::{Algorithm, HashAlg};
use thiserror::Error;

pub use certificate::CertifiedKey;
pub use loader::{default_key_paths, expand_tilde, load_key_pair, load_key_pair_async};
pub use pair::KeyPair;
pub use public::RemotePublicKey;

/// Errors that can occur while handling key material
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key file not found: {0}")]
    NotFound(std::path::PathBuf),

    #[error("Failed to read key file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse key: {0}")]
    ParseError(String),

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),
}

/// Key family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl KeyType {
    pub fn from_algorithm(algorithm: &Algorithm) -> Option<Self> {
        match algorithm {
            Algorithm::Rsa { .. } => Some(KeyType::Rsa),
            Algorithm::Dsa => Some(KeyType::Dsa),
            Algorithm::Ecdsa { .. } => Some(KeyType::Ecdsa),
            Algorithm::Ed25519 => Some(KeyType::Ed25519),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::Rsa => "RSA",
            KeyType::Dsa => "DSA",
            KeyType::Ecdsa => "ECDSA",
            KeyType::Ed25519 => "ED25519",
        };
        f.write_str(name)
    }
}

/// Public half of a key.
pub trait PublicKey: Send + Sync + fmt::Debug {
    fn key_type(&self) -> KeyType;

    /// `true` for OpenSSH certificate variants.
    fn is_certificate(&self) -> bool {
        false
    }

    /// SSH wire encoding of the public key (or certificate).
    fn public_blob(&self) -> Result<Vec<u8>, KeyError>;

    fn comment(&self) -> Option<&str> {
        None
    }

    /// Verify a wire-form signature over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, KeyError>;

    /// Keys are the same key when their public blobs are equal.
    fn same_key(&self, other: &dyn PublicKey) -> bool {
        match (self.public_blob(), other.public_blob()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// A key that can produce signatures.
pub trait Signer: PublicKey {
    /// Sign `data`. `hash` selects the RSA variant (`rsa-sha2-256` /
    /// `rsa-sha2-512`); `None` means the key type's base algorithm.
    fn sign(&self, data: &[u8], hash: Option<HashAlg>) -> Result<Vec<u8>, KeyError>;

    /// Owned `russh` form of the public key, used on the authentication wire.
    fn ssh_public_key(&self) -> Result<russh::keys::PublicKey, KeyError>;

    /// The raw key pair, when this signer holds one in memory.
    fn key_pair(&self) -> Option<&KeyPair> {
        None
    }

    fn certificate(&self) -> Option<&russh::keys::ssh_key::Certificate> {
        None
    }
}

pub type SharedSigner = Arc<dyn Signer>;

/// Split a wire-form signature into (algorithm name, raw bytes).
pub fn split_signature(signature: &[u8]) -> Result<(&str, &[u8]), KeyError> {
    let mut reader = crate::wire::SshReader::new(signature);
    let name = reader
        .get_utf8()
        .map_err(|e| KeyError::MalformedSignature(e.to_string()))?;
    let raw = reader
        .get_string()
        .map_err(|e| KeyError::MalformedSignature(e.to_string()))?;
    Ok((name, raw))
}

/// Build a wire-form signature.
pub fn encode_signature(algorithm: &str, raw: &[u8]) -> Vec<u8> {
    let mut writer = crate::wire::SshWriter::with_capacity(algorithm.len() + raw.len() + 8);
    writer.put_string(algorithm.as_bytes()).put_string(raw);
    writer.into_vec()
}
