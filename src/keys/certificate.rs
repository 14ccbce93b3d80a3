//! OpenSSH certificates wrapping a signer

use std::path::Path;

use russh::keys::ssh_key::{Certificate, HashAlg};

use super::{KeyError, KeyPair, KeyType, PublicKey, SharedSigner, Signer};

/// A signer whose public identity is an OpenSSH certificate.
///
/// Signing is delegated to the wrapped key; the public blob is the
/// certificate encoding.
#[derive(Debug, Clone)]
pub struct CertifiedKey {
    certificate: Certificate,
    inner: SharedSigner,
}

impl CertifiedKey {
    pub fn new(certificate: Certificate, inner: SharedSigner) -> Result<Self, KeyError> {
        let inner_key = inner.ssh_public_key()?;
        if certificate.public_key() != inner_key.key_data() {
            return Err(KeyError::ParseError(
                "certificate does not certify the supplied key".to_string(),
            ));
        }
        Ok(Self { certificate, inner })
    }

    pub fn load(cert_path: impl AsRef<Path>, inner: SharedSigner) -> Result<Self, KeyError> {
        let certificate = russh::keys::load_openssh_certificate(cert_path.as_ref())
            .map_err(|e| KeyError::ParseError(format!("Failed to load certificate: {}", e)))?;
        Self::new(certificate, inner)
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn inner(&self) -> &SharedSigner {
        &self.inner
    }
}

impl PublicKey for CertifiedKey {
    fn key_type(&self) -> KeyType {
        self.inner.key_type()
    }

    fn is_certificate(&self) -> bool {
        true
    }

    fn public_blob(&self) -> Result<Vec<u8>, KeyError> {
        self.certificate
            .to_bytes()
            .map_err(|e| KeyError::ParseError(e.to_string()))
    }

    fn comment(&self) -> Option<&str> {
        Some(self.certificate.comment())
            .filter(|c| !c.is_empty())
            .or_else(|| self.inner.comment())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        self.inner.verify(data, signature)
    }
}

impl Signer for CertifiedKey {
    fn sign(&self, data: &[u8], hash: Option<HashAlg>) -> Result<Vec<u8>, KeyError> {
        self.inner.sign(data, hash)
    }

    fn ssh_public_key(&self) -> Result<russh::keys::PublicKey, KeyError> {
        self.inner.ssh_public_key()
    }

    fn key_pair(&self) -> Option<&KeyPair> {
        self.inner.key_pair()
    }

    fn certificate(&self) -> Option<&Certificate> {
        Some(&self.certificate)
    }
}
