//! Public keys received from peers (agent requests, host keys)

use russh::keys::ssh_key::public::KeyData;
use russh::keys::ssh_key::{self, Algorithm};
use russh::keys::PublicKeyBase64;
use rsa::pkcs1v15::VerifyingKey;

use super::pair::mpint_to_biguint;
use super::{split_signature, KeyError, KeyType, PublicKey};

/// Verification-only key decoded from its wire blob.
#[derive(Debug, Clone)]
pub struct RemotePublicKey {
    key: ssh_key::PublicKey,
    key_type: KeyType,
}

impl RemotePublicKey {
    pub fn new(key: ssh_key::PublicKey) -> Result<Self, KeyError> {
        let key_type = KeyType::from_algorithm(&key.algorithm())
            .ok_or_else(|| KeyError::UnsupportedKeyType(key.algorithm().to_string()))?;
        Ok(Self { key, key_type })
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, KeyError> {
        let key =
            ssh_key::PublicKey::from_bytes(blob).map_err(|e| KeyError::ParseError(e.to_string()))?;
        Self::new(key)
    }

    pub fn from_openssh(line: &str) -> Result<Self, KeyError> {
        let key = ssh_key::PublicKey::from_openssh(line)
            .map_err(|e| KeyError::ParseError(e.to_string()))?;
        Self::new(key)
    }

    pub fn inner(&self) -> &ssh_key::PublicKey {
        &self.key
    }
}

impl PublicKey for RemotePublicKey {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn public_blob(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.key.public_key_bytes())
    }

    fn comment(&self) -> Option<&str> {
        Some(self.key.comment()).filter(|c| !c.is_empty())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        verify_with(&self.key, data, signature)
    }
}

/// Check a wire-form signature against `key`.
///
/// A signature that parses but does not match yields `Ok(false)`.
pub(crate) fn verify_with(
    key: &ssh_key::PublicKey,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let (name, raw) = split_signature(signature)?;
    match key.key_data() {
        KeyData::Rsa(rsa_key) => {
            let n = mpint_to_biguint(&rsa_key.n)?;
            let e = mpint_to_biguint(&rsa_key.e)?;
            let public = rsa::RsaPublicKey::new(n, e)
                .map_err(|e| KeyError::ParseError(format!("invalid RSA key: {}", e)))?;
            let sig = match rsa::pkcs1v15::Signature::try_from(raw) {
                Ok(sig) => sig,
                Err(_) => return Ok(false),
            };
            let ok = match name {
                "rsa-sha2-256" => {
                    signature::Verifier::verify(&VerifyingKey::<sha2::Sha256>::new(public), data, &sig)
                        .is_ok()
                }
                "rsa-sha2-512" => {
                    signature::Verifier::verify(&VerifyingKey::<sha2::Sha512>::new(public), data, &sig)
                        .is_ok()
                }
                "ssh-rsa" => {
                    signature::Verifier::verify(&VerifyingKey::<sha1::Sha1>::new(public), data, &sig)
                        .is_ok()
                }
                other => {
                    return Err(KeyError::MalformedSignature(format!(
                        "unexpected RSA signature algorithm {}",
                        other
                    )))
                }
            };
            Ok(ok)
        }
        _ => {
            let algorithm =
                Algorithm::new(name).map_err(|e| KeyError::MalformedSignature(e.to_string()))?;
            if algorithm != key.algorithm() {
                return Ok(false);
            }
            let sig = ssh_key::Signature::new(algorithm, raw.to_vec())
                .map_err(|e| KeyError::MalformedSignature(e.to_string()))?;
            Ok(signature::Verifier::verify(key, data, &sig).is_ok())
        }
    }
}
