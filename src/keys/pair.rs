//! Private keys held in memory

use std::sync::Arc;

use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::{self, HashAlg, Mpint};
use russh::keys::{PrivateKey, PublicKeyBase64};
use rsa::pkcs1v15::SigningKey;
use rsa::BigUint;
use signature::SignatureEncoding;

use super::public::verify_with;
use super::{encode_signature, KeyError, KeyType, PublicKey, Signer};

/// A decoded private key (RSA, ECDSA or Ed25519).
#[derive(Clone)]
pub struct KeyPair {
    key: Arc<PrivateKey>,
    key_type: KeyType,
    comment: Option<String>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_type", &self.key_type)
            .field("comment", &self.comment)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn new(key: PrivateKey) -> Result<Self, KeyError> {
        let key_type = KeyType::from_algorithm(&key.algorithm())
            .ok_or_else(|| KeyError::UnsupportedKeyType(key.algorithm().to_string()))?;
        let comment = Some(key.comment().to_string()).filter(|c| !c.is_empty());
        Ok(Self {
            key: Arc::new(key),
            key_type,
            comment,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Decode an OpenSSH/PEM private key.
    pub fn from_openssh(data: &str, passphrase: Option<&str>) -> Result<Self, KeyError> {
        let key = russh::keys::decode_secret_key(data, passphrase)
            .map_err(|e| KeyError::ParseError(e.to_string()))?;
        Self::new(key)
    }

    pub fn private_key(&self) -> &Arc<PrivateKey> {
        &self.key
    }

    fn sign_rsa(&self, keypair: &RsaKeypair, data: &[u8], hash: Option<HashAlg>) -> Result<Vec<u8>, KeyError> {
        let private = rsa_private_key(keypair)?;
        let (name, raw) = match hash {
            Some(HashAlg::Sha256) => (
                "rsa-sha2-256",
                sign_pkcs1::<sha2::Sha256>(private, data)?,
            ),
            Some(HashAlg::Sha512) => (
                "rsa-sha2-512",
                sign_pkcs1::<sha2::Sha512>(private, data)?,
            ),
            _ => ("ssh-rsa", sign_pkcs1::<sha1::Sha1>(private, data)?),
        };
        Ok(encode_signature(name, &raw))
    }
}

impl PublicKey for KeyPair {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn public_blob(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.key.public_key().public_key_bytes())
    }

    fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        verify_with(self.key.public_key(), data, signature)
    }
}

impl Signer for KeyPair {
    fn sign(&self, data: &[u8], hash: Option<HashAlg>) -> Result<Vec<u8>, KeyError> {
        match self.key.key_data() {
            KeypairData::Rsa(keypair) => self.sign_rsa(keypair, data, hash),
            KeypairData::Ed25519(_) | KeypairData::Ecdsa(_) => {
                let sig: ssh_key::Signature = signature::Signer::try_sign(self.key.as_ref(), data)
                    .map_err(|e| KeyError::SigningFailed(e.to_string()))?;
                Ok(encode_signature(sig.algorithm().as_str(), sig.as_bytes()))
            }
            _ => Err(KeyError::UnsupportedKeyType(self.key_type.to_string())),
        }
    }

    fn ssh_public_key(&self) -> Result<russh::keys::PublicKey, KeyError> {
        Ok(self.key.public_key().clone())
    }

    fn key_pair(&self) -> Option<&KeyPair> {
        Some(self)
    }
}

pub(super) fn mpint_to_biguint(value: &Mpint) -> Result<BigUint, KeyError> {
    value
        .as_positive_bytes()
        .map(BigUint::from_bytes_be)
        .ok_or_else(|| KeyError::ParseError("negative RSA component".to_string()))
}

fn rsa_private_key(keypair: &RsaKeypair) -> Result<rsa::RsaPrivateKey, KeyError> {
    let n = mpint_to_biguint(&keypair.public.n)?;
    let e = mpint_to_biguint(&keypair.public.e)?;
    let d = mpint_to_biguint(&keypair.private.d)?;
    let p = mpint_to_biguint(&keypair.private.p)?;
    let q = mpint_to_biguint(&keypair.private.q)?;
    rsa::RsaPrivateKey::from_components(n, e, d, vec![p, q])
        .map_err(|e| KeyError::ParseError(format!("invalid RSA key: {}", e)))
}

fn sign_pkcs1<D>(private: rsa::RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, KeyError>
where
    D: sha2::Digest + rsa::pkcs8::AssociatedOid,
{
    let signing_key = SigningKey::<D>::new(private);
    let sig = signature::Signer::try_sign(&signing_key, data)
        .map_err(|e| KeyError::SigningFailed(e.to_string()))?;
    Ok(sig.to_vec())
}
