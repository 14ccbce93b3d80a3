//! Private key files
//!
//! Handles loading and parsing SSH private keys:
//! - RSA keys (id_rsa)
//! - Ed25519 keys (id_ed25519)
//! - ECDSA keys (id_ecdsa)
//! - Encrypted keys with passphrase

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{KeyError, KeyPair, PublicKey};

/// Load a private key from file (sync version - use spawn_blocking in async contexts)
pub fn load_key_pair(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<KeyPair, KeyError> {
    let path = expand_tilde(path.as_ref());
    if !path.exists() {
        return Err(KeyError::NotFound(path));
    }

    debug!("Loading key from: {:?}", path);
    let key_data = std::fs::read_to_string(&path)?;

    let is_encrypted =
        key_data.contains("ENCRYPTED") || key_data.contains("Proc-Type: 4,ENCRYPTED");
    if is_encrypted && passphrase.is_none() {
        return Err(KeyError::PassphraseRequired);
    }

    let key = russh::keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
        let msg = e.to_string();
        if passphrase.is_some() && (msg.contains("decrypt") || msg.contains("password")) {
            KeyError::InvalidPassphrase
        } else {
            KeyError::ParseError(msg)
        }
    })?;

    let pair = KeyPair::new(key)?;
    if pair.comment().is_none() {
        if let Some(name) = path.file_name() {
            return Ok(pair.with_comment(name.to_string_lossy()));
        }
    }
    Ok(pair)
}

/// Load a private key from file without blocking the runtime
pub async fn load_key_pair_async(
    path: impl AsRef<Path>,
    passphrase: Option<&str>,
) -> Result<KeyPair, KeyError> {
    let path = path.as_ref().to_path_buf();
    let passphrase = passphrase.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || load_key_pair(&path, passphrase.as_deref()))
        .await
        .map_err(|e| KeyError::ParseError(format!("Task join error: {}", e)))?
}

/// Default SSH key paths, preferred first
pub fn default_key_paths() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let ssh_dir = home.join(".ssh");

    vec![
        ssh_dir.join("id_ed25519"),
        ssh_dir.join("id_ecdsa"),
        ssh_dir.join("id_rsa"),
    ]
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}
