//! Known hosts management for SSH host key verification
//!
//! [`KnownHostsStore`] reads and appends OpenSSH `known_hosts` files. During
//! the handshake the engine looks the server key up and, unless the host is
//! already trusted, asks the configured [`HostKeyCallback`] for a decision.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of looking a server key up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Untrusted key; the callback decides
    Untrusted(HostKeyStatus),
}

/// What the host-verification callback is asked about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostKeyStatus {
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
    /// Host not in known_hosts
    Unknown { fingerprint: String },
    /// No known_hosts data at all
    NotFound { fingerprint: String },
}

impl HostKeyStatus {
    pub fn fingerprint(&self) -> &str {
        match self {
            HostKeyStatus::Changed {
                actual_fingerprint, ..
            } => actual_fingerprint,
            HostKeyStatus::Unknown { fingerprint } | HostKeyStatus::NotFound { fingerprint } => {
                fingerprint
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    Affirmative,
    Negative,
}

/// Host-verification callback supplied by the host application.
#[async_trait]
pub trait HostKeyCallback: Send + Sync {
    async fn verify(
        &self,
        host: &str,
        port: u16,
        status: &HostKeyStatus,
    ) -> Result<HostKeyDecision, SshError>;
}

/// Non-interactive callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Reject every key that is not already trusted
    Strict,
    /// Trust-on-first-use: accept unknown hosts, reject changed keys
    AcceptNew,
    /// Accept anything, including changed keys
    AcceptAll,
}

#[async_trait]
impl HostKeyCallback for HostKeyPolicy {
    async fn verify(
        &self,
        host: &str,
        port: u16,
        status: &HostKeyStatus,
    ) -> Result<HostKeyDecision, SshError> {
        let decision = match (self, status) {
            (HostKeyPolicy::AcceptAll, _) => HostKeyDecision::Affirmative,
            (HostKeyPolicy::AcceptNew, HostKeyStatus::Changed { .. }) => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! POSSIBLE MITM ATTACK!",
                    host, port
                );
                HostKeyDecision::Negative
            }
            (HostKeyPolicy::AcceptNew, _) => HostKeyDecision::Affirmative,
            (HostKeyPolicy::Strict, _) => HostKeyDecision::Negative,
        };
        Ok(decision)
    }
}

/// Store + callback pair installed on a connection.
#[derive(Clone)]
pub struct HostVerification {
    pub store: Arc<KnownHostsStore>,
    pub callback: Arc<dyn HostKeyCallback>,
}

impl HostVerification {
    /// Look the key up, ask the callback if needed and remember accepted keys.
    pub async fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let status = match self.store.verify(host, port, key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", host, port);
                return Ok(());
            }
            HostKeyVerification::Untrusted(status) => status,
        };

        let decision = self
            .callback
            .verify(host, port, &status)
            .await
            .map_err(|e| SshError::HostVerificationFailed(format!("callback failed: {}", e)))?;

        match decision {
            HostKeyDecision::Affirmative => {
                let saved = match &status {
                    HostKeyStatus::Changed { .. } => self.store.replace_host(host, port, key),
                    _ => self.store.add_host(host, port, key),
                };
                if let Err(e) = saved {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(())
            }
            HostKeyDecision::Negative => Err(SshError::HostVerificationFailed(format!(
                "{}:{} rejected ({:?}), fingerprint {}",
                host,
                port,
                status,
                status.fingerprint()
            ))),
        }
    }
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// Cache of host -> list of keys (supports multiple key types per host)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownHostsStore {
    /// Load from `~/.ssh/known_hosts`
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"));
        Self::with_path(path)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("Known hosts file {:?} not found", self.path);
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // hashed hostnames are not matched
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// `[host]:port` keeps its port, bare hosts are lowercased
    fn normalize_hostname(host: &str) -> String {
        host.to_lowercase()
    }

    /// Lookup key for host:port in known_hosts syntax
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH format
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        if hosts.is_empty() {
            return HostKeyVerification::Untrusted(HostKeyStatus::NotFound { fingerprint });
        }

        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Untrusted(HostKeyStatus::Unknown { fingerprint });
        };

        for entry in entries.iter().filter(|e| e.key_type == actual_key_type) {
            if entry.key_data == actual_key_b64 {
                return HostKeyVerification::Verified;
            }
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|bytes| Self::fingerprint_bytes(&bytes))
                .unwrap_or_else(|_| "unknown".to_string());
            warn!(
                "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                lookup_key, actual_key_type, expected_fingerprint, fingerprint
            );
            return HostKeyVerification::Untrusted(HostKeyStatus::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            });
        }

        // host known, but not for this key type
        debug!(
            "Host {} known but no {} key stored",
            lookup_key, actual_key_type
        );
        HostKeyVerification::Untrusted(HostKeyStatus::Unknown { fingerprint })
    }

    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });

        self.append_to_file(&lookup_key, &key_type, &key_b64)?;
        info!(
            "Added host key for {} (type: {}) to known_hosts",
            lookup_key, key_type
        );
        Ok(())
    }

    /// Drop every stored key for the host, then store `key`
    pub fn replace_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        self.remove_host(host, port)?;
        self.add_host(host, port, key)
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", host, key_type, key_b64)?;
        Ok(())
    }

    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        self.hosts.write().remove(&lookup_key);

        if !self.path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&self.path)?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| match line.split_whitespace().next() {
                Some(hostnames) => !hostnames
                    .split(',')
                    .any(|h| Self::normalize_hostname(h) == lookup_key),
                None => true,
            })
            .collect();
        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        fs::write(&self.path, rewritten)?;

        info!("Removed host key for {} from known_hosts", lookup_key);
        Ok(())
    }
}

static KNOWN_HOSTS: std::sync::OnceLock<Arc<KnownHostsStore>> = std::sync::OnceLock::new();

/// Process-wide store for `~/.ssh/known_hosts`
pub fn get_known_hosts() -> Arc<KnownHostsStore> {
    KNOWN_HOSTS
        .get_or_init(|| Arc::new(KnownHostsStore::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;
    use tempfile::tempdir;

    fn host_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("GitHub.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_empty_store_reports_not_found() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::with_path(dir.path().join("known_hosts"));
        assert!(matches!(
            store.verify("example.com", 22, &host_key()),
            HostKeyVerification::Untrusted(HostKeyStatus::NotFound { .. })
        ));
    }

    #[test]
    fn test_add_then_verify_and_detect_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = KnownHostsStore::with_path(&path);
        let key = host_key();
        store.add_host("example.com", 2222, &key).unwrap();

        assert_eq!(
            store.verify("example.com", 2222, &key),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify("other.com", 22, &key),
            HostKeyVerification::Untrusted(HostKeyStatus::Unknown { .. })
        ));
        assert!(matches!(
            store.verify("example.com", 2222, &host_key()),
            HostKeyVerification::Untrusted(HostKeyStatus::Changed { .. })
        ));

        // reloading from disk sees the same entry
        let reloaded = KnownHostsStore::with_path(&path);
        assert_eq!(
            reloaded.verify("example.com", 2222, &key),
            HostKeyVerification::Verified
        );
    }

    #[tokio::test]
    async fn test_policy_decisions() {
        let changed = HostKeyStatus::Changed {
            expected_fingerprint: "a".into(),
            actual_fingerprint: "b".into(),
        };
        let unknown = HostKeyStatus::Unknown {
            fingerprint: "b".into(),
        };
        let tofu = HostKeyPolicy::AcceptNew;
        assert_eq!(
            tofu.verify("h", 22, &unknown).await.unwrap(),
            HostKeyDecision::Affirmative
        );
        assert_eq!(
            tofu.verify("h", 22, &changed).await.unwrap(),
            HostKeyDecision::Negative
        );
        assert_eq!(
            HostKeyPolicy::Strict.verify("h", 22, &unknown).await.unwrap(),
            HostKeyDecision::Negative
        );
    }

    #[tokio::test]
    async fn test_verification_remembers_and_rejects() {
        let dir = tempdir().unwrap();
        let store = Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts")));
        let key = host_key();

        let tofu = HostVerification {
            store: store.clone(),
            callback: Arc::new(HostKeyPolicy::AcceptNew),
        };
        tofu.check("example.com", 22, &key).await.unwrap();
        assert_eq!(store.verify("example.com", 22, &key), HostKeyVerification::Verified);

        let strict = HostVerification {
            store,
            callback: Arc::new(HostKeyPolicy::Strict),
        };
        assert!(matches!(
            strict.check("example.com", 22, &host_key()).await,
            Err(SshError::HostVerificationFailed(_))
        ));
    }
}
