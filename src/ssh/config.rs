//! SSH Configuration
//!
//! [`ClientOptions`] is the serializable half (port, timeouts, algorithm
//! preferences, declarative auth methods). [`ClientConfig`] adds the runtime
//! collaborators: authenticators, agent, host verification, proxy session.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::Preferred;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::auth::{
    AgentAuthenticator, Authenticator, KeyboardInteractiveAuthenticator, NoneAuthenticator,
    PasswordAuthenticator, PublicKeyAuthenticator,
};
use super::error::SshError;
use super::keyboard_interactive::{PasswordResponder, PromptResponder};
use super::known_hosts::{HostKeyCallback, HostKeyPolicy, HostVerification, KnownHostsStore};
use super::session::Session;
use crate::agent::SshAgent;
use crate::keys::{expand_tilde, load_key_pair, CertifiedKey, SharedSigner};
use crate::reactor::Reactor;

/// Serializable connection options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Username for authentication
    #[serde(default)]
    pub user: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keep-alive probe interval; `None` disables keep-alive
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: Option<u64>,

    /// How long one keep-alive probe may wait for the server's reply
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Consecutive probe timeouts before the session is dropped
    #[serde(default = "default_keepalive_max_misses")]
    pub keepalive_max_misses: u32,

    #[serde(default)]
    pub compression: bool,

    /// Preferred algorithm names, most preferred first. Empty = russh defaults.
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default)]
    pub kex: Vec<String>,
    #[serde(default)]
    pub macs: Vec<String>,

    /// Pause between two attempts of a would-block operation
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Authentication methods, tried in this order
    #[serde(default)]
    pub auth: Vec<AuthMethod>,

    /// Non-interactive host key callback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_policy: Option<HostKeyPolicy>,

    /// known_hosts file used with `host_key_policy` (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

/// Authentication methods that can be declared in options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    None,

    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH certificate authentication (OpenSSH certificates)
    Certificate {
        key_path: String,
        /// Path to certificate file (*-cert.pub)
        cert_path: String,
        passphrase: Option<String>,
    },

    /// The configured in-process agent, else the system agent
    Agent,

    /// Keyboard-interactive answered with a password
    KeyboardInteractive {
        #[serde(default)]
        password: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn certificate(
        key_path: impl Into<String>,
        cert_path: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self::Certificate {
            key_path: key_path.into(),
            cert_path: cert_path.into(),
            passphrase,
        }
    }

    fn authenticator(
        &self,
        agent: Option<&Arc<SshAgent>>,
    ) -> Result<Arc<dyn Authenticator>, SshError> {
        let authenticator: Arc<dyn Authenticator> = match self {
            AuthMethod::None => Arc::new(NoneAuthenticator),
            AuthMethod::Password { password } => Arc::new(PasswordAuthenticator::new(password.clone())),
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let pair = load_key_pair(expand_tilde(Path::new(key_path)), passphrase.as_deref())?;
                Arc::new(PublicKeyAuthenticator::new(Arc::new(pair)))
            }
            AuthMethod::Certificate {
                key_path,
                cert_path,
                passphrase,
            } => {
                let pair = load_key_pair(expand_tilde(Path::new(key_path)), passphrase.as_deref())?;
                let signer: SharedSigner = Arc::new(pair);
                let certified = CertifiedKey::load(expand_tilde(Path::new(cert_path)), signer)?;
                Arc::new(PublicKeyAuthenticator::new(Arc::new(certified)))
            }
            AuthMethod::Agent => match agent {
                Some(agent) => Arc::new(AgentAuthenticator::local(agent.clone())),
                None => Arc::new(AgentAuthenticator::system()),
            },
            AuthMethod::KeyboardInteractive { password } => {
                let responder: Arc<dyn PromptResponder> =
                    Arc::new(PasswordResponder::new(password.clone().unwrap_or_default()));
                Arc::new(KeyboardInteractiveAuthenticator::new(responder))
            }
        };
        Ok(authenticator)
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> Option<u64> {
    Some(15)
}

fn default_keepalive_timeout() -> u64 {
    5
}

fn default_keepalive_max_misses() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    10
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user: String::new(),
            port: 22,
            connect_timeout_secs: 30,
            keepalive_interval_secs: Some(15),
            keepalive_timeout_secs: 5,
            keepalive_max_misses: 3,
            compression: false,
            ciphers: Vec::new(),
            kex: Vec::new(),
            macs: Vec::new(),
            retry_interval_ms: 10,
            auth: Vec::new(),
            host_key_policy: None,
            known_hosts_path: None,
        }
    }
}

impl ClientOptions {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SshError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| {
            SshError::Operation(format!(
                "Invalid client options {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs.max(1))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// russh defaults, reordered and filtered by the configured names.
    pub fn preferred(&self) -> Preferred {
        let defaults = Preferred::default();
        let compression = if self.compression {
            defaults.compression.clone()
        } else {
            Cow::Borrowed(&[russh::compression::NONE][..])
        };
        Preferred {
            kex: prefer(&defaults.kex, &self.kex, "kex"),
            cipher: prefer(&defaults.cipher, &self.ciphers, "cipher"),
            mac: prefer(&defaults.mac, &self.macs, "mac"),
            compression,
            ..defaults
        }
    }

    pub(crate) fn russh_config(&self) -> russh::client::Config {
        russh::client::Config {
            // keep-alive runs on the reactor, see `Session`
            inactivity_timeout: None,
            keepalive_interval: None,
            preferred: self.preferred(),
            ..Default::default()
        }
    }
}

fn prefer<N>(supported: &[N], wanted: &[String], what: &str) -> Cow<'static, [N]>
where
    N: Copy + AsRef<str> + 'static,
{
    if wanted.is_empty() {
        return Cow::Owned(supported.to_vec());
    }
    let mut ordered = Vec::with_capacity(wanted.len());
    for name in wanted {
        match supported.iter().find(|n| n.as_ref() == name) {
            Some(n) => ordered.push(*n),
            None => warn!("Ignoring unsupported {} algorithm: {}", what, name),
        }
    }
    if ordered.is_empty() {
        warn!("No configured {} algorithm is supported, using defaults", what);
        return Cow::Owned(supported.to_vec());
    }
    Cow::Owned(ordered)
}

/// Immutable per-dial configuration
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) options: ClientOptions,
    pub(crate) authenticators: Vec<Arc<dyn Authenticator>>,
    pub(crate) agent: Option<Arc<SshAgent>>,
    pub(crate) verification: Option<HostVerification>,
    pub(crate) proxy: Option<Session>,
    pub(crate) reactor: Option<Reactor>,
}

impl ClientConfig {
    pub fn builder(user: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::from_options(ClientOptions {
            user: user.into(),
            ..Default::default()
        })
    }

    /// Build a config from options alone (declarative auth methods only).
    pub fn from_options(options: ClientOptions) -> Result<Self, SshError> {
        ClientConfigBuilder::from_options(options).build()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn user(&self) -> &str {
        &self.options.user
    }

    pub fn port(&self) -> u16 {
        self.options.port
    }

    pub fn agent(&self) -> Option<&Arc<SshAgent>> {
        self.agent.as_ref()
    }

    pub fn authenticator_methods(&self) -> Vec<&'static str> {
        self.authenticators.iter().map(|a| a.method()).collect()
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("options", &self.options)
            .field("authenticators", &self.authenticator_methods())
            .field("agent", &self.agent.is_some())
            .field("host_verification", &self.verification.is_some())
            .field("proxy", &self.proxy.is_some())
            .finish()
    }
}

pub struct ClientConfigBuilder {
    options: ClientOptions,
    authenticators: Vec<Arc<dyn Authenticator>>,
    agent: Option<Arc<SshAgent>>,
    callback: Option<Arc<dyn HostKeyCallback>>,
    known_hosts: Option<Arc<KnownHostsStore>>,
    proxy: Option<Session>,
    reactor: Option<Reactor>,
}

impl ClientConfigBuilder {
    pub fn from_options(options: ClientOptions) -> Self {
        Self {
            options,
            authenticators: Vec::new(),
            agent: None,
            callback: None,
            known_hosts: None,
            proxy: None,
            reactor: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// `None` disables keep-alive.
    pub fn keepalive(mut self, interval: Option<Duration>) -> Self {
        self.options.keepalive_interval_secs = interval.map(|i| i.as_secs().max(1));
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.options.compression = enabled;
        self
    }

    pub fn ciphers<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.options.ciphers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn kex<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.options.kex = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn macs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.options.macs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.options.retry_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticators.push(authenticator);
        self
    }

    pub fn password(self, password: impl Into<String>) -> Self {
        self.authenticator(Arc::new(PasswordAuthenticator::new(password)))
    }

    pub fn key(self, signer: SharedSigner) -> Self {
        self.authenticator(Arc::new(PublicKeyAuthenticator::new(signer)))
    }

    /// Install `agent` and authenticate with all of its identities.
    pub fn agent(mut self, agent: Arc<SshAgent>) -> Self {
        self.agent = Some(agent.clone());
        self.authenticator(Arc::new(AgentAuthenticator::local(agent)))
    }

    pub fn keyboard_interactive(self, responder: Arc<dyn PromptResponder>) -> Self {
        self.authenticator(Arc::new(KeyboardInteractiveAuthenticator::new(responder)))
    }

    pub fn host_key_callback(mut self, callback: Arc<dyn HostKeyCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn known_hosts(mut self, store: Arc<KnownHostsStore>) -> Self {
        self.known_hosts = Some(store);
        self
    }

    /// Tunnel the transport through an established session.
    pub fn proxy(mut self, session: Session) -> Self {
        self.proxy = Some(session);
        self
    }

    pub fn reactor(mut self, reactor: Reactor) -> Self {
        self.reactor = Some(reactor);
        self
    }

    /// Resolve declarative auth methods (before the explicit authenticators)
    /// and freeze the config.
    pub fn build(self) -> Result<ClientConfig, SshError> {
        let mut authenticators = Vec::with_capacity(self.options.auth.len() + self.authenticators.len());
        for method in &self.options.auth {
            authenticators.push(method.authenticator(self.agent.as_ref())?);
        }
        authenticators.extend(self.authenticators);

        let callback = self.callback.or_else(|| {
            self.options
                .host_key_policy
                .map(|policy| Arc::new(policy) as Arc<dyn HostKeyCallback>)
        });
        let verification = callback.map(|callback| {
            let store = self.known_hosts.unwrap_or_else(|| match &self.options.known_hosts_path {
                Some(path) => Arc::new(KnownHostsStore::with_path(expand_tilde(path))),
                None => super::known_hosts::get_known_hosts(),
            });
            HostVerification { store, callback }
        });

        Ok(ClientConfig {
            options: self.options,
            authenticators,
            agent: self.agent,
            verification,
            proxy: self.proxy,
            reactor: self.reactor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults_from_empty_json() {
        let options: ClientOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.port, 22);
        assert_eq!(options.connect_timeout_secs, 30);
        assert_eq!(options.keepalive_interval(), Some(Duration::from_secs(15)));
        assert_eq!(options.retry_interval(), Duration::from_millis(10));
        assert!(options.auth.is_empty());
    }

    #[test]
    fn test_options_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(
            &path,
            r#"{
                "user": "deploy",
                "port": 2222,
                "keepalive_interval_secs": null,
                "auth": [
                    {"type": "none"},
                    {"type": "password", "password": "pw"},
                    {"type": "keyboard_interactive"}
                ],
                "host_key_policy": "accept_new"
            }"#,
        )
        .unwrap();

        let options = ClientOptions::from_json_file(&path).unwrap();
        assert_eq!(options.user, "deploy");
        assert_eq!(options.port, 2222);
        assert_eq!(options.keepalive_interval(), None);
        assert_eq!(options.host_key_policy, Some(HostKeyPolicy::AcceptNew));

        let config = ClientConfig::from_options(options).unwrap();
        assert_eq!(
            config.authenticator_methods(),
            vec!["none", "password", "keyboard-interactive"]
        );
        assert!(config.verification.is_some());
    }

    #[test]
    fn test_invalid_json_is_operation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ClientOptions::from_json_file(&path),
            Err(SshError::Operation(_))
        ));
    }

    #[test]
    fn test_builder_keeps_declared_then_explicit_order() {
        let config = ClientConfig::builder("alice")
            .port(2200)
            .password("pw")
            .agent(Arc::new(SshAgent::new()))
            .build()
            .unwrap();
        assert_eq!(config.user(), "alice");
        assert_eq!(config.port(), 2200);
        assert_eq!(config.authenticator_methods(), vec!["password", "publickey"]);
        assert!(config.agent().is_some());
        assert!(config.verification.is_none());
    }

    #[test]
    fn test_preferred_reorders_and_ignores_unknown() {
        let defaults = Preferred::default();
        let (Some(first), Some(second)) = (defaults.cipher.first(), defaults.cipher.get(1)) else {
            return;
        };
        let options = ClientOptions {
            ciphers: vec![
                "no-such-cipher".to_string(),
                AsRef::<str>::as_ref(second).to_string(),
                AsRef::<str>::as_ref(first).to_string(),
            ],
            ..Default::default()
        };
        let preferred = options.preferred();
        let names: Vec<&str> = preferred.cipher.iter().map(AsRef::<str>::as_ref).collect();
        assert_eq!(
            names,
            vec![AsRef::<str>::as_ref(second), AsRef::<str>::as_ref(first)]
        );
        assert_eq!(preferred.compression.len(), 1);
        assert_eq!(preferred.kex.len(), defaults.kex.len());
    }

    #[test]
    fn test_missing_key_file_fails_build() {
        let options = ClientOptions {
            auth: vec![AuthMethod::key("/nonexistent/id_ed25519", None)],
            ..Default::default()
        };
        assert!(matches!(
            ClientConfig::from_options(options),
            Err(SshError::Key(_))
        ));
    }
}
