//! Agent-backed public key authentication
//!
//! Signing is delegated over the ssh-agent protocol, either to the
//! in-process [`SshAgent`] (served on an in-memory pipe) or to the system
//! agent behind `SSH_AUTH_SOCK`.
//!
//! # The `AgentSigner` wrapper
//!
//! russh's built-in `impl Signer for AgentClient` returns `impl Future + Send`
//! while borrowing the `PublicKey` of the server's sign request across the
//! await. `AgentSigner` clones the key before the async block so the future
//! only captures owned values.

use std::future::Future;
use std::sync::Arc;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::auth::{auth_state, AuthState};
use super::client::ClientHandler;
use super::error::SshError;
use crate::agent::SshAgent;
use crate::reactor::Reactor;

const AGENT_PIPE_BUFFER: usize = 64 * 1024;

type DynAgentClient = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

struct AgentSigner<'a> {
    agent: &'a mut DynAgentClient,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Where an agent authenticator gets its identities from
#[derive(Clone)]
pub enum AgentSource {
    Local(Arc<SshAgent>),
    System,
}

/// Open connection to an agent
pub struct AgentConnection {
    agent: DynAgentClient,
}

impl AgentConnection {
    /// Serve `agent` on an in-memory pipe and connect to it
    pub fn local(agent: Arc<SshAgent>, reactor: &Reactor) -> Self {
        let (client_end, server_end) = tokio::io::duplex(AGENT_PIPE_BUFFER);
        reactor.spawn(async move {
            if let Err(e) = agent.serve(server_end).await {
                debug!("In-process agent connection ended: {}", e);
            }
        });
        Self {
            agent: AgentClient::connect(client_end).dynamic(),
        }
    }

    /// Connect to the system SSH Agent via `SSH_AUTH_SOCK`
    pub async fn system() -> Result<Self, SshError> {
        info!("Connecting to system SSH Agent");

        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| SshError::Auth {
                method: "publickey".to_string(),
                message: format!(
                    "Failed to connect to SSH Agent: {}. \
                     Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ),
            })?;
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(unix))]
        {
            Err(SshError::Auth {
                method: "publickey".to_string(),
                message: "SSH Agent is not supported on this platform".to_string(),
            })
        }
    }

    pub async fn open(source: &AgentSource, reactor: &Reactor) -> Result<Self, SshError> {
        match source {
            AgentSource::Local(agent) => Ok(Self::local(agent.clone(), reactor)),
            AgentSource::System => Self::system().await,
        }
    }

    pub async fn identities(&mut self) -> Result<Vec<ssh_key::PublicKey>, SshError> {
        self.agent.request_identities().await.map_err(|e| SshError::Auth {
            method: "publickey".to_string(),
            message: format!("Failed to list agent keys: {}", e),
        })
    }

    /// Try every agent identity until the server accepts one
    pub(crate) async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        user: &str,
    ) -> Result<AuthState, SshError> {
        let keys = self.identities().await?;
        if keys.is_empty() {
            return Err(SshError::Auth {
                method: "publickey".to_string(),
                message: "SSH Agent has no keys loaded".to_string(),
            });
        }

        info!(
            "SSH Agent reports {} key(s), attempting authentication",
            keys.len()
        );

        let mut last_state = AuthState::Denied {
            remaining: Vec::new(),
        };
        for key in &keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());
            let hash_alg = if key.algorithm().is_rsa() {
                handle.best_supported_rsa_hash().await?.flatten()
            } else {
                None
            };

            match handle
                .authenticate_publickey_with(
                    user,
                    key.clone(),
                    hash_alg,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) => {
                    let state = auth_state(result);
                    match state {
                        AuthState::Success | AuthState::Partial { .. } => {
                            info!("Agent key accepted: {}", key.comment());
                            return Ok(state);
                        }
                        other => {
                            debug!("Key rejected by server: {}", key.comment());
                            last_state = other;
                        }
                    }
                }
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                }
            }
        }

        Ok(last_state)
    }
}
