//! Authenticator chain
//!
//! The engine probes the server with `none`, keeps the configured
//! authenticators whose method the server accepts (in configured order) and
//! tries them one by one. A `Partial` success restarts the filtered loop with
//! the server's new method list.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::agent::{AgentConnection, AgentSource};
use super::client::ClientHandler;
use super::error::SshError;
use super::keyboard_interactive::{check_responses, KbiPrompt, KbiRequest, PromptResponder};
use crate::agent::SshAgent;
use crate::keys::{KeyType, PublicKey, SharedSigner};
use crate::reactor::Reactor;

/// Outcome of one authentication step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Success,
    /// Rejected. `remaining` lists the methods the server still accepts
    /// (empty when the server did not say).
    Denied { remaining: Vec<String> },
    /// Accepted, but another method is still required.
    Partial { remaining: Vec<String> },
    /// The method needs another round.
    Continue(AuthStep),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Keyboard-interactive prompts waiting for answers.
    Prompts(KbiRequest),
}

/// The server side of authentication, one call per protocol exchange.
#[async_trait]
pub trait AuthTransport: Send {
    async fn auth_none(&mut self, user: &str) -> Result<AuthState, SshError>;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthState, SshError>;

    async fn auth_publickey(&mut self, user: &str, signer: &SharedSigner)
        -> Result<AuthState, SshError>;

    async fn auth_agent(&mut self, user: &str, source: &AgentSource) -> Result<AuthState, SshError>;

    async fn auth_keyboard_interactive(&mut self, user: &str) -> Result<AuthState, SshError>;

    async fn respond_keyboard_interactive(
        &mut self,
        responses: Vec<String>,
    ) -> Result<AuthState, SshError>;
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// SSH method name (`password`, `publickey`, ...).
    fn method(&self) -> &'static str;

    async fn auth(&self, transport: &mut dyn AuthTransport, user: &str)
        -> Result<AuthState, SshError>;

    /// Run the step returned in [`AuthState::Continue`].
    async fn resume(
        &self,
        transport: &mut dyn AuthTransport,
        step: AuthStep,
    ) -> Result<AuthState, SshError> {
        let _ = (transport, step);
        Err(SshError::Operation(format!(
            "{} authentication has no follow-up step",
            self.method()
        )))
    }
}

pub struct NoneAuthenticator;

#[async_trait]
impl Authenticator for NoneAuthenticator {
    fn method(&self) -> &'static str {
        "none"
    }

    async fn auth(&self, transport: &mut dyn AuthTransport, user: &str) -> Result<AuthState, SshError> {
        transport.auth_none(user).await
    }
}

pub struct PasswordAuthenticator {
    password: Zeroizing<String>,
}

impl PasswordAuthenticator {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
        }
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    fn method(&self) -> &'static str {
        "password"
    }

    async fn auth(&self, transport: &mut dyn AuthTransport, user: &str) -> Result<AuthState, SshError> {
        transport.auth_password(user, &self.password).await
    }
}

/// Public key authentication with any [`Signer`](crate::keys::Signer).
pub struct PublicKeyAuthenticator {
    signer: SharedSigner,
}

impl PublicKeyAuthenticator {
    pub fn new(signer: SharedSigner) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl Authenticator for PublicKeyAuthenticator {
    fn method(&self) -> &'static str {
        "publickey"
    }

    async fn auth(&self, transport: &mut dyn AuthTransport, user: &str) -> Result<AuthState, SshError> {
        transport.auth_publickey(user, &self.signer).await
    }
}

/// Tries every identity of an agent.
pub struct AgentAuthenticator {
    source: AgentSource,
}

impl AgentAuthenticator {
    pub fn local(agent: Arc<SshAgent>) -> Self {
        Self {
            source: AgentSource::Local(agent),
        }
    }

    pub fn system() -> Self {
        Self {
            source: AgentSource::System,
        }
    }
}

#[async_trait]
impl Authenticator for AgentAuthenticator {
    fn method(&self) -> &'static str {
        "publickey"
    }

    async fn auth(&self, transport: &mut dyn AuthTransport, user: &str) -> Result<AuthState, SshError> {
        transport.auth_agent(user, &self.source).await
    }
}

pub struct KeyboardInteractiveAuthenticator {
    responder: Arc<dyn PromptResponder>,
}

impl KeyboardInteractiveAuthenticator {
    pub fn new(responder: Arc<dyn PromptResponder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl Authenticator for KeyboardInteractiveAuthenticator {
    fn method(&self) -> &'static str {
        "keyboard-interactive"
    }

    async fn auth(&self, transport: &mut dyn AuthTransport, user: &str) -> Result<AuthState, SshError> {
        transport.auth_keyboard_interactive(user).await
    }

    async fn resume(
        &self,
        transport: &mut dyn AuthTransport,
        step: AuthStep,
    ) -> Result<AuthState, SshError> {
        let AuthStep::Prompts(request) = step;
        let kbi_error = |e: super::keyboard_interactive::KbiError| SshError::Auth {
            method: "keyboard-interactive".to_string(),
            message: e.to_string(),
        };
        let responses = self.responder.respond(&request).await.map_err(kbi_error)?;
        check_responses(&request, &responses).map_err(kbi_error)?;
        transport.respond_keyboard_interactive(responses).await
    }
}

/// Which method authenticated the session and what was tried on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub method: &'static str,
    pub tried: Vec<String>,
}

/// Run the authentication loop.
///
/// A failing method (`SshError::Auth`) counts as denied; any other error
/// aborts. Exhaustion yields `AuthFailed` with the methods actually tried.
pub async fn authenticate(
    transport: &mut dyn AuthTransport,
    user: &str,
    authenticators: &[Arc<dyn Authenticator>],
) -> Result<AuthOutcome, SshError> {
    let mut tried = Vec::new();
    let mut accepted = match transport.auth_none(user).await? {
        AuthState::Success => {
            info!("Server accepted 'none' authentication for {}", user);
            return Ok(AuthOutcome {
                method: "none",
                tried,
            });
        }
        AuthState::Denied { remaining } | AuthState::Partial { remaining } => remaining,
        AuthState::Continue(_) => {
            return Err(SshError::Protocol(
                "unexpected continuation for 'none' authentication".to_string(),
            ))
        }
    };
    if authenticators.iter().any(|a| a.method() == "none") {
        tried.push("none".to_string());
    }
    debug!("Server accepts methods: {:?}", accepted);

    let mut attempted = vec![false; authenticators.len()];
    'round: loop {
        for (index, authenticator) in authenticators.iter().enumerate() {
            let method = authenticator.method();
            if attempted[index] || method == "none" || !accepted.iter().any(|m| m == method) {
                continue;
            }
            attempted[index] = true;
            tried.push(method.to_string());
            debug!("Attempting authentication with method: {}", method);

            let mut state = method_result(method, authenticator.auth(transport, user).await)?;
            loop {
                match state {
                    AuthState::Success => {
                        info!("Authentication successful for {} via {}", user, method);
                        return Ok(AuthOutcome { method, tried });
                    }
                    AuthState::Partial { remaining } => {
                        info!(
                            "Partial success via {}, server still requires one of {:?}",
                            method, remaining
                        );
                        accepted = remaining;
                        continue 'round;
                    }
                    AuthState::Denied { remaining } => {
                        debug!("Method {} denied", method);
                        if !remaining.is_empty() {
                            accepted = remaining;
                        }
                        break;
                    }
                    AuthState::Continue(step) => {
                        state = method_result(method, authenticator.resume(transport, step).await)?;
                    }
                }
            }
        }
        break;
    }

    Err(SshError::AuthFailed { tried })
}

fn method_result(
    method: &str,
    result: Result<AuthState, SshError>,
) -> Result<AuthState, SshError> {
    match result {
        Err(e @ SshError::Auth { .. }) | Err(e @ SshError::Key(_)) => {
            warn!("Authentication method {} failed: {}", method, e);
            Ok(AuthState::Denied {
                remaining: Vec::new(),
            })
        }
        other => other,
    }
}

pub(crate) fn auth_state(result: AuthResult) -> AuthState {
    match result {
        AuthResult::Success => AuthState::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let remaining = remaining_methods
                .iter()
                .map(|m| {
                    let name: &'static str = m.into();
                    name.to_string()
                })
                .collect();
            if partial_success {
                AuthState::Partial { remaining }
            } else {
                AuthState::Denied { remaining }
            }
        }
    }
}

fn kbi_state(response: KeyboardInteractiveAuthResponse) -> AuthState {
    match response {
        KeyboardInteractiveAuthResponse::Success => AuthState::Success,
        KeyboardInteractiveAuthResponse::Failure { .. } => AuthState::Denied {
            remaining: Vec::new(),
        },
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => AuthState::Continue(AuthStep::Prompts(KbiRequest {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| KbiPrompt {
                    prompt: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        })),
    }
}

/// [`AuthTransport`] over a live russh handle.
pub(crate) struct HandleAuth<'a> {
    pub handle: &'a mut Handle<ClientHandler>,
    pub reactor: Reactor,
}

#[async_trait]
impl AuthTransport for HandleAuth<'_> {
    async fn auth_none(&mut self, user: &str) -> Result<AuthState, SshError> {
        Ok(auth_state(self.handle.authenticate_none(user).await?))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthState, SshError> {
        Ok(auth_state(
            self.handle.authenticate_password(user, password).await?,
        ))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        signer: &SharedSigner,
    ) -> Result<AuthState, SshError> {
        let Some(pair) = signer.key_pair() else {
            // no raw key: sign through a one-key in-process agent
            let agent = Arc::new(SshAgent::new());
            agent.load_key(signer.clone());
            let mut connection = AgentConnection::local(agent, &self.reactor);
            return connection.authenticate(self.handle, user).await;
        };

        if let Some(certificate) = signer.certificate() {
            debug!("Authenticating {} with OpenSSH certificate", user);
            let result = self
                .handle
                .authenticate_openssh_cert(user, pair.private_key().clone(), certificate.clone())
                .await?;
            return Ok(auth_state(result));
        }

        let hash_alg = if pair.key_type() == KeyType::Rsa {
            self.handle.best_supported_rsa_hash().await?.flatten()
        } else {
            None
        };
        let key = PrivateKeyWithHashAlg::new(pair.private_key().clone(), hash_alg);
        Ok(auth_state(self.handle.authenticate_publickey(user, key).await?))
    }

    async fn auth_agent(&mut self, user: &str, source: &AgentSource) -> Result<AuthState, SshError> {
        let mut connection = AgentConnection::open(source, &self.reactor).await?;
        connection.authenticate(self.handle, user).await
    }

    async fn auth_keyboard_interactive(&mut self, user: &str) -> Result<AuthState, SshError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        Ok(kbi_state(response))
    }

    async fn respond_keyboard_interactive(
        &mut self,
        responses: Vec<String>,
    ) -> Result<AuthState, SshError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_respond(responses)
            .await?;
        Ok(kbi_state(response))
    }
}
