//! SSH connection and authentication engine
//!
//! # Features
//! - Direct connections and tunnelling through an established session
//! - Authenticator chains: none, password, publickey, agent, keyboard-interactive
//! - Host key verification via callback and `~/.ssh/known_hosts`
//! - Keep-alive driven by the session reactor
//! - Remote port forward queues

mod agent;
mod auth;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod keyboard_interactive;
pub mod known_hosts;
mod session;

pub use agent::{AgentConnection, AgentSource};
pub use auth::{
    authenticate, AgentAuthenticator, AuthOutcome, AuthState, AuthStep, AuthTransport,
    Authenticator, KeyboardInteractiveAuthenticator, NoneAuthenticator, PasswordAuthenticator,
    PublicKeyAuthenticator,
};
pub use client::{dial, ClientHandler};
pub use config::{AuthMethod, ClientConfig, ClientConfigBuilder, ClientOptions};
pub use error::SshError;
pub use handle_owner::{HandleCommand, HandleController, ProbeResult};
pub use keyboard_interactive::{
    ChannelResponder, KbiError, KbiPrompt, KbiPromptEvent, KbiRequest, PasswordResponder,
    PromptResponder,
};
pub use known_hosts::{
    get_known_hosts, HostKeyCallback, HostKeyDecision, HostKeyPolicy, HostKeyStatus,
    HostKeyVerification, HostVerification, KnownHostsStore,
};
pub use session::{PtyRequest, Session};
