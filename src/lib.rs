//! OxideTerm SSH engine
//!
//! Connection establishment and authenticator chains, multiplexed channel
//! streams, SFTP and SCP copy services, local/reverse/SOCKS5 port forwarding
//! and an in-process ssh-agent, built on russh.

pub mod agent;
pub mod channel;
pub mod forwarding;
pub mod keys;
pub mod reactor;
pub mod scp;
pub mod sftp;
pub mod ssh;
pub mod translator;
pub mod wire;

pub use channel::{Demand, Stream, StreamError};
pub use reactor::Reactor;
pub use ssh::{dial, ClientConfig, ClientOptions, Session, SshError};
pub use translator::{FileAttributes, FileType, Translator, TranslatorError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the default `tracing` subscriber (`RUST_LOG`, falling back to `info`).
///
/// Panics if a global subscriber is already set; use [`try_init_logging`] in
/// code that may run more than once.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_logging`] but reports an already-installed subscriber as an error.
pub fn try_init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
