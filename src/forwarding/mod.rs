//! Port forwarding
//!
//! - Local (`-L`): a local listener whose connections become direct-tcpip
//!   channels
//! - Remote (`-R`): the server listens and hands each connection back as a
//!   forwarded-tcpip stream, which is dialed to a local destination
//! - Dynamic (`-D`): a SOCKS5 gateway on a local listener
//!
//! Forwards talk to the session through [`ChannelFactory`] and stop on their
//! own when the session disconnects.

mod dynamic;
mod events;
mod listener;
mod local;
mod pipe;
mod remote;
pub mod socks5;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

pub use dynamic::{start_dynamic_forward, DynamicForward, DynamicForwardHandle};
pub use events::{ForwardEvent, ForwardEventEmitter};
pub use listener::is_transient;
pub use local::{start_local_forward, LocalForward, LocalForwardHandle};
pub use remote::{start_remote_forward, RemoteForward, RemoteForwardHandle};

use crate::channel::Stream;
use crate::reactor::Reactor;
use crate::ssh::{Session, SshError};

/// Default idle timeout for forwarded connections (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// What a forward needs from the SSH session.
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    fn session_id(&self) -> &str;

    /// Runs the forward's listener and connection tasks.
    fn reactor(&self) -> &Reactor;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<Stream, SshError>;

    /// Fires once the session is gone. `None` for factories that never
    /// disconnect.
    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        None
    }

    fn register_forward(&self, port: u16) -> Result<mpsc::Receiver<Stream>, SshError>;

    fn unregister_forward(&self, port: u16) -> bool;

    /// Ask the server to listen; returns the port it bound.
    async fn tcpip_forward(&self, address: &str, port: u16) -> Result<u16, SshError>;

    async fn cancel_tcpip_forward(&self, address: &str, port: u16) -> Result<(), SshError>;
}

#[async_trait]
impl ChannelFactory for Session {
    fn session_id(&self) -> &str {
        self.id()
    }

    fn reactor(&self) -> &Reactor {
        Session::reactor(self)
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<Stream, SshError> {
        Session::open_direct_tcpip(self, host, port, originator_host, originator_port).await
    }

    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        Some(Session::subscribe_disconnect(self))
    }

    fn register_forward(&self, port: u16) -> Result<mpsc::Receiver<Stream>, SshError> {
        Session::register_forward(self, port)
    }

    fn unregister_forward(&self, port: u16) -> bool {
        Session::unregister_forward(self, port)
    }

    async fn tcpip_forward(&self, address: &str, port: u16) -> Result<u16, SshError> {
        Session::tcpip_forward(self, address, port).await
    }

    async fn cancel_tcpip_forward(&self, address: &str, port: u16) -> Result<(), SshError> {
        Session::cancel_tcpip_forward(self, address, port).await
    }
}

/// Tunables shared by all forward kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardOptions {
    /// Close a forwarded connection after this long without traffic; 0 disables
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Listener rebinds attempted after a transient accept failure
    #[serde(default = "default_max_rebind_attempts")]
    pub max_rebind_attempts: u32,
    /// Delay before the first rebind, doubled on each further attempt
    #[serde(default = "default_rebind_backoff_ms")]
    pub rebind_backoff_ms: u64,
    /// How long `stop` waits for active connections to wind down
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_max_rebind_attempts() -> u32 {
    5
}

fn default_rebind_backoff_ms() -> u64 {
    200
}

fn default_stop_timeout_secs() -> u64 {
    5
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_rebind_attempts: default_max_rebind_attempts(),
            rebind_backoff_ms: default_rebind_backoff_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl ForwardOptions {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn rebind_backoff(&self) -> Duration {
        Duration::from_millis(self.rebind_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Starting,
    Active,
    Stopped,
    /// The session went away; the forward can be recreated on a new one
    Suspended,
    Error,
}

/// Snapshot of a forward's traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Connections accepted since start
    pub connection_count: u64,
    pub active_connections: u64,
    /// Bytes sent toward the SSH channel
    pub bytes_sent: u64,
    /// Bytes received from the SSH channel
    pub bytes_received: u64,
}

/// Lock-free counters behind [`ForwardStats`].
#[derive(Debug, Default)]
pub struct StatsCounter {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounter {
    pub fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Count a new connection; it stays active until the guard drops.
    pub(crate) fn open_connection(self: &Arc<Self>) -> ActiveConnection {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            stats: self.clone(),
        }
    }
}

pub(crate) struct ActiveConnection {
    stats: Arc<StatsCounter>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Wait until no connection is active or `limit` passes.
pub(crate) async fn wait_idle(stats: &StatsCounter, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while stats.active() > 0 {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options: ForwardOptions = serde_json::from_str(r#"{"idleTimeoutSecs": 0}"#).unwrap();
        assert_eq!(options.idle_timeout(), None);
        assert_eq!(options.max_rebind_attempts, 5);
        assert_eq!(options.stop_timeout(), Duration::from_secs(5));
        assert_eq!(
            ForwardOptions::default().idle_timeout(),
            Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS))
        );
    }

    #[test]
    fn test_active_connection_guard() {
        let stats = Arc::new(StatsCounter::default());
        let first = stats.open_connection();
        let second = stats.open_connection();
        stats.add_sent(10);
        assert_eq!(stats.active(), 2);
        drop(first);
        drop(second);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connection_count, 2);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.bytes_sent, 10);
    }
}
