//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host through the SSH
//! session. Example: `-L 8080:localhost:80` makes `localhost:8080` reach the
//! server-side `localhost:80`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use super::listener::{bind, spawn_listener, ConnectionHandler, ListenerHandle, ListenerSpec};
use super::pipe::pipe;
use super::{ChannelFactory, ForwardEventEmitter, ForwardOptions, ForwardStats, StatsCounter};
use crate::ssh::SshError;

/// Local port forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalForward {
    /// Local address to bind (e.g., "127.0.0.1:8080")
    pub local_addr: String,
    /// Remote host to connect to (from the SSH server's perspective)
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LocalForward {
    pub fn new(local_addr: impl Into<String>, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
            description: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    pub config: LocalForward,
    listener: ListenerHandle,
}

impl LocalForwardHandle {
    pub fn id(&self) -> &str {
        &self.listener.id
    }

    /// Actual bound address (useful when binding port 0)
    pub fn bound_addr(&self) -> SocketAddr {
        self.listener.bound_addr
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    pub fn stats(&self) -> ForwardStats {
        self.listener.stats()
    }

    pub async fn stop(&self) {
        self.listener.stop().await
    }
}

/// Start local port forwarding.
///
/// The forward ends by itself when the session reports a disconnect.
pub async fn start_local_forward(
    factory: Arc<dyn ChannelFactory>,
    config: LocalForward,
    options: ForwardOptions,
    events: Option<ForwardEventEmitter>,
) -> Result<LocalForwardHandle, SshError> {
    let listener = bind(&config.local_addr).await?;
    let id = uuid::Uuid::new_v4().to_string();

    let target_host = config.remote_host.clone();
    let target_port = config.remote_port;
    let idle_timeout = options.idle_timeout();
    let spec = ListenerSpec {
        id,
        kind: "local",
        disconnect: factory.subscribe_disconnect(),
        reactor: factory.reactor().clone(),
        options,
        events,
    };

    let handler: ConnectionHandler = Arc::new(move |socket: TcpStream, peer: SocketAddr, stats: Arc<StatsCounter>| {
        let factory = factory.clone();
        let host = target_host.clone();
        async move {
            let stream = factory
                .open_direct_tcpip(&host, target_port, &peer.ip().to_string(), peer.port())
                .await?;
            debug!("Forwarding {} -> {}:{}", peer, host, target_port);
            pipe(stream, socket, stats, idle_timeout)
                .await
                .map_err(|e| SshError::Channel(e.to_string()))
        }
        .boxed()
    });

    let listener = spawn_listener(listener, spec, handler)?;
    Ok(LocalForwardHandle { config, listener })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::testing::LoopbackFactory;
    use crate::forwarding::{ForwardEvent, ForwardStatus};
    use crate::reactor::Reactor;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_connections_run_on_factory_reactor() {
        let session_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("session-reactor")
            .enable_all()
            .build()
            .unwrap();
        let caller_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let reactor = Reactor::from_handle(session_runtime.handle().clone());

        let threads = caller_runtime.block_on(async move {
            let factory = Arc::new(LoopbackFactory::with_reactor(reactor));
            let handle = start_local_forward(
                factory.clone(),
                LocalForward::new("127.0.0.1:0", "cache.internal", 6379),
                ForwardOptions::default(),
                None,
            )
            .await
            .unwrap();
            let mut client = TcpStream::connect(handle.bound_addr()).await.unwrap();
            client.write_all(b"PING").await.unwrap();
            let mut back = [0u8; 4];
            client.read_exact(&mut back).await.unwrap();
            assert_eq!(&back, b"PING");
            drop(client);
            handle.stop().await;
            let threads = factory.opened_on.lock().clone();
            threads
        });
        assert_eq!(threads, vec![Some("session-reactor".to_string())]);
    }

    #[tokio::test]
    async fn test_local_forward_echoes_bytes() {
        let factory = Arc::new(LoopbackFactory::new());
        let handle = start_local_forward(
            factory.clone(),
            LocalForward::new("127.0.0.1:0", "db.internal", 5432),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert!(handle.is_running());

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let client = TcpStream::connect(handle.bound_addr()).await.unwrap();
        let (mut reader, mut writer) = client.into_split();
        let sent = payload.clone();
        let writing = tokio::spawn(async move {
            writer.write_all(&sent).await.unwrap();
            writer.shutdown().await.unwrap();
        });
        let mut back = Vec::new();
        reader.read_to_end(&mut back).await.unwrap();
        writing.await.unwrap();
        assert_eq!(back, payload);

        assert_eq!(factory.opened.lock().clone(), vec![("db.internal".to_string(), 5432)]);
        until(|| handle.stats().active_connections == 0).await;
        let stats = handle.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.bytes_sent, payload.len() as u64);
        assert_eq!(stats.bytes_received, payload.len() as u64);

        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_refused_channel_closes_connection() {
        let factory = Arc::new(LoopbackFactory::new());
        factory.refuse();
        let handle = start_local_forward(
            factory.clone(),
            LocalForward::new("127.0.0.1:0", "nowhere", 1),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(handle.bound_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        // one refused connection does not end the forward
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_session_disconnect_suspends_forward() {
        let factory = Arc::new(LoopbackFactory::new());
        let emitter = ForwardEventEmitter::new("test@loopback:22");
        let mut events = emitter.subscribe().unwrap();
        let handle = start_local_forward(
            factory.clone(),
            LocalForward::new("127.0.0.1:0", "web", 80),
            ForwardOptions::default(),
            Some(emitter),
        )
        .await
        .unwrap();

        factory.disconnect();
        until(|| !handle.is_running()).await;

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ForwardEvent::StatusChanged { forward_id, status, .. } = event {
                assert_eq!(forward_id, handle.id());
                statuses.push(status);
            }
        }
        assert_eq!(statuses, vec![ForwardStatus::Active, ForwardStatus::Suspended]);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let factory = Arc::new(LoopbackFactory::new());
        let first = start_local_forward(
            factory.clone(),
            LocalForward::new("127.0.0.1:0", "web", 80),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();
        let second = start_local_forward(
            factory,
            LocalForward::new(first.bound_addr().to_string(), "web", 80),
            ForwardOptions::default(),
            None,
        )
        .await;
        assert!(matches!(second, Err(SshError::ConnectionFailed(_))));
        first.stop().await;
    }
}
