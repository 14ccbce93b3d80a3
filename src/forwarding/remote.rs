//! Remote Port Forwarding
//!
//! The SSH server listens on a port and hands every inbound connection back
//! as a forwarded-tcpip stream; each one is dialed to a local destination.
//! Example: `-R 9000:localhost:3000` exposes the local port 3000 as the
//! server's port 9000.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::disconnected;
use super::pipe::pipe;
use super::{wait_idle, ChannelFactory, ForwardEventEmitter, ForwardOptions, ForwardStats, ForwardStatus, StatsCounter};
use crate::channel::Stream;
use crate::ssh::SshError;

/// Remote port forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteForward {
    /// Address the server binds (e.g., "0.0.0.0" or "localhost")
    pub remote_addr: String,
    /// Port the server binds; 0 lets the server choose
    pub remote_port: u16,
    /// Local host to connect inbound connections to
    pub local_host: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RemoteForward {
    pub fn new(
        remote_addr: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            remote_port,
            local_host: local_host.into(),
            local_port,
            description: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Handle to a running remote port forward
pub struct RemoteForwardHandle {
    pub config: RemoteForward,
    id: String,
    bound_port: u16,
    factory: Arc<dyn ChannelFactory>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    stats: Arc<StatsCounter>,
    options: ForwardOptions,
}

impl RemoteForwardHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Port the server actually listens on
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.snapshot()
    }

    /// Cancel the server-side listener, unregister the port and wind down
    /// active connections.
    pub async fn stop(&self) {
        info!(
            "Stopping remote forward {} ({}:{})",
            self.id, self.config.remote_addr, self.bound_port
        );
        self.shutdown.cancel();
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = self
                .factory
                .cancel_tcpip_forward(&self.config.remote_addr, self.bound_port)
                .await
            {
                warn!("Failed to cancel remote forward {}: {}", self.id, e);
            }
            self.factory.unregister_forward(self.bound_port);
        }
        if !wait_idle(&self.stats, self.options.stop_timeout()).await {
            warn!(
                "Remote forward {}: {} connections still active after {}s",
                self.id,
                self.stats.active(),
                self.options.stop_timeout_secs
            );
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Request the server-side listener and start servicing its connections.
///
/// A port that is already forwarded fails with `AlreadyExists` before
/// anything is sent to the server.
pub async fn start_remote_forward(
    factory: Arc<dyn ChannelFactory>,
    config: RemoteForward,
    options: ForwardOptions,
    events: Option<ForwardEventEmitter>,
) -> Result<RemoteForwardHandle, SshError> {
    let requested = config.remote_port;
    // register first so no delivery can race the reply
    let early = if requested != 0 {
        Some(factory.register_forward(requested)?)
    } else {
        None
    };

    let bound_port = match factory.tcpip_forward(&config.remote_addr, requested).await {
        Ok(port) => port,
        Err(e) => {
            if early.is_some() {
                factory.unregister_forward(requested);
            }
            return Err(e);
        }
    };

    let queue = match early {
        Some(queue) if bound_port == requested => Ok(queue),
        other => {
            if other.is_some() {
                factory.unregister_forward(requested);
            }
            factory.register_forward(bound_port)
        }
    };
    let queue = match queue {
        Ok(queue) => queue,
        Err(e) => {
            let _ = factory.cancel_tcpip_forward(&config.remote_addr, bound_port).await;
            return Err(e);
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    info!(
        "Remote forward {}: {}:{} -> {}:{}",
        id, config.remote_addr, bound_port, config.local_host, config.local_port
    );

    let handle = RemoteForwardHandle {
        config: config.clone(),
        id: id.clone(),
        bound_port,
        factory: factory.clone(),
        shutdown: CancellationToken::new(),
        running: Arc::new(AtomicBool::new(true)),
        released: Arc::new(AtomicBool::new(false)),
        stats: Arc::new(StatsCounter::default()),
        options: options.clone(),
    };
    if let Some(emitter) = &events {
        emitter.emit_status_changed(&id, ForwardStatus::Active, None);
    }

    let task = RemoteTask {
        id,
        config,
        bound_port,
        factory,
        options,
        events,
        shutdown: handle.shutdown.clone(),
        running: handle.running.clone(),
        released: handle.released.clone(),
        stats: handle.stats.clone(),
    };
    let reactor = task.factory.reactor().clone();
    reactor.spawn(task.run(queue));

    Ok(handle)
}

struct RemoteTask {
    id: String,
    config: RemoteForward,
    bound_port: u16,
    factory: Arc<dyn ChannelFactory>,
    options: ForwardOptions,
    events: Option<ForwardEventEmitter>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    stats: Arc<StatsCounter>,
}

impl RemoteTask {
    async fn run(self, mut queue: mpsc::Receiver<Stream>) {
        let mut disconnect = self.factory.subscribe_disconnect();
        let suspended = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break false,
                _ = disconnected(&mut disconnect) => break true,
                next = queue.recv() => match next {
                    Some(stream) => self.service(stream),
                    // the session dropped the queue
                    None => break true,
                },
            }
        };

        self.shutdown.cancel();
        if suspended {
            info!("Remote forward {} suspended: SSH connection lost", self.id);
            // the server side is gone with the session
            if !self.released.swap(true, Ordering::SeqCst) {
                self.factory.unregister_forward(self.bound_port);
            }
        }
        if let Some(emitter) = &self.events {
            let status = if suspended {
                ForwardStatus::Suspended
            } else {
                ForwardStatus::Stopped
            };
            let reason = suspended.then(|| "SSH connection lost".to_string());
            emitter.emit_status_changed(&self.id, status, reason);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn service(&self, stream: Stream) {
        let guard = self.stats.open_connection();
        let host = self.config.local_host.clone();
        let port = self.config.local_port;
        let id = self.id.clone();
        let stats = self.stats.clone();
        let events = self.events.clone();
        let token = self.shutdown.clone();
        let idle_timeout = self.options.idle_timeout();

        self.factory.reactor().spawn(async move {
            let work = async {
                let socket = match TcpStream::connect((host.as_str(), port)).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("Remote forward {}: cannot reach {}:{}: {}", id, host, port, e);
                        stream.cancel();
                        return;
                    }
                };
                debug!("Remote forward {}: connected to {}:{}", id, host, port);
                if let Err(e) = pipe(stream, socket, stats.clone(), idle_timeout).await {
                    debug!("Remote forward {} connection ended: {}", id, e);
                }
            };
            tokio::select! {
                _ = work => {}
                _ = token.cancelled() => debug!("Remote forward {} connection cancelled", id),
            }
            drop(guard);
            if let Some(emitter) = events {
                emitter.emit_stats_updated(&id, stats.snapshot());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelEvent, ChannelTransport};
    use crate::forwarding::testing::{LoopbackFactory, ALLOCATED_PORT};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn local_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_inbound_connection_reaches_local_service() {
        let local_port = local_echo_server().await;
        let factory = Arc::new(LoopbackFactory::new());
        let handle = start_remote_forward(
            factory.clone(),
            RemoteForward::new("0.0.0.0", 9000, "127.0.0.1", local_port),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(handle.bound_port(), 9000);
        assert!(factory.is_registered(9000));

        let mut remote = factory.deliver(9000).await;
        remote.send(b"ping over -R").await.unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < 12 {
            match tokio::time::timeout(Duration::from_secs(5), remote.recv()).await.unwrap() {
                Some(ChannelEvent::Data(data)) => echoed.extend_from_slice(&data),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(echoed, b"ping over -R");

        handle.stop().await;
        assert!(!handle.is_running());
        assert!(!factory.is_registered(9000));
        assert_eq!(factory.cancelled.lock().clone(), vec![("0.0.0.0".to_string(), 9000)]);
    }

    #[tokio::test]
    async fn test_duplicate_port_is_rejected() {
        let factory = Arc::new(LoopbackFactory::new());
        let first = start_remote_forward(
            factory.clone(),
            RemoteForward::new("localhost", 9100, "127.0.0.1", 1),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();
        let second = start_remote_forward(
            factory.clone(),
            RemoteForward::new("localhost", 9100, "127.0.0.1", 2),
            ForwardOptions::default(),
            None,
        )
        .await;
        assert!(matches!(second, Err(SshError::AlreadyExists(_))));
        // nothing was asked of the server for the duplicate
        assert_eq!(factory.remote_requests.lock().len(), 1);
        first.stop().await;
    }

    #[tokio::test]
    async fn test_server_allocated_port_is_registered() {
        let factory = Arc::new(LoopbackFactory::new());
        let handle = start_remote_forward(
            factory.clone(),
            RemoteForward::new("localhost", 0, "127.0.0.1", 1),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(handle.bound_port(), ALLOCATED_PORT);
        assert!(factory.is_registered(ALLOCATED_PORT));
        assert!(!factory.is_registered(0));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_destination_cancels_stream() {
        // reserve a port, then free it so nothing listens there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let factory = Arc::new(LoopbackFactory::new());
        let handle = start_remote_forward(
            factory.clone(),
            RemoteForward::new("localhost", 9200, "127.0.0.1", port),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();

        let mut remote = factory.deliver(9200).await;
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match remote.recv().await {
                    Some(ChannelEvent::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(handle.is_running());
        handle.stop().await;
    }
}
