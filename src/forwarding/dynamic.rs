//! Dynamic Port Forwarding (SOCKS5 proxy)
//!
//! A local SOCKS5 server; every `CONNECT` becomes a direct-tcpip channel to
//! the requested target. Equivalent to `ssh -D 1080`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::listener::{bind, spawn_listener, ConnectionHandler, ListenerHandle, ListenerSpec};
use super::pipe::pipe;
use super::socks5::{accept_handshake, read_request, write_reply, ReplyCode};
use super::{ChannelFactory, ForwardEventEmitter, ForwardOptions, ForwardStats, StatsCounter};
use crate::ssh::SshError;

/// Dynamic forward configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicForward {
    /// Local address for the SOCKS5 server (e.g., "127.0.0.1:1080")
    pub local_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DynamicForward {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Handle to a running SOCKS5 proxy
pub struct DynamicForwardHandle {
    pub config: DynamicForward,
    listener: ListenerHandle,
}

impl DynamicForwardHandle {
    pub fn id(&self) -> &str {
        &self.listener.id
    }

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

pub async fn start_dynamic_forward(
    factory: Arc<dyn ChannelFactory>,
    config: DynamicForward,
    options: ForwardOptions,
    events: Option<ForwardEventEmitter>,
) -> Result<DynamicForwardHandle, SshError> {
    let listener = bind(&config.local_addr).await?;
    let idle_timeout = options.idle_timeout();
    let spec = ListenerSpec {
        id: uuid::Uuid::new_v4().to_string(),
        kind: "socks5",
        disconnect: factory.subscribe_disconnect(),
        reactor: factory.reactor().clone(),
        options,
        events,
    };

    let handler: ConnectionHandler =
        Arc::new(move |mut socket: TcpStream, peer: SocketAddr, stats: Arc<StatsCounter>| {
            let factory = factory.clone();
            async move {
                accept_handshake(&mut socket)
                    .await
                    .map_err(|e| SshError::Protocol(e.to_string()))?;
                let request = read_request(&mut socket)
                    .await
                    .map_err(|e| SshError::Protocol(e.to_string()))?;
                let host = request.address.host();
                debug!("SOCKS5 {} CONNECT {}:{}", peer, host, request.port);

                let stream = match factory
                    .open_direct_tcpip(&host, request.port, &peer.ip().to_string(), peer.port())
                    .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("SOCKS5 connect to {}:{} failed: {}", host, request.port, e);
                        let _ = write_reply(&mut socket, ReplyCode::GeneralFailure).await;
                        return Err(e);
                    }
                };
                write_reply(&mut socket, ReplyCode::Succeeded)
                    .await
                    .map_err(|e| SshError::Protocol(e.to_string()))?;
                pipe(stream, socket, stats, idle_timeout)
                    .await
                    .map_err(|e| SshError::Channel(e.to_string()))
            }
            .boxed()
        });

    let listener = spawn_listener(listener, spec, handler)?;
    Ok(DynamicForwardHandle { config, listener })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::socks5::{Socks5Reply, Socks5Request, TargetAddr};
    use crate::forwarding::testing::LoopbackFactory;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn socks_connect(addr: SocketAddr, target: &str, port: u16) -> (TcpStream, Socks5Reply) {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let request = Socks5Request::connect(TargetAddr::Domain(target.into()), port);
        client.write_all(&request.encode().unwrap()).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        let (reply, _) = Socks5Reply::parse(&reply).unwrap();
        (client, reply)
    }

    #[tokio::test]
    async fn test_socks_connect_pipes_to_channel() {
        let factory = Arc::new(LoopbackFactory::new());
        let handle = start_dynamic_forward(
            factory.clone(),
            DynamicForward::new("127.0.0.1:0"),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();

        let (mut client, reply) = socks_connect(handle.bound_addr(), "example.org", 443).await;
        assert_eq!(reply, Socks5Reply::new(ReplyCode::Succeeded));

        client.write_all(b"through the proxy").await.unwrap();
        let mut back = [0u8; 17];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"through the proxy");
        assert_eq!(factory.opened.lock().clone(), vec![("example.org".to_string(), 443)]);

        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_failed_open_sends_general_failure() {
        let factory = Arc::new(LoopbackFactory::new());
        factory.refuse();
        let handle = start_dynamic_forward(
            factory.clone(),
            DynamicForward::new("127.0.0.1:0"),
            ForwardOptions::default(),
            None,
        )
        .await
        .unwrap();

        let (mut client, reply) = socks_connect(handle.bound_addr(), "internal.example", 22).await;
        assert_eq!(reply.code, ReplyCode::GeneralFailure);
        let mut rest = [0u8; 1];
        assert_eq!(client.read(&mut rest).await.unwrap(), 0);
        handle.stop().await;
    }
}
