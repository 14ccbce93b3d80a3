//! Dialing: transport, handshake, host verification, authentication
//!
//! [`dial`] opens the transport (TCP, or a direct-tcpip tunnel through a
//! proxy session), runs the russh handshake under the connect timeout, lets
//! [`ClientHandler`] verify the host key, runs the authenticator chain and
//! finally hands the russh handle to its owner task.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::auth::{authenticate, HandleAuth};
use super::config::ClientConfig;
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{HostVerification, KnownHostsStore};
use super::session::{Session, SessionParts};
use crate::channel::{ChannelKind, ChannelRegistry, Stream};
use crate::reactor::Reactor;

/// Pending-stream queues of remote forwards, keyed by bound port.
pub(crate) type ForwardQueues = Arc<DashMap<u32, mpsc::Sender<Stream>>>;

/// Connect to `host` and authenticate.
pub async fn dial(host: &str, config: ClientConfig) -> Result<Session, SshError> {
    let options = &config.options;
    let reactor = config
        .reactor
        .clone()
        .or_else(Reactor::try_current)
        .ok_or_else(|| SshError::Operation("dial requires a tokio runtime".to_string()))?
        .with_retry_interval(options.retry_interval());
    let session_id = format!("{}@{}:{}", options.user, host, options.port);

    let forwards: ForwardQueues = Arc::new(DashMap::new());
    let channels = Arc::new(ChannelRegistry::new());
    let fingerprint = Arc::new(Mutex::new(None));
    let handler = ClientHandler {
        host: host.to_string(),
        port: options.port,
        verification: config.verification.clone(),
        forwards: forwards.clone(),
        channels: channels.clone(),
        reactor: reactor.clone(),
        server_fingerprint: fingerprint.clone(),
    };

    info!("Connecting to SSH server {}", session_id);
    let russh_config = Arc::new(options.russh_config());
    let connect = async {
        match &config.proxy {
            Some(proxy) => {
                debug!("Tunnelling {} through {}", session_id, proxy.id());
                let channel = proxy
                    .controller()
                    .open_direct_tcpip(host, options.port as u32, "127.0.0.1", 0)
                    .await
                    .map_err(|e| SshError::ConnectionFailed(format!("Proxy tunnel failed: {}", e)))?;
                handshake(russh_config, channel.into_stream(), handler).await
            }
            None => {
                let tcp = TcpStream::connect((host, options.port))
                    .await
                    .map_err(|e| SshError::ConnectionFailed(format!("{}: {}", session_id, e)))?;
                let _ = tcp.set_nodelay(true);
                handshake(russh_config, tcp, handler).await
            }
        }
    };
    let mut handle = reactor
        .timeout(options.connect_timeout(), connect)
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Connection to {} timed out after {}s",
                session_id, options.connect_timeout_secs
            ))
        })??;
    debug!("SSH handshake completed for {}", session_id);

    let outcome = {
        let mut transport = HandleAuth {
            handle: &mut handle,
            reactor: reactor.clone(),
        };
        authenticate(&mut transport, &options.user, &config.authenticators).await
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Authentication for {} failed: {}", session_id, e);
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(e);
        }
    };

    let controller = spawn_handle_owner_task(handle, session_id.clone(), &reactor);
    let server_fingerprint = fingerprint.lock().take();
    let session = Session::establish(SessionParts {
        id: session_id,
        host: host.to_string(),
        port: options.port,
        user: options.user.clone(),
        auth_method: outcome.method,
        server_fingerprint,
        controller,
        channels,
        forwards,
        reactor,
        proxy: config.proxy.clone(),
    });
    if let Some(interval) = options.keepalive_interval() {
        session.start_keepalive(
            interval,
            options.keepalive_timeout(),
            options.keepalive_max_misses.max(1),
        );
    }
    info!("Session {} established via {}", session.id(), outcome.method);
    Ok(session)
}

async fn handshake<S>(
    config: Arc<client::Config>,
    stream: S,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    client::connect_stream(config, stream, handler).await
}

/// russh callbacks for one connection
pub struct ClientHandler {
    host: String,
    port: u16,
    verification: Option<HostVerification>,
    forwards: ForwardQueues,
    channels: Arc<ChannelRegistry>,
    reactor: Reactor,
    server_fingerprint: Arc<Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        *self.server_fingerprint.lock() = Some(KnownHostsStore::fingerprint(server_public_key));
        match &self.verification {
            Some(verification) => {
                verification
                    .check(&self.host, self.port, server_public_key)
                    .await?;
                Ok(true)
            }
            None => {
                debug!(
                    "No host verification configured for {}:{}, accepting key",
                    self.host, self.port
                );
                Ok(true)
            }
        }
    }

    /// Someone connected to a remote-forwarded port.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let queue = self.forwards.get(&connected_port).map(|q| q.clone());
        let Some(queue) = queue else {
            warn!(
                "No forward registered for port {}, closing channel",
                connected_port
            );
            let _ = channel.close().await;
            return Ok(());
        };

        let stream = Stream::open(
            channel,
            ChannelKind::ForwardedTcpip {
                port: connected_port as u16,
            },
            &self.reactor,
            Some(self.channels.clone()),
        );
        if let Err(e) = queue.try_send(stream) {
            warn!(
                "Forward queue for port {} unavailable, dropping connection",
                connected_port
            );
            let stream = match e {
                mpsc::error::TrySendError::Full(s) | mpsc::error::TrySendError::Closed(s) => s,
            };
            stream.cancel();
        }
        Ok(())
    }
}
