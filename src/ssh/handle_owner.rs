//! Session owner task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a [`HandleController`], which sends [`HandleCommand`]s over an mpsc
//! channel and awaits the reply on a oneshot. Protocol calls are therefore
//! serialized without holding a lock across `.await`.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "alice@host:22".into(), &reactor);
//! let channel = controller.open_session_channel().await?;
//! let bound_port = controller.tcpip_forward("0.0.0.0", 8080).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use crate::reactor::Reactor;

const COMMAND_QUEUE: usize = 64;

/// How often the owner task checks whether the transport went away
const CLOSED_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one keep-alive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Ok,
    /// No reply in time; may be network latency
    Timeout,
    /// Transport is gone
    Io,
}

/// Commands sent to the session owner task
pub enum HandleCommand {
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Remote forward (`tcpip-forward`)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// `keepalive@openssh.com` with want-reply
    Probe {
        timeout: Duration,
        reply_tx: oneshot::Sender<ProbeResult>,
    },

    Disconnect,
}

/// Cloneable sender side of the owner task.
///
/// Any holder has full control over the connection: it can open channels,
/// create forwards or disconnect.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a raw command channel (tests drive the other end).
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Fires once when the owner task exits.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn request<T>(
        &self,
        command: HandleCommand,
        reply_rx: oneshot::Receiver<Result<T, russh::Error>>,
    ) -> Result<T, SshError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| match e {
                russh::Error::Disconnect => SshError::Disconnected,
                other => SshError::Channel(other.to_string()),
            })
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(HandleCommand::ChannelOpenSession { reply_tx }, reply_rx)
            .await
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Returns the bound port (differs from `port` when it was 0).
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    pub async fn probe(&self, timeout: Duration) -> ProbeResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Probe { timeout, reply_tx })
            .await
            .is_err()
        {
            return ProbeResult::Io;
        }
        reply_rx.await.unwrap_or(ProbeResult::Io)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task on `reactor`.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
    reactor: &Reactor,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(COMMAND_QUEUE);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let notify = disconnect_tx.clone();

    reactor.spawn(async move {
        let mut handle = handle;
        let mut closed_check = tokio::time::interval(CLOSED_CHECK_INTERVAL);
        info!("Session owner task started for {}", session_id);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = closed_check.tick() => {
                    if handle.is_closed() {
                        warn!("Transport of session {} closed by peer", session_id);
                        break;
                    }
                    continue;
                }
            };
            let Some(cmd) = cmd else { break };
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // the dropped channel is closed by russh
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    let bound = result.as_ref().ok().copied();
                    if reply_tx.send(result).is_err() {
                        if let Some(bound_port) = bound {
                            warn!(
                                "Caller dropped after tcpip_forward succeeded. \
                                 Cancelling orphaned forward {}:{}",
                                address, bound_port
                            );
                            let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Probe { timeout, reply_tx } => {
                    debug!("Keepalive probe for session {}", session_id);
                    let result = match tokio::time::timeout(timeout, handle.send_keepalive(true)).await {
                        Ok(Ok(())) => ProbeResult::Ok,
                        Ok(Err(russh::Error::Disconnect)) | Ok(Err(russh::Error::IO(_))) => {
                            warn!("Keepalive transport failure for session {}", session_id);
                            ProbeResult::Io
                        }
                        Ok(Err(e)) => {
                            warn!(
                                "Keepalive error for session {} (soft failure): {}",
                                session_id, e
                            );
                            ProbeResult::Timeout
                        }
                        Err(_) => {
                            warn!(
                                "Keepalive timeout for session {} ({}s)",
                                session_id,
                                timeout.as_secs()
                            );
                            ProbeResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
            }
        }

        let _ = notify.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Session owner task terminated for {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Fail every queued command with `Disconnect`.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Probe { reply_tx, .. } => {
                let _ = reply_tx.send(ProbeResult::Io);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
