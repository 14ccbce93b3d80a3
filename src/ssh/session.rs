//! Live SSH session
//!
//! A [`Session`] is a cheap clone over shared state: the owner task
//! controller, the registry of open channels and the remote-forward queues.
//! Every [`Stream`] opened here keeps the session alive; the connection is
//! closed once the last clone, the last stream and the keep-alive timer are
//! gone, or on [`Session::disconnect`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ForwardQueues;
use super::error::SshError;
use super::handle_owner::{HandleController, ProbeResult};
use crate::channel::{ChannelEntry, ChannelKind, ChannelRegistry, Stream};
use crate::reactor::Reactor;
use crate::sftp::{SftpOptions, SftpTranslator};
use crate::translator::TranslatorError;

/// Pending connections buffered per remote forward
const FORWARD_QUEUE: usize = 32;

/// Pseudo-terminal request for [`Session::shell`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

pub(crate) struct SessionParts {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth_method: &'static str,
    pub server_fingerprint: Option<String>,
    pub controller: HandleController,
    pub channels: Arc<ChannelRegistry>,
    pub forwards: ForwardQueues,
    pub reactor: Reactor,
    pub proxy: Option<Session>,
}

struct SessionInner {
    parts: SessionParts,
    keepalive: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        debug!("Releasing session {}", self.parts.id);
        self.keepalive.cancel();
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.parts.id)
            .field("auth_method", &self.inner.parts.auth_method)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn establish(parts: SessionParts) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                parts,
                keepalive: CancellationToken::new(),
            }),
        }
    }

    /// `user@host:port`
    pub fn id(&self) -> &str {
        &self.inner.parts.id
    }

    pub fn host(&self) -> &str {
        &self.inner.parts.host
    }

    pub fn port(&self) -> u16 {
        self.inner.parts.port
    }

    pub fn user(&self) -> &str {
        &self.inner.parts.user
    }

    /// Method that completed authentication
    pub fn auth_method(&self) -> &'static str {
        self.inner.parts.auth_method
    }

    /// SHA256 fingerprint of the server host key
    pub fn server_fingerprint(&self) -> Option<&str> {
        self.inner.parts.server_fingerprint.as_deref()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.parts.reactor
    }

    pub fn is_connected(&self) -> bool {
        self.inner.parts.controller.is_connected()
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.inner.parts.controller.subscribe_disconnect()
    }

    pub(crate) fn controller(&self) -> &HandleController {
        &self.inner.parts.controller
    }

    /// Channels currently open on this session
    pub fn open_channels(&self) -> Vec<(u64, ChannelEntry)> {
        self.inner.parts.channels.list()
    }

    fn wrap(&self, channel: Channel<Msg>, kind: ChannelKind) -> Stream {
        Stream::open(
            channel,
            kind,
            &self.inner.parts.reactor,
            Some(self.inner.parts.channels.clone()),
        )
        .with_owner(self.inner.clone())
    }

    /// Interactive shell, with a pseudo-terminal when `pty` is set.
    pub async fn shell(&self, pty: Option<PtyRequest>) -> Result<Stream, SshError> {
        let channel = self.controller().open_session_channel().await?;
        if let Some(pty) = pty {
            channel
                .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
                .await?;
        }
        channel.request_shell(true).await?;
        debug!("Shell opened on {}", self.id());
        Ok(self.wrap(channel, ChannelKind::Shell))
    }

    pub async fn exec(&self, command: &str) -> Result<Stream, SshError> {
        let channel = self.controller().open_session_channel().await?;
        channel.exec(true, command).await?;
        debug!("Exec '{}' on {}", command, self.id());
        Ok(self.wrap(
            channel,
            ChannelKind::Exec {
                command: command.to_string(),
            },
        ))
    }

    /// Start subsystem `name`; fails if the server rejects it.
    pub async fn subsystem(&self, name: &str) -> Result<Stream, SshError> {
        let mut channel = self.controller().open_session_channel().await?;
        channel.request_subsystem(true, name).await?;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => {
                    let _ = channel.close().await;
                    return Err(SshError::Channel(format!(
                        "Subsystem '{}' rejected by server",
                        name
                    )));
                }
                Some(ChannelMsg::Close) | None => {
                    return Err(SshError::Channel(format!(
                        "Channel closed while starting subsystem '{}'",
                        name
                    )));
                }
                Some(_) => continue,
            }
        }
        debug!("Subsystem {} started on {}", name, self.id());
        Ok(self.wrap(
            channel,
            ChannelKind::Subsystem {
                name: name.to_string(),
            },
        ))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<Stream, SshError> {
        let channel = self
            .controller()
            .open_direct_tcpip(host, port as u32, originator_host, originator_port as u32)
            .await?;
        Ok(self.wrap(
            channel,
            ChannelKind::DirectTcpip {
                host: host.to_string(),
                port,
            },
        ))
    }

    pub async fn sftp(&self, options: SftpOptions) -> Result<SftpTranslator, TranslatorError> {
        SftpTranslator::open(self, options).await
    }

    /// Create the pending-stream queue for remote forward `port`.
    pub fn register_forward(&self, port: u16) -> Result<mpsc::Receiver<Stream>, SshError> {
        use dashmap::mapref::entry::Entry;
        match self.inner.parts.forwards.entry(port as u32) {
            Entry::Occupied(_) => Err(SshError::AlreadyExists(format!(
                "remote forward on port {}",
                port
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(FORWARD_QUEUE);
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    pub fn unregister_forward(&self, port: u16) -> bool {
        self.inner.parts.forwards.remove(&(port as u32)).is_some()
    }

    /// `tcpip-forward`; returns the bound port.
    pub async fn tcpip_forward(&self, address: &str, port: u16) -> Result<u16, SshError> {
        let bound = self
            .controller()
            .tcpip_forward(address, port as u32)
            .await?;
        // servers answer 0 when the requested port was kept
        Ok(if bound == 0 { port } else { bound as u16 })
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u16) -> Result<(), SshError> {
        self.controller()
            .cancel_tcpip_forward(address, port as u32)
            .await
    }

    pub(crate) fn start_keepalive(&self, interval: Duration, probe_timeout: Duration, max_misses: u32) {
        let controller = self.inner.parts.controller.clone();
        let id = self.inner.parts.id.clone();
        let misses = Arc::new(AtomicU32::new(0));
        debug!(
            "Keep-alive for {} every {}s (max {} misses)",
            id,
            interval.as_secs(),
            max_misses
        );
        self.inner
            .parts
            .reactor
            .every(interval, self.inner.keepalive.clone(), move || {
                let controller = controller.clone();
                let misses = misses.clone();
                let id = id.clone();
                async move {
                    match controller.probe(probe_timeout).await {
                        ProbeResult::Ok => {
                            misses.store(0, Ordering::Relaxed);
                            true
                        }
                        ProbeResult::Timeout => {
                            let missed = misses.fetch_add(1, Ordering::Relaxed) + 1;
                            if missed >= max_misses {
                                warn!(
                                    "Session {} missed {} keep-alives, disconnecting",
                                    id, missed
                                );
                                controller.disconnect().await;
                                false
                            } else {
                                true
                            }
                        }
                        ProbeResult::Io => {
                            warn!("Keep-alive send failed for {}, stopping timer", id);
                            false
                        }
                    }
                }
            });
    }

    /// Close the connection; open streams see their channel end.
    pub async fn disconnect(&self) {
        info!("Disconnecting session {}", self.id());
        self.inner.keepalive.cancel();
        self.inner.parts.controller.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::handle_owner::HandleCommand;
    use dashmap::DashMap;

    fn offline_session(cmd_tx: mpsc::Sender<HandleCommand>) -> Session {
        Session::establish(SessionParts {
            id: "alice@example:22".to_string(),
            host: "example".to_string(),
            port: 22,
            user: "alice".to_string(),
            auth_method: "none",
            server_fingerprint: None,
            controller: HandleController::new(cmd_tx),
            channels: Arc::new(ChannelRegistry::new()),
            forwards: Arc::new(DashMap::new()),
            reactor: Reactor::try_current().unwrap(),
            proxy: None,
        })
    }

    #[tokio::test]
    async fn test_duplicate_forward_registration() {
        let (tx, _rx) = mpsc::channel(4);
        let session = offline_session(tx);
        let _queue = session.register_forward(8080).unwrap();
        assert!(matches!(
            session.register_forward(8080),
            Err(SshError::AlreadyExists(_))
        ));
        assert!(session.unregister_forward(8080));
        assert!(session.register_forward(8080).is_ok());
    }

    #[tokio::test]
    async fn test_keepalive_stops_on_io_failure() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = offline_session(tx);
        session.start_keepalive(Duration::from_millis(5), Duration::from_secs(1), 3);

        match rx.recv().await {
            Some(HandleCommand::Probe { reply_tx, .. }) => {
                let _ = reply_tx.send(ProbeResult::Io);
            }
            _ => panic!("expected keep-alive probe"),
        }
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err(), "timer must stop after an IO failure");
    }

    #[tokio::test]
    async fn test_keepalive_disconnects_after_misses() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = offline_session(tx);
        session.start_keepalive(Duration::from_millis(5), Duration::from_secs(1), 2);

        for _ in 0..2 {
            match rx.recv().await {
                Some(HandleCommand::Probe { reply_tx, .. }) => {
                    let _ = reply_tx.send(ProbeResult::Timeout);
                }
                _ => panic!("expected keep-alive probe"),
            }
        }
        assert!(matches!(rx.recv().await, Some(HandleCommand::Disconnect)));
    }
}
