//! Accept loop shared by local and dynamic forwards

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{wait_idle, ForwardEventEmitter, ForwardOptions, ForwardStats, ForwardStatus, StatsCounter};
use crate::reactor::Reactor;
use crate::ssh::SshError;

/// Services one accepted connection.
pub(crate) type ConnectionHandler =
    Arc<dyn Fn(TcpStream, SocketAddr, Arc<StatsCounter>) -> BoxFuture<'static, Result<(), SshError>> + Send + Sync>;

/// Accept failures that go away once the listener is recreated.
pub fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | TimedOut | WouldBlock | OutOfMemory
    ) {
        return true;
    }
    // ENFILE / EMFILE: descriptors free up as connections close
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

pub(crate) async fn bind(addr: &str) -> Result<TcpListener, SshError> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => SshError::ConnectionFailed(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        io::ErrorKind::AddrNotAvailable => SshError::ConnectionFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)),
    })
}

/// Control side of a running listener.
pub(crate) struct ListenerHandle {
    pub id: String,
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    stats: Arc<StatsCounter>,
    options: ForwardOptions,
}

impl ListenerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.snapshot()
    }

    /// Stop accepting, cancel live connections and wait for them to end.
    pub async fn stop(&self) {
        info!("Stopping forward {} on {}", self.id, self.bound_addr);
        self.shutdown.cancel();
        if !wait_idle(&self.stats, self.options.stop_timeout()).await {
            warn!(
                "Forward {}: {} connections still active after {}s",
                self.id,
                self.stats.active(),
                self.options.stop_timeout_secs
            );
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

enum ExitReason {
    Stopped,
    Disconnected,
    Error(String),
}

enum Accepted {
    Stop,
    Disconnected,
    Connection(io::Result<(TcpStream, SocketAddr)>),
}

pub(crate) struct ListenerSpec {
    pub id: String,
    /// Label for logs, e.g. `local` or `socks5`
    pub kind: &'static str,
    pub options: ForwardOptions,
    pub events: Option<ForwardEventEmitter>,
    pub disconnect: Option<broadcast::Receiver<()>>,
    pub reactor: Reactor,
}

/// Run `handler` for every connection on `listener` until stopped, the
/// session disconnects, or accepting fails for good.
pub(crate) fn spawn_listener(
    listener: TcpListener,
    spec: ListenerSpec,
    handler: ConnectionHandler,
) -> Result<ListenerHandle, SshError> {
    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?;
    let running = Arc::new(AtomicBool::new(true));
    let shutdown = CancellationToken::new();
    let stats = Arc::new(StatsCounter::default());

    let handle = ListenerHandle {
        id: spec.id.clone(),
        bound_addr,
        running: running.clone(),
        shutdown: shutdown.clone(),
        stats: stats.clone(),
        options: spec.options.clone(),
    };

    let ListenerSpec {
        id,
        kind,
        options,
        events,
        mut disconnect,
        reactor,
    } = spec;
    if let Some(emitter) = &events {
        emitter.emit_status_changed(&id, ForwardStatus::Active, None);
    }
    info!("{} forward {} listening on {}", kind, id, bound_addr);

    let connections = reactor.clone();
    reactor.spawn(async move {
        let mut listener = listener;
        let exit = loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => Accepted::Stop,
                _ = disconnected(&mut disconnect) => Accepted::Disconnected,
                result = listener.accept() => Accepted::Connection(result),
            };
            match accepted {
                Accepted::Stop => break ExitReason::Stopped,
                Accepted::Disconnected => break ExitReason::Disconnected,
                Accepted::Connection(Ok((socket, peer))) => {
                    debug!("{} forward {} accepted {}", kind, id, peer);
                    let guard = stats.open_connection();
                    let work = handler(socket, peer, stats.clone());
                    let token = shutdown.clone();
                    let conn_id = id.clone();
                    let conn_stats = stats.clone();
                    let conn_events = events.clone();
                    connections.spawn(async move {
                        tokio::select! {
                            result = work => {
                                if let Err(e) = result {
                                    warn!("Forward {} connection from {} failed: {}", conn_id, peer, e);
                                }
                            }
                            _ = token.cancelled() => {
                                debug!("Forward {} connection from {} cancelled", conn_id, peer);
                            }
                        }
                        drop(guard);
                        if let Some(emitter) = conn_events {
                            emitter.emit_stats_updated(&conn_id, conn_stats.snapshot());
                        }
                    });
                }
                Accepted::Connection(Err(e)) if is_transient(&e) => {
                    warn!("{} forward {} accept failed ({}), restarting listener", kind, id, e);
                    drop(listener);
                    match rebind(bound_addr, &options, &shutdown).await {
                        Some(fresh) => listener = fresh,
                        None => {
                            break ExitReason::Error(format!(
                                "listener on {} could not be restarted: {}",
                                bound_addr, e
                            ))
                        }
                    }
                }
                Accepted::Connection(Err(e)) => {
                    break ExitReason::Error(format!("accept on {} failed: {}", bound_addr, e));
                }
            }
        };

        // connections die with the forward
        shutdown.cancel();
        match exit {
            ExitReason::Stopped => {
                info!("{} forward {} stopped", kind, id);
                if let Some(emitter) = &events {
                    emitter.emit_status_changed(&id, ForwardStatus::Stopped, None);
                }
            }
            ExitReason::Disconnected => {
                info!("{} forward {} suspended: SSH connection lost", kind, id);
                if let Some(emitter) = &events {
                    emitter.emit_status_changed(&id, ForwardStatus::Suspended, Some("SSH connection lost".into()));
                }
            }
            ExitReason::Error(message) => {
                error!("{} forward {} failed: {}", kind, id, message);
                if let Some(emitter) = &events {
                    emitter.emit_status_changed(&id, ForwardStatus::Error, Some(message));
                }
            }
        }
        running.store(false, Ordering::SeqCst);
    });

    Ok(handle)
}

/// Completes when the session reports a disconnect; never without a receiver.
pub(crate) async fn disconnected(rx: &mut Option<broadcast::Receiver<()>>) {
    match rx {
        // lagged or closed both mean the session is gone
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn rebind(addr: SocketAddr, options: &ForwardOptions, shutdown: &CancellationToken) -> Option<TcpListener> {
    let mut delay = options.rebind_backoff();
    for attempt in 1..=options.max_rebind_attempts {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return None,
        }
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("Listener on {} restarted after {} attempt(s)", addr, attempt);
                return Some(listener);
            }
            Err(e) => warn!("Rebind {}/{} on {} failed: {}", attempt, options.max_rebind_attempts, addr, e),
        }
        delay *= 2;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test]
    async fn test_bind_reports_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        match bind(&addr).await {
            Err(SshError::ConnectionFailed(message)) => assert!(message.contains("already in use")),
            other => panic!("unexpected {:?}", other.map(|l| l.local_addr())),
        }
    }

    #[tokio::test]
    async fn test_rebind_gives_up_when_stopped() {
        let token = CancellationToken::new();
        token.cancel();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(rebind(addr, &ForwardOptions::default(), &token).await.is_none());
    }
}
