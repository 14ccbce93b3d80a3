//! In-process [`ChannelFactory`] whose direct-tcpip channels echo.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::ChannelFactory;
use crate::channel::{ChannelEvent, ChannelKind, ChannelTransport, MemoryChannel, Stream};
use crate::reactor::Reactor;
use crate::ssh::SshError;

/// Port the fake server binds when asked for port 0.
pub const ALLOCATED_PORT: u16 = 40_000;

/// Echo everything back; answer EOF with EOF and close.
pub async fn echo(mut end: MemoryChannel) {
    while let Some(event) = end.recv().await {
        match event {
            ChannelEvent::Data(data) => {
                if end.send(&data).await.is_err() {
                    break;
                }
            }
            ChannelEvent::Eof => {
                let _ = end.send_eof().await;
                let _ = end.close().await;
                break;
            }
            ChannelEvent::Close => break,
            _ => {}
        }
    }
}

pub struct LoopbackFactory {
    reactor: Reactor,
    forwards: DashMap<u16, mpsc::Sender<Stream>>,
    disconnect: broadcast::Sender<()>,
    refuse: AtomicBool,
    pub opened: Mutex<Vec<(String, u16)>>,
    /// Name of the thread each direct-tcpip open ran on
    pub opened_on: Mutex<Vec<Option<String>>>,
    pub remote_requests: Mutex<Vec<(String, u16)>>,
    pub cancelled: Mutex<Vec<(String, u16)>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::with_reactor(Reactor::try_current().expect("inside a tokio runtime"))
    }

    pub fn with_reactor(reactor: Reactor) -> Self {
        let (disconnect, _) = broadcast::channel(1);
        Self {
            reactor,
            forwards: DashMap::new(),
            disconnect,
            refuse: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
            opened_on: Mutex::new(Vec::new()),
            remote_requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Make every further direct-tcpip open fail.
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        let _ = self.disconnect.send(());
    }

    pub fn is_registered(&self, port: u16) -> bool {
        self.forwards.contains_key(&port)
    }

    /// Play the server: deliver an inbound connection for `port` and return
    /// the remote end of its channel.
    pub async fn deliver(&self, port: u16) -> MemoryChannel {
        let (local, remote) = MemoryChannel::pair();
        let stream = Stream::open(local, ChannelKind::ForwardedTcpip { port }, &self.reactor, None);
        let queue = self
            .forwards
            .get(&port)
            .map(|q| q.value().clone())
            .expect("forward registered");
        queue.send(stream).await.expect("forward queue open");
        remote
    }
}

#[async_trait]
impl ChannelFactory for LoopbackFactory {
    fn session_id(&self) -> &str {
        "test@loopback:22"
    }

    fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        _originator_host: &str,
        _originator_port: u16,
    ) -> Result<Stream, SshError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SshError::Channel(format!("open {}:{} refused", host, port)));
        }
        self.opened.lock().push((host.to_string(), port));
        self.opened_on
            .lock()
            .push(std::thread::current().name().map(str::to_string));
        let (local, remote) = MemoryChannel::pair();
        self.reactor.spawn(echo(remote));
        Ok(Stream::open(
            local,
            ChannelKind::DirectTcpip {
                host: host.to_string(),
                port,
            },
            &self.reactor,
            None,
        ))
    }

    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.disconnect.subscribe())
    }

    fn register_forward(&self, port: u16) -> Result<mpsc::Receiver<Stream>, SshError> {
        use dashmap::mapref::entry::Entry;
        match self.forwards.entry(port) {
            Entry::Occupied(_) => Err(SshError::AlreadyExists(format!("remote forward on port {}", port))),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(8);
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    fn unregister_forward(&self, port: u16) -> bool {
        self.forwards.remove(&port).is_some()
    }

    async fn tcpip_forward(&self, address: &str, port: u16) -> Result<u16, SshError> {
        self.remote_requests.lock().push((address.to_string(), port));
        Ok(if port == 0 { ALLOCATED_PORT } else { port })
    }

    async fn cancel_tcpip_forward(&self, address: &str, port: u16) -> Result<(), SshError> {
        self.cancelled.lock().push((address.to_string(), port));
        Ok(())
    }
}
