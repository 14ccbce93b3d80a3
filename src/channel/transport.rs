//! Protocol channel seam
//!
//! The stream pump only talks to a [`ChannelTransport`]. Production code uses
//! the `russh` channel; [`MemoryChannel`] is an in-process pair for loopback
//! use and tests.

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::trace;

use super::StreamError;

/// Default maximum payload per data packet.
pub const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

/// Inbound event on a protocol channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    /// Extended data; `ext == 1` is stderr.
    ExtendedData { ext: u32, data: Bytes },
    Eof,
    Close,
    ExitStatus(u32),
    ExitSignal(String),
    /// Peer reports the absolute send window.
    WindowAdjusted(u32),
    /// Peer grants additional send window.
    WindowGranted(u32),
}

#[async_trait]
pub trait ChannelTransport: Send + 'static {
    /// Next inbound event; `None` once the channel is gone.
    async fn recv(&mut self) -> Option<ChannelEvent>;

    async fn send(&mut self, data: &[u8]) -> Result<(), StreamError>;

    async fn send_eof(&mut self) -> Result<(), StreamError>;

    async fn close(&mut self) -> Result<(), StreamError>;

    /// Send window known at open time, if any.
    fn initial_window(&self) -> Option<u32> {
        None
    }

    fn max_packet(&self) -> u32 {
        DEFAULT_MAX_PACKET
    }
}

#[async_trait]
impl ChannelTransport for Channel<Msg> {
    async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            let msg = self.wait().await?;
            let event = match msg {
                ChannelMsg::Data { data } => ChannelEvent::Data(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext } => ChannelEvent::ExtendedData {
                    ext,
                    data: Bytes::copy_from_slice(&data),
                },
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Close,
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    ChannelEvent::ExitSignal(format!("{:?}", signal_name))
                }
                ChannelMsg::WindowAdjusted { new_size } => ChannelEvent::WindowAdjusted(new_size),
                other => {
                    trace!("Ignoring channel message {:?}", other);
                    continue;
                }
            };
            return Some(event);
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.data(data).await.map_err(StreamError::from)
    }

    async fn send_eof(&mut self) -> Result<(), StreamError> {
        self.eof().await.map_err(StreamError::from)
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        Channel::close(self).await.map_err(StreamError::from)
    }
}

/// One end of an in-memory channel pair.
///
/// Data sent on one end arrives as [`ChannelEvent::Data`] on the other. With
/// a window, the receiving end grants credit back as it consumes data.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    window: Option<u32>,
    max_packet: u32,
    closed: bool,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        Self::build(None, DEFAULT_MAX_PACKET)
    }

    /// A pair where each side may only have `window` bytes unacknowledged.
    pub fn pair_with_window(window: u32, max_packet: u32) -> (MemoryChannel, MemoryChannel) {
        Self::build(Some(window), max_packet)
    }

    fn build(window: Option<u32>, max_packet: u32) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = MemoryChannel {
            tx: a_tx,
            rx: a_rx,
            window,
            max_packet,
            closed: false,
        };
        let b = MemoryChannel {
            tx: b_tx,
            rx: b_rx,
            window,
            max_packet,
            closed: false,
        };
        (a, b)
    }

    /// Inject an arbitrary event toward the peer (exit status, stderr...).
    pub fn send_event(&mut self, event: ChannelEvent) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.tx.send(event).map_err(|_| StreamError::Closed)
    }
}

#[async_trait]
impl ChannelTransport for MemoryChannel {
    async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.rx.recv().await?;
        if let (Some(_), ChannelEvent::Data(data)) = (self.window, &event) {
            // consumed: hand the credit back
            let _ = self.tx.send(ChannelEvent::WindowGranted(data.len() as u32));
        }
        Some(event)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if data.is_empty() {
            return Ok(());
        }
        self.send_event(ChannelEvent::Data(Bytes::copy_from_slice(data)))
    }

    async fn send_eof(&mut self) -> Result<(), StreamError> {
        self.send_event(ChannelEvent::Eof)
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        let result = self.send_event(ChannelEvent::Close);
        self.closed = true;
        result
    }

    fn initial_window(&self) -> Option<u32> {
        self.window
    }

    fn max_packet(&self) -> u32 {
        self.max_packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_in_order() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send(b"one").await.unwrap();
        a.send_eof().await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"one"))));
        assert_eq!(b.recv().await, Some(ChannelEvent::Eof));
        assert_eq!(b.recv().await, Some(ChannelEvent::Close));
        assert!(a.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_windowed_pair_grants_on_consume() {
        let (mut a, mut b) = MemoryChannel::pair_with_window(4, 4);
        assert_eq!(a.initial_window(), Some(4));
        a.send(b"abcd").await.unwrap();
        b.recv().await.unwrap();
        assert_eq!(a.recv().await, Some(ChannelEvent::WindowGranted(4)));
    }
}
