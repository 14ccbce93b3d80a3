//! Socket <-> channel bridging with traffic accounting

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use super::StatsCounter;
use crate::channel::{Stream, StreamError};

#[derive(Clone, Copy)]
enum Direction {
    /// socket -> channel
    Sent,
    /// channel -> socket
    Received,
}

/// Counts bytes through `inner` and stamps the last activity.
struct Counted<T> {
    inner: T,
    direction: Direction,
    stats: Arc<StatsCounter>,
    activity: Arc<Mutex<Instant>>,
}

impl<T> Counted<T> {
    fn new(inner: T, direction: Direction, stats: Arc<StatsCounter>, activity: Arc<Mutex<Instant>>) -> Self {
        Self {
            inner,
            direction,
            stats,
            activity,
        }
    }

    fn record(&self, n: usize) {
        match self.direction {
            Direction::Sent => self.stats.add_sent(n as u64),
            Direction::Received => self.stats.add_received(n as u64),
        }
        *self.activity.lock() = Instant::now();
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Counted<T> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.record(n);
            }
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Counted<T> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.record(*n);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Pipe `socket` and `stream` until either side ends or the connection sits
/// idle for `idle_timeout`. The channel is released when this returns.
pub(crate) async fn pipe(
    stream: Stream,
    socket: TcpStream,
    stats: Arc<StatsCounter>,
    idle_timeout: Option<Duration>,
) -> Result<(), StreamError> {
    let _ = socket.set_nodelay(true);
    let activity = Arc::new(Mutex::new(Instant::now()));
    let (read_half, write_half) = socket.into_split();
    let input = Counted::new(read_half, Direction::Sent, stats.clone(), activity.clone());
    let output = Counted::new(write_half, Direction::Received, stats, activity.clone());
    let id = stream.id();
    let bridge = stream.connect(output, Some(input), None::<tokio::io::Sink>);

    match idle_timeout {
        None => bridge.await,
        Some(limit) => {
            tokio::select! {
                result = bridge => result,
                _ = idle(activity, limit) => {
                    debug!("Stream {} idle for {}s, closing", id, limit.as_secs());
                    Ok(())
                }
            }
        }
    }
}

/// Resolves once `activity` is older than `limit`.
async fn idle(activity: Arc<Mutex<Instant>>, limit: Duration) {
    loop {
        let elapsed = activity.lock().elapsed();
        if elapsed >= limit {
            return;
        }
        tokio::time::sleep(limit - elapsed).await;
    }
}
