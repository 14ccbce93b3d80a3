//! Channel stream and its pump task

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::flow::FlowWindow;
use super::registry::{ChannelKind, ChannelRegistry};
use super::transport::{ChannelEvent, ChannelTransport};
use super::StreamError;
use crate::reactor::Reactor;

const COMMAND_QUEUE: usize = 32;
const DELIVERY_QUEUE: usize = 32;
const CONNECT_BUFFER: usize = 32 * 1024;
/// Undelivered events a parked write may pull off the transport while it
/// waits for window credit
const PARKED_BACKLOG: usize = DELIVERY_QUEUE;

/// How much inbound data the consumer is willing to take.
///
/// `Bounded(n)` counts data pushes and drops back to `None` once spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    None,
    Bounded(usize),
    Unlimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(u32),
    Signal(String),
}

#[derive(Debug)]
struct DemandGate {
    demand: Mutex<Demand>,
    notify: Notify,
}

impl DemandGate {
    fn new() -> Self {
        Self {
            demand: Mutex::new(Demand::None),
            notify: Notify::new(),
        }
    }

    fn set(&self, demand: Demand) {
        *self.demand.lock() = demand;
        self.notify.notify_one();
    }

    fn get(&self) -> Demand {
        *self.demand.lock()
    }

    fn has_demand(&self) -> bool {
        !matches!(self.get(), Demand::None | Demand::Bounded(0))
    }

    /// Spend one unit for a data push.
    fn take(&self) -> bool {
        let mut demand = self.demand.lock();
        match *demand {
            Demand::None | Demand::Bounded(0) => false,
            Demand::Bounded(1) => {
                *demand = Demand::None;
                true
            }
            Demand::Bounded(n) => {
                *demand = Demand::Bounded(n - 1);
                true
            }
            Demand::Unlimited => true,
        }
    }
}

enum StreamCommand {
    Write {
        data: Bytes,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Eof {
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Close,
}

#[derive(Debug)]
enum Delivery {
    Stdout(Bytes),
    Stderr(Bytes),
    Eof,
    Closed,
    Failed(StreamError),
}

/// Cloneable write side of a [`Stream`].
#[derive(Clone)]
pub struct StreamWriter {
    cmd_tx: mpsc::Sender<StreamCommand>,
}

impl StreamWriter {
    /// Resolves once every byte was handed to the channel.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), StreamError> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCommand::Write {
                data: data.into(),
                reply,
            })
            .await
            .map_err(|_| StreamError::Closed)?;
        reply_rx.await.map_err(|_| StreamError::Closed)?
    }

    pub async fn send_eof(&self) -> Result<(), StreamError> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCommand::Eof { reply })
            .await
            .map_err(|_| StreamError::Closed)?;
        reply_rx.await.map_err(|_| StreamError::Closed)?
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(StreamCommand::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// One multiplexed channel.
pub struct Stream {
    id: u64,
    kind: ChannelKind,
    writer: StreamWriter,
    events: mpsc::Receiver<Delivery>,
    gate: Arc<DemandGate>,
    exit: watch::Receiver<Option<ExitStatus>>,
    cancel: CancellationToken,
    released: Arc<AtomicBool>,
    stderr: BytesMut,
    finished: bool,
    reactor: Reactor,
    _owner: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

enum Step {
    Data(Bytes),
    Continue,
    End,
}

impl Stream {
    /// Start the pump for `transport` on `reactor`.
    ///
    /// With a registry, the channel is registered now and released when the
    /// pump tears down.
    pub fn open<T: ChannelTransport>(
        transport: T,
        kind: ChannelKind,
        reactor: &Reactor,
        registry: Option<Arc<ChannelRegistry>>,
    ) -> Stream {
        let id = registry
            .as_ref()
            .map(|r| r.register(kind.clone()))
            .unwrap_or(0);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events) = mpsc::channel(DELIVERY_QUEUE);
        let (exit_tx, exit) = watch::channel(None);
        let gate = Arc::new(DemandGate::new());
        let cancel = CancellationToken::new();
        let released = Arc::new(AtomicBool::new(false));
        let flow = FlowWindow::new(transport.initial_window(), transport.max_packet());

        let pump = Pump {
            id,
            kind: kind.clone(),
            transport,
            registry,
            cmd_rx,
            events_tx,
            gate: gate.clone(),
            cancel: cancel.clone(),
            released: released.clone(),
            exit_tx,
            flow,
            backlog: VecDeque::new(),
            write: None,
            retry_interval: reactor.retry_interval(),
            remote_closed: false,
            receiver_gone: false,
        };
        reactor.spawn(pump.run());

        Stream {
            id,
            kind,
            writer: StreamWriter { cmd_tx },
            events,
            gate,
            exit,
            cancel,
            released,
            stderr: BytesMut::new(),
            finished: false,
            reactor: reactor.clone(),
            _owner: None,
        }
    }

    /// A stream outside of any session registry.
    pub fn loopback<T: ChannelTransport>(transport: T, reactor: &Reactor) -> Stream {
        Self::open(transport, ChannelKind::Loopback, reactor, None)
    }

    /// Keep `owner` alive for as long as this stream exists.
    pub fn with_owner(mut self, owner: Arc<dyn Any + Send + Sync>) -> Self {
        self._owner = Some(owner);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn demand(&self) -> Demand {
        self.gate.get()
    }

    pub fn set_demand(&self, demand: Demand) {
        self.gate.set(demand);
    }

    pub fn writer(&self) -> StreamWriter {
        self.writer.clone()
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), StreamError> {
        self.writer.write(data).await
    }

    pub async fn send_eof(&self) -> Result<(), StreamError> {
        self.writer.send_eof().await
    }

    /// Stop the pump; the channel is freed by the pump task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn close(&self) {
        self.writer.close().await;
    }

    /// `true` once the underlying channel has been freed.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.borrow().clone()
    }

    /// Stderr collected by `read`/`try_read` so far.
    pub fn take_stderr(&mut self) -> Bytes {
        self.stderr.split().freeze()
    }

    /// Next stdout chunk; `None` at end of stream.
    ///
    /// Wakes only when the pump delivers something.
    pub async fn read(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            self.ensure_demand();
            let delivery = self.events.recv().await;
            match self.accept(delivery)? {
                Step::Data(data) => return Ok(Some(data)),
                Step::Continue => continue,
                Step::End => return Ok(None),
            }
        }
    }

    /// Non-blocking read; `Err(WouldBlock)` when nothing is buffered.
    pub fn try_read(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            self.ensure_demand();
            let delivery = match self.events.try_recv() {
                Ok(delivery) => Some(delivery),
                Err(mpsc::error::TryRecvError::Empty) => return Err(StreamError::WouldBlock),
                Err(mpsc::error::TryRecvError::Disconnected) => None,
            };
            match self.accept(delivery)? {
                Step::Data(data) => return Ok(Some(data)),
                Step::Continue => continue,
                Step::End => return Ok(None),
            }
        }
    }

    /// Poll-driven read for bulk transfers: re-enters [`Stream::try_read`]
    /// every reactor retry interval until it stops reporting would-block.
    pub async fn read_polled(&mut self) -> Result<Option<Bytes>, StreamError> {
        let reactor = self.reactor.clone();
        reactor
            .retry(|| match self.try_read() {
                Err(StreamError::WouldBlock) => Poll::Pending,
                other => Poll::Ready(other),
            })
            .await
    }

    /// Drain the rest of the stream and return the exit status, if any.
    pub async fn finish(&mut self) -> Result<Option<ExitStatus>, StreamError> {
        self.set_demand(Demand::Unlimited);
        while self.read().await?.is_some() {}
        // exit-status may trail EOF until close
        let mut exit = self.exit.clone();
        if exit.borrow().is_none() && !self.is_released() {
            let _ = tokio::time::timeout(Duration::from_millis(500), exit.changed()).await;
        }
        Ok(self.exit_status())
    }

    fn ensure_demand(&self) {
        if !self.gate.has_demand() {
            self.gate.set(Demand::Bounded(1));
        }
    }

    fn accept(&mut self, delivery: Option<Delivery>) -> Result<Step, StreamError> {
        match delivery {
            Some(Delivery::Stdout(data)) => Ok(Step::Data(data)),
            Some(Delivery::Stderr(data)) => {
                self.stderr.extend_from_slice(&data);
                Ok(Step::Continue)
            }
            Some(Delivery::Eof) | Some(Delivery::Closed) | None => {
                self.finished = true;
                Ok(Step::End)
            }
            Some(Delivery::Failed(err)) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    /// Wire the channel to external sinks and sources.
    ///
    /// `stdin` EOF sends a protocol EOF; the end of the output flow closes the
    /// channel. The first failure cancels the other flows and is returned.
    pub async fn connect<O, I, E>(
        mut self,
        mut stdout: O,
        stdin: Option<I>,
        mut stderr: Option<E>,
    ) -> Result<(), StreamError>
    where
        O: AsyncWrite + Unpin + Send,
        I: AsyncRead + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        self.set_demand(Demand::Unlimited);
        let writer = self.writer.clone();
        let cancel = self.cancel.clone();
        let events = &mut self.events;

        let input = async move {
            if let Some(mut stdin) = stdin {
                let mut buf = vec![0u8; CONNECT_BUFFER];
                loop {
                    let n = stdin.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    writer.write(Bytes::copy_from_slice(&buf[..n])).await?;
                }
                match writer.send_eof().await {
                    Ok(()) | Err(StreamError::Closed) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok::<(), StreamError>(())
        };

        let output = async move {
            loop {
                match events.recv().await {
                    Some(Delivery::Stdout(data)) => stdout.write_all(&data).await?,
                    Some(Delivery::Stderr(data)) => {
                        if let Some(err_sink) = stderr.as_mut() {
                            err_sink.write_all(&data).await?;
                        }
                    }
                    Some(Delivery::Eof) | Some(Delivery::Closed) | None => break,
                    Some(Delivery::Failed(e)) => return Err(e),
                }
            }
            stdout.flush().await?;
            let _ = stdout.shutdown().await;
            Ok::<(), StreamError>(())
        };

        tokio::pin!(input);
        tokio::pin!(output);
        let mut input_done = false;
        let result = loop {
            tokio::select! {
                r = &mut input, if !input_done => match r {
                    Ok(()) => input_done = true,
                    Err(e) => break Err(e),
                },
                r = &mut output => break r,
                _ = cancel.cancelled() => break Err(StreamError::Cancelled),
            }
        };

        if let Err(e) = &result {
            debug!("Stream {} ({}) connect failed: {}", self.id, self.kind, e);
        }
        self.finished = true;
        self.writer.close().await;
        result
    }

    /// Expose the channel as an in-process byte pipe.
    pub fn into_duplex(self, buffer: usize) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(buffer);
        let reactor = self.reactor.clone();
        reactor.spawn(async move {
            let id = self.id;
            let (read_half, write_half) = tokio::io::split(remote);
            if let Err(e) = self
                .connect(write_half, Some(read_half), None::<tokio::io::Sink>)
                .await
            {
                debug!("Duplex bridge for stream {} ended: {}", id, e);
            }
        });
        local
    }
}

struct PendingWrite {
    data: Bytes,
    offset: usize,
    reply: oneshot::Sender<Result<(), StreamError>>,
}

struct Pump<T: ChannelTransport> {
    id: u64,
    kind: ChannelKind,
    transport: T,
    registry: Option<Arc<ChannelRegistry>>,
    cmd_rx: mpsc::Receiver<StreamCommand>,
    events_tx: mpsc::Sender<Delivery>,
    gate: Arc<DemandGate>,
    cancel: CancellationToken,
    released: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    flow: FlowWindow,
    backlog: VecDeque<Delivery>,
    write: Option<PendingWrite>,
    retry_interval: Duration,
    remote_closed: bool,
    receiver_gone: bool,
}

impl<T: ChannelTransport> Pump<T> {
    async fn run(mut self) {
        trace!("Stream {} ({}) pump started", self.id, self.kind);
        let outcome = self.drive().await;
        self.teardown(outcome).await;
    }

    async fn drive(&mut self) -> Result<(), StreamError> {
        loop {
            self.flush_backlog().await;
            if self.remote_closed && self.backlog.is_empty() {
                return Ok(());
            }

            self.progress_write().await?;
            let parked = self.write.is_some();
            // window credit only arrives as an event, so a parked write keeps
            // reading, up to a bounded backlog
            let want_events = self.receiver_gone
                || (parked && self.backlog.len() < PARKED_BACKLOG)
                || (self.backlog.is_empty() && self.gate.has_demand());

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                cmd = self.cmd_rx.recv(), if !parked => match cmd {
                    Some(StreamCommand::Write { data, reply }) => {
                        self.write = Some(PendingWrite { data, offset: 0, reply });
                    }
                    Some(StreamCommand::Eof { reply }) => {
                        let result = self.transport.send_eof().await;
                        let _ = reply.send(result);
                    }
                    Some(StreamCommand::Close) | None => return Ok(()),
                },
                event = self.transport.recv(), if want_events && !self.remote_closed => {
                    self.on_event(event);
                }
                _ = self.gate.notify.notified() => {}
                _ = tokio::time::sleep(self.retry_interval), if parked => {
                    trace!("Stream {} write parked on empty window", self.id);
                }
            }
        }
    }

    fn on_event(&mut self, event: Option<ChannelEvent>) {
        match event {
            Some(ChannelEvent::Data(data)) => {
                if !data.is_empty() && !self.receiver_gone {
                    self.backlog.push_back(Delivery::Stdout(data));
                }
            }
            Some(ChannelEvent::ExtendedData { data, .. }) => {
                if !data.is_empty() && !self.receiver_gone {
                    self.backlog.push_back(Delivery::Stderr(data));
                }
            }
            Some(ChannelEvent::Eof) => self.backlog.push_back(Delivery::Eof),
            Some(ChannelEvent::ExitStatus(code)) => {
                self.exit_tx.send_replace(Some(ExitStatus::Code(code)));
            }
            Some(ChannelEvent::ExitSignal(signal)) => {
                self.exit_tx.send_replace(Some(ExitStatus::Signal(signal)));
            }
            Some(ChannelEvent::WindowAdjusted(size)) => self.flow.adjust(size),
            Some(ChannelEvent::WindowGranted(n)) => self.flow.grant(n),
            Some(ChannelEvent::Close) | None => {
                debug!("Stream {} ({}) closed by peer", self.id, self.kind);
                self.remote_closed = true;
                self.backlog.push_back(Delivery::Closed);
                if let Some(pending) = self.write.take() {
                    let _ = pending.reply.send(Err(StreamError::Closed));
                }
            }
        }
    }

    async fn flush_backlog(&mut self) {
        while let Some(front) = self.backlog.front() {
            let deliverable = match front {
                Delivery::Stdout(_) | Delivery::Stderr(_) => self.gate.take(),
                _ => true,
            };
            if !deliverable {
                break;
            }
            let Some(item) = self.backlog.pop_front() else {
                break;
            };
            if self.events_tx.send(item).await.is_err() {
                self.receiver_gone = true;
                self.backlog.clear();
                break;
            }
        }
    }

    /// Push the pending write as far as the window allows.
    async fn progress_write(&mut self) -> Result<(), StreamError> {
        loop {
            let Some(pending) = self.write.as_mut() else {
                return Ok(());
            };
            let remaining = pending.data.len() - pending.offset;
            if remaining == 0 {
                if let Some(done) = self.write.take() {
                    let _ = done.reply.send(Ok(()));
                }
                return Ok(());
            }
            let n = self.flow.chunk_len(remaining);
            if n == 0 {
                return Ok(());
            }
            let chunk = pending.data.slice(pending.offset..pending.offset + n);
            if let Err(e) = self.transport.send(&chunk).await {
                warn!("Stream {} ({}) write failed: {}", self.id, self.kind, e);
                if let Some(failed) = self.write.take() {
                    let _ = failed.reply.send(Err(e.clone()));
                }
                return Err(e);
            }
            self.flow.consume(n);
            pending.offset += n;
        }
    }

    async fn teardown(mut self, outcome: Result<(), StreamError>) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = outcome.as_ref().err().cloned().unwrap_or(StreamError::Closed);
        if let Some(pending) = self.write.take() {
            let _ = pending.reply.send(Err(reason.clone()));
        }
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                StreamCommand::Write { reply, .. } | StreamCommand::Eof { reply } => {
                    let _ = reply.send(Err(reason.clone()));
                }
                StreamCommand::Close => {}
            }
        }
        self.cmd_rx.close();

        if let Err(e) = outcome {
            if !self.receiver_gone {
                let _ = self.events_tx.try_send(Delivery::Failed(e));
            }
        }

        if let Err(e) = self.transport.close().await {
            trace!("Stream {} close after teardown: {}", self.id, e);
        }
        if let Some(registry) = &self.registry {
            registry.release(self.id);
        }
        debug!(
            "Stream {} ({}) released, {} bytes sent",
            self.id,
            self.kind,
            self.flow.sent()
        );
    }
}
