//! russh channel adapter
//!
//! A `russh::Channel` is driven by awaiting it, so every channel gets its own
//! owner task, the same arrangement the handle uses. The poll loop side is a
//! [`RusshChannel`]: writes become queued ops, inbound data is drained from a
//! queue into per-stream buffers, and requests resolve through a [`Pending`]
//! once the server answers `Success`/`Failure`.
//!
//! Both directions are held to [`QUEUE_HIGH_WATER`] bytes. Outbound, the
//! adapter stops reporting itself writable until the owner task has handed
//! queued data to russh. Inbound, the owner task stops reading the channel
//! until the poll loop consumes what is buffered, so a slow reader holds
//! back the SSH window instead of growing memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace};

use super::error::SshError;
use super::transport::{ChannelIo, ChannelRequest, Pending, StreamId};

/// Bytes queued in either direction before the producer is held back
const QUEUE_HIGH_WATER: usize = 1024 * 1024;

/// Byte count shared between the adapter and the owner task
struct ByteBudget {
    queued: AtomicUsize,
    limit: usize,
    drained: Notify,
}

impl ByteBudget {
    fn new(limit: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            limit,
            drained: Notify::new(),
        }
    }

    fn charge(&self, n: usize) {
        self.queued.fetch_add(n, Ordering::AcqRel);
    }

    fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| Some(q.saturating_sub(n)));
        self.drained.notify_one();
    }

    fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn has_room(&self) -> bool {
        self.queued() < self.limit
    }

    /// Resolves once the count is back under the limit.
    async fn room(&self) {
        loop {
            let drained = self.drained.notified();
            if self.has_room() {
                return;
            }
            drained.await;
        }
    }
}

enum ChannelOp {
    Request {
        request: ChannelRequest,
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },
    Data(Vec<u8>),
    Eof,
    Signal(Sig),
    Close,
}

enum Inbound {
    Data(StreamId, Vec<u8>),
    Eof,
    Closed,
    Failed(String),
}

pub struct RusshChannel {
    op_tx: mpsc::UnboundedSender<ChannelOp>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbound_budget: Arc<ByteBudget>,
    inbound_budget: Arc<ByteBudget>,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    failure: Option<String>,
    remote_eof: bool,
    closed: bool,
}

impl RusshChannel {
    pub fn spawn(channel: Channel<Msg>) -> Self {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let outbound_budget = Arc::new(ByteBudget::new(QUEUE_HIGH_WATER));
        let inbound_budget = Arc::new(ByteBudget::new(QUEUE_HIGH_WATER));
        tokio::spawn(run_channel_owner(
            channel,
            op_rx,
            inbound_tx,
            outbound_budget.clone(),
            inbound_budget.clone(),
        ));
        Self {
            op_tx,
            inbound_rx,
            outbound_budget,
            inbound_budget,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            failure: None,
            remote_eof: false,
            closed: false,
        }
    }

    fn drain_inbound(&mut self) {
        while let Ok(msg) = self.inbound_rx.try_recv() {
            match msg {
                Inbound::Data(StreamId::Stdout, data) => self.stdout.extend(data),
                Inbound::Data(StreamId::Stderr, data) => self.stderr.extend(data),
                Inbound::Eof => self.remote_eof = true,
                Inbound::Closed => {
                    self.remote_eof = true;
                    self.closed = true;
                }
                Inbound::Failed(e) => self.failure = Some(e),
            }
        }
    }

    fn buffers_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl ChannelIo for RusshChannel {
    fn request(&mut self, request: ChannelRequest) -> Pending<()> {
        let (reply_tx, pending) = Pending::channel();
        // Send failure drops reply_tx, which reads as Disconnected
        let _ = self.op_tx.send(ChannelOp::Request { request, reply_tx });
        pending
    }

    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> Result<usize, SshError> {
        self.drain_inbound();
        if let Some(e) = self.failure.take() {
            return Err(SshError::Channel(e));
        }
        let queue = match stream {
            StreamId::Stdout => &mut self.stdout,
            StreamId::Stderr => &mut self.stderr,
        };
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        self.inbound_budget.release(n);
        Ok(n)
    }

    fn poll_readable(&mut self) -> bool {
        self.drain_inbound();
        !self.stdout.is_empty() || self.failure.is_some() || self.remote_eof || self.closed
    }

    fn is_writable(&self) -> bool {
        !self.closed && self.outbound_budget.has_room()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SshError> {
        if self.closed {
            return Err(SshError::Channel("channel closed".into()));
        }
        self.outbound_budget.charge(data.len());
        match self.op_tx.send(ChannelOp::Data(data.to_vec())) {
            Ok(()) => Ok(data.len()),
            Err(_) => {
                self.outbound_budget.release(data.len());
                Ok(0)
            }
        }
    }

    fn send_eof(&mut self) -> Result<(), SshError> {
        self.op_tx
            .send(ChannelOp::Eof)
            .map_err(|_| SshError::Channel("channel task gone".into()))
    }

    fn send_signal(&mut self, signal: Sig) -> Result<(), SshError> {
        self.op_tx
            .send(ChannelOp::Signal(signal))
            .map_err(|_| SshError::Channel("channel task gone".into()))
    }

    fn is_open(&self) -> bool {
        !(self.closed && self.buffers_empty())
    }

    fn is_eof(&self) -> bool {
        self.remote_eof && self.buffers_empty()
    }

    fn close(&mut self) {
        let _ = self.op_tx.send(ChannelOp::Close);
        self.closed = true;
        self.inbound_budget.release(self.stdout.len() + self.stderr.len());
        self.stdout.clear();
        self.stderr.clear();
    }
}

async fn run_channel_owner(
    mut channel: Channel<Msg>,
    mut op_rx: mpsc::UnboundedReceiver<ChannelOp>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    outbound_budget: Arc<ByteBudget>,
    inbound_budget: Arc<ByteBudget>,
) {
    let id = channel.id();
    // Requests sent with want_reply, answered in order
    let mut awaiting_reply: VecDeque<oneshot::Sender<Result<(), SshError>>> = VecDeque::new();

    loop {
        tokio::select! {
            op = op_rx.recv() => {
                let Some(op) = op else {
                    // Adapter dropped without closing
                    let _ = channel.close().await;
                    break;
                };
                match op {
                    ChannelOp::Request { request, reply_tx } => {
                        let name = request.name();
                        let sent = match request {
                            ChannelRequest::Pty { term, cols, rows } => {
                                channel.request_pty(true, &term, cols, rows, 0, 0, &[]).await
                            }
                            ChannelRequest::Shell => channel.request_shell(true).await,
                            ChannelRequest::Exec(command) => channel.exec(true, command).await,
                            ChannelRequest::WindowChange { cols, rows } => {
                                // No reply defined for window-change
                                let result = channel
                                    .window_change(cols, rows, 0, 0)
                                    .await
                                    .map_err(|e| SshError::Channel(e.to_string()));
                                let _ = reply_tx.send(result);
                                continue;
                            }
                        };
                        match sent {
                            Ok(()) => awaiting_reply.push_back(reply_tx),
                            Err(e) => {
                                let _ = reply_tx.send(Err(SshError::Channel(format!("{}: {}", name, e))));
                            }
                        }
                    }
                    ChannelOp::Data(data) => {
                        let len = data.len();
                        let sent = channel.data(&data[..]).await;
                        outbound_budget.release(len);
                        if let Err(e) = sent {
                            let _ = inbound_tx.send(Inbound::Failed(e.to_string()));
                        }
                    }
                    ChannelOp::Eof => {
                        let _ = channel.eof().await;
                    }
                    ChannelOp::Signal(sig) => {
                        let _ = channel.signal(sig).await;
                    }
                    ChannelOp::Close => {
                        let _ = channel.close().await;
                        break;
                    }
                }
            }
            // Unread output over the limit: leave the window to fill up
            _ = inbound_budget.room(), if !inbound_budget.has_room() => {}
            msg = channel.wait(), if inbound_budget.has_room() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        inbound_budget.charge(data.len());
                        let _ = inbound_tx.send(Inbound::Data(StreamId::Stdout, data.to_vec()));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            inbound_budget.charge(data.len());
                            let _ = inbound_tx.send(Inbound::Data(StreamId::Stderr, data.to_vec()));
                        }
                    }
                    Some(ChannelMsg::Success) => {
                        if let Some(reply_tx) = awaiting_reply.pop_front() {
                            let _ = reply_tx.send(Ok(()));
                        }
                    }
                    Some(ChannelMsg::Failure) => {
                        if let Some(reply_tx) = awaiting_reply.pop_front() {
                            let _ = reply_tx.send(Err(SshError::Channel("request rejected".into())));
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = inbound_tx.send(Inbound::Eof);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("Channel {:?} exit status {}", id, exit_status);
                    }
                    Some(ChannelMsg::Close) | None => {
                        break;
                    }
                    Some(other) => {
                        trace!("Channel {:?} ignoring {:?}", id, other);
                    }
                }
            }
        }
    }

    let _ = inbound_tx.send(Inbound::Closed);
    for reply_tx in awaiting_reply {
        let _ = reply_tx.send(Err(SshError::Channel("channel closed".into())));
    }
    debug!("Channel {:?} owner task finished", id);
}
