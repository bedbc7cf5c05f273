//! Channel multiplexer
//!
//! Owns the terminal and command channels of one session and advances each
//! of them once per tick:
//!
//! - `Opening(step)`: retry the current protocol step until it completes
//!   (session -> pty -> size -> shell, or session -> exec)
//! - `Open`: drain stdout and stderr into the sinks, then forward pending
//!   stdin once the channel has room for it
//! - `Closing`: input is done, keep draining until the remote closes
//!
//! A failed step or a fatal read/write closes the channel, and closed
//! channels are dropped from the lists at the end of the pass.

use std::task::Poll;

use russh::Sig;
use tracing::{debug, info, warn};

use super::stream::{ChannelStreams, Input, InputSource, OutputSink};
use super::types::{ChannelId, ChannelKind, ChannelState, OpenStep};
use crate::ssh::transport::{ChannelIo, ChannelRequest, Pending, SshTransport, StreamId};
use crate::ssh::{EngineConfig, SshError};

enum ChannelSetup {
    Terminal { term: String, cols: u32, rows: u32 },
    Command { command: Vec<u8> },
}

impl ChannelSetup {
    fn kind(&self) -> ChannelKind {
        match self {
            ChannelSetup::Terminal { .. } => ChannelKind::Terminal,
            ChannelSetup::Command { .. } => ChannelKind::Command,
        }
    }

    fn after(&self, step: OpenStep) -> ChannelState {
        match (self, step) {
            (ChannelSetup::Terminal { .. }, OpenStep::OpenSession) => {
                ChannelState::Opening(OpenStep::RequestPty)
            }
            (ChannelSetup::Terminal { .. }, OpenStep::RequestPty) => {
                ChannelState::Opening(OpenStep::SetSize)
            }
            (ChannelSetup::Terminal { .. }, OpenStep::SetSize) => {
                ChannelState::Opening(OpenStep::RequestShell)
            }
            (ChannelSetup::Command { .. }, OpenStep::OpenSession) => {
                ChannelState::Opening(OpenStep::RequestExec)
            }
            _ => ChannelState::Open,
        }
    }

    fn request_for(&self, step: OpenStep) -> Option<ChannelRequest> {
        match (self, step) {
            (ChannelSetup::Terminal { term, cols, rows }, OpenStep::RequestPty) => {
                Some(ChannelRequest::Pty {
                    term: term.clone(),
                    cols: *cols,
                    rows: *rows,
                })
            }
            (ChannelSetup::Terminal { cols, rows, .. }, OpenStep::SetSize) => {
                Some(ChannelRequest::WindowChange {
                    cols: *cols,
                    rows: *rows,
                })
            }
            (ChannelSetup::Terminal { .. }, OpenStep::RequestShell) => Some(ChannelRequest::Shell),
            (ChannelSetup::Command { command }, OpenStep::RequestExec) => {
                Some(ChannelRequest::Exec(command.clone()))
            }
            _ => None,
        }
    }
}

/// One terminal or command channel and its stream endpoints
pub struct MuxChannel {
    id: ChannelId,
    setup: ChannelSetup,
    state: ChannelState,
    opening: Option<Pending<Box<dyn ChannelIo>>>,
    request: Option<Pending<()>>,
    resize: Option<Pending<()>>,
    io: Option<Box<dyn ChannelIo>>,
    stdin: Option<Box<dyn InputSource>>,
    stdout: Option<Box<dyn OutputSink>>,
    stderr: Option<Box<dyn OutputSink>>,
}

impl MuxChannel {
    fn open(
        id: ChannelId,
        setup: ChannelSetup,
        streams: ChannelStreams,
        transport: &mut dyn SshTransport,
    ) -> Self {
        Self {
            id,
            setup,
            state: ChannelState::Opening(OpenStep::OpenSession),
            opening: Some(transport.open_session()),
            request: None,
            resize: None,
            io: None,
            stdin: streams.stdin,
            stdout: streams.stdout,
            stderr: streams.stderr,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.setup.kind()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Usable from the caller's point of view: open on both ends, no EOF yet.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ChannelState::Open | ChannelState::Closing)
            && self
                .io
                .as_ref()
                .map(|io| io.is_open() && !io.is_eof())
                .unwrap_or(false)
    }

    /// One tick of work. `buf` is the session's shared read buffer.
    pub fn process(&mut self, buf: &mut [u8]) {
        if let ChannelState::Opening(_) = self.state {
            self.advance_open();
        }
        if matches!(self.state, ChannelState::Open | ChannelState::Closing) {
            self.pump(buf);
        }
    }

    fn advance_open(&mut self) {
        while let ChannelState::Opening(step) = self.state {
            if step == OpenStep::OpenSession {
                let Some(mut pending) = self.opening.take() else {
                    return self.fail_open(step, SshError::Channel("no open in flight".into()));
                };
                match pending.poll() {
                    Poll::Pending => {
                        self.opening = Some(pending);
                        return;
                    }
                    Poll::Ready(Ok(io)) => {
                        self.io = Some(io);
                        self.state = self.setup.after(step);
                    }
                    Poll::Ready(Err(e)) => return self.fail_open(step, e),
                }
                continue;
            }

            let Some(io) = self.io.as_mut() else {
                return self.fail_open(step, SshError::Disconnected);
            };
            let mut pending = match self.request.take() {
                Some(pending) => pending,
                None => match self.setup.request_for(step) {
                    Some(request) => io.request(request),
                    None => {
                        return self.fail_open(
                            step,
                            SshError::Channel(format!("no request for {:?}", step)),
                        )
                    }
                },
            };
            match pending.poll() {
                Poll::Pending => {
                    self.request = Some(pending);
                    return;
                }
                Poll::Ready(Ok(())) => {
                    self.state = self.setup.after(step);
                    if self.state == ChannelState::Open {
                        info!("{} {} open", self.kind(), self.id);
                    }
                }
                Poll::Ready(Err(e)) => return self.fail_open(step, e),
            }
        }
    }

    fn fail_open(&mut self, step: OpenStep, err: SshError) {
        warn!("{} {} failed at {:?}: {}", self.kind(), self.id, step, err);
        self.close();
    }

    fn pump(&mut self, buf: &mut [u8]) {
        if let Some(mut pending) = self.resize.take() {
            match pending.poll() {
                Poll::Pending => self.resize = Some(pending),
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => {
                    warn!("Resize of {} {} failed: {}", self.kind(), self.id, e);
                    return self.close();
                }
            }
        }

        if !self.read_into(StreamId::Stdout, buf) {
            return;
        }
        // Terminals read stderr too: unread extended data would keep a
        // remotely closed channel open forever
        if !self.read_into(StreamId::Stderr, buf) {
            return;
        }
        if self.state == ChannelState::Open && !self.feed_input() {
            return;
        }

        let remote_closed = self.io.as_ref().map(|io| !io.is_open()).unwrap_or(true);
        if remote_closed {
            debug!("{} {} closed by remote", self.kind(), self.id);
            self.close();
        }
    }

    /// False when the channel had to be closed.
    fn read_into(&mut self, stream: StreamId, buf: &mut [u8]) -> bool {
        let kind = self.kind();
        let sink = match stream {
            StreamId::Stdout => &mut self.stdout,
            StreamId::Stderr => &mut self.stderr,
        };
        if sink.as_ref().is_some_and(|s| !s.has_capacity()) {
            return true;
        }
        let Some(io) = self.io.as_mut() else {
            return false;
        };
        match io.read(stream, buf) {
            Ok(n) => {
                if let Some(sink) = sink.as_mut() {
                    sink.push(&buf[..n]);
                }
                true
            }
            Err(e) => {
                warn!("Read from {} {} failed: {}", kind, self.id, e);
                self.close();
                false
            }
        }
    }

    /// False when the channel had to be closed.
    fn feed_input(&mut self) -> bool {
        let kind = self.kind();
        let Some(stdin) = self.stdin.as_mut() else {
            return true;
        };
        let Some(io) = self.io.as_mut() else {
            return false;
        };
        // Input stays in its queue until the channel can take it
        if !io.is_writable() {
            return true;
        }
        let input = stdin.pull();
        match input {
            Input::Idle => true,
            Input::Data(bytes) if bytes.is_empty() => true,
            Input::Data(bytes) => match io.write(&bytes) {
                Ok(n) if n == bytes.len() => true,
                Ok(n) => {
                    warn!(
                        "Short write on {} {}: {} of {} bytes",
                        kind,
                        self.id,
                        n,
                        bytes.len()
                    );
                    self.close();
                    false
                }
                Err(e) => {
                    warn!("Write to {} {} failed: {}", kind, self.id, e);
                    self.close();
                    false
                }
            },
            Input::Done => {
                if kind == ChannelKind::Command {
                    for _ in 0..2 {
                        if let Err(e) = io.send_signal(Sig::INT) {
                            debug!("Interrupt on {} failed: {}", self.id, e);
                        }
                    }
                }
                if let Err(e) = io.send_eof() {
                    debug!("EOF on {} failed: {}", self.id, e);
                }
                self.stdin = None;
                self.state = ChannelState::Closing;
                debug!("{} {} input finished", kind, self.id);
                true
            }
        }
    }

    /// Resize the terminal. Before the channel is open the new size is used
    /// by the set-size step.
    pub fn set_size(&mut self, cols: u32, rows: u32) -> Result<(), SshError> {
        let ChannelSetup::Terminal {
            cols: current_cols,
            rows: current_rows,
            ..
        } = &mut self.setup
        else {
            return Err(SshError::Channel(format!("{} is not a terminal", self.id)));
        };
        *current_cols = cols;
        *current_rows = rows;

        match self.state {
            ChannelState::Opening(_) => Ok(()),
            ChannelState::Open | ChannelState::Closing => {
                let Some(io) = self.io.as_mut() else {
                    return Err(SshError::Disconnected);
                };
                self.resize = Some(io.request(ChannelRequest::WindowChange { cols, rows }));
                Ok(())
            }
            ChannelState::Closed => Err(SshError::Channel(format!("{} is closed", self.id))),
        }
    }

    /// Close and release the channel. Idempotent.
    pub fn close(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.opening = None;
        self.request = None;
        self.resize = None;
        if let Some(mut io) = self.io.take() {
            io.close();
            let _ = io.send_eof();
        }
        self.state = ChannelState::Closed;
    }
}

/// Terminal and command channels of one session
pub struct ChannelMultiplexer {
    terminals: Vec<MuxChannel>,
    commands: Vec<MuxChannel>,
    next_id: u32,
    buffer: Vec<u8>,
    terminal_type: String,
    cols: u32,
    rows: u32,
}

impl ChannelMultiplexer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            terminals: Vec::new(),
            commands: Vec::new(),
            next_id: 1,
            buffer: vec![0u8; config.channel_buffer_size.max(1)],
            terminal_type: config.terminal_type.clone(),
            cols: config.cols,
            rows: config.rows,
        }
    }

    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Start opening a shell channel with a PTY.
    pub fn create_terminal(
        &mut self,
        transport: &mut dyn SshTransport,
        streams: ChannelStreams,
    ) -> ChannelId {
        let id = self.allocate_id();
        let setup = ChannelSetup::Terminal {
            term: self.terminal_type.clone(),
            cols: self.cols,
            rows: self.rows,
        };
        self.terminals
            .push(MuxChannel::open(id, setup, streams, transport));
        debug!("Opening terminal {}", id);
        id
    }

    /// Start opening an exec channel for `command`.
    pub fn run_command(
        &mut self,
        transport: &mut dyn SshTransport,
        command: impl Into<Vec<u8>>,
        streams: ChannelStreams,
    ) -> ChannelId {
        let id = self.allocate_id();
        let setup = ChannelSetup::Command {
            command: command.into(),
        };
        self.commands
            .push(MuxChannel::open(id, setup, streams, transport));
        debug!("Opening command {}", id);
        id
    }

    fn list(&self, kind: ChannelKind) -> &Vec<MuxChannel> {
        match kind {
            ChannelKind::Terminal => &self.terminals,
            ChannelKind::Command => &self.commands,
        }
    }

    fn list_mut(&mut self, kind: ChannelKind) -> &mut Vec<MuxChannel> {
        match kind {
            ChannelKind::Terminal => &mut self.terminals,
            ChannelKind::Command => &mut self.commands,
        }
    }

    pub fn get(&self, kind: ChannelKind, id: ChannelId) -> Option<&MuxChannel> {
        self.list(kind).iter().find(|c| c.id == id)
    }

    pub fn check(&self, kind: ChannelKind, id: ChannelId) -> bool {
        self.get(kind, id).map(MuxChannel::is_live).unwrap_or(false)
    }

    pub fn state(&self, kind: ChannelKind, id: ChannelId) -> Option<ChannelState> {
        self.get(kind, id).map(MuxChannel::state)
    }

    pub fn set_terminal_size(
        &mut self,
        id: ChannelId,
        cols: u32,
        rows: u32,
    ) -> Result<(), SshError> {
        let channel = self
            .terminals
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SshError::Channel(format!("terminal {} not found", id)))?;
        let result = channel.set_size(cols, rows);
        if result.is_err() {
            channel.close();
        }
        result
    }

    /// Close and drop a channel. Returns false when it was not found.
    pub fn close(&mut self, kind: ChannelKind, id: ChannelId) -> bool {
        let list = self.list_mut(kind);
        let Some(index) = list.iter().position(|c| c.id == id) else {
            return false;
        };
        let mut channel = list.remove(index);
        channel.close();
        debug!("Closed {} {}", kind, id);
        true
    }

    pub fn ids(&self, kind: ChannelKind) -> Vec<ChannelId> {
        self.list(kind).iter().map(|c| c.id).collect()
    }

    pub fn process_terminals(&mut self) {
        for channel in self.terminals.iter_mut() {
            channel.process(&mut self.buffer);
        }
        Self::reap(&mut self.terminals);
    }

    pub fn process_commands(&mut self) {
        for channel in self.commands.iter_mut() {
            channel.process(&mut self.buffer);
        }
        Self::reap(&mut self.commands);
    }

    fn reap(channels: &mut Vec<MuxChannel>) {
        channels.retain(|c| {
            let keep = c.state != ChannelState::Closed;
            if !keep {
                debug!("Released {} {}", c.kind(), c.id);
            }
            keep
        });
    }

    /// Close terminals, then commands, each newest first.
    pub fn close_all(&mut self) {
        for mut channel in self.terminals.drain(..).rev() {
            channel.close();
        }
        for mut channel in self.commands.drain(..).rev() {
            channel.close();
        }
    }
}
