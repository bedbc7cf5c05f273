//! Poll Loop
//!
//! The single worker that owns every socket and channel. Each tick it
//! 1. applies the commands queued by [`SshEngine`](super::SshEngine) handles,
//! 2. advances connection attempts one non-blocking step,
//! 3. lets the registry tick every session,
//!
//! then sleeps for the tick interval. Callers never touch a transport
//! directly; they get their answers through oneshot replies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::forwarding::LocalForward;
use crate::session::{
    ChannelId, ChannelKind, ChannelStreams, ConnectionRegistry, SessionId, SessionInfo,
    SessionTable,
};
use crate::ssh::authenticator::{ConnectAttempt, ConnectRequest};
use crate::ssh::transport::Connector;
use crate::ssh::{EngineConfig, SshError};

type Reply<T> = oneshot::Sender<Result<T, SshError>>;

/// Work queued for the poll loop
pub(crate) enum EngineCommand {
    Connect {
        request: ConnectRequest,
        reply_tx: Reply<SessionId>,
    },
    Disconnect {
        session: SessionId,
        reply_tx: oneshot::Sender<bool>,
    },
    CreateTerminal {
        session: SessionId,
        streams: ChannelStreams,
        reply_tx: Reply<ChannelId>,
    },
    RunCommand {
        session: SessionId,
        command: Vec<u8>,
        streams: ChannelStreams,
        reply_tx: Reply<ChannelId>,
    },
    SetTerminalSize {
        session: SessionId,
        channel: ChannelId,
        cols: u32,
        rows: u32,
        reply_tx: Reply<()>,
    },
    CheckChannel {
        session: SessionId,
        kind: ChannelKind,
        channel: ChannelId,
        reply_tx: oneshot::Sender<bool>,
    },
    CloseChannel {
        session: SessionId,
        kind: ChannelKind,
        channel: ChannelId,
        reply_tx: oneshot::Sender<bool>,
    },
    LocalForward {
        session: SessionId,
        forward: LocalForward,
        reply_tx: Reply<SocketAddr>,
    },
    SessionInfo {
        session: SessionId,
        reply_tx: Reply<SessionInfo>,
    },
    ListSessions {
        reply_tx: oneshot::Sender<Vec<SessionId>>,
    },
    Shutdown {
        reply_tx: oneshot::Sender<()>,
    },
}

struct PendingConnect {
    attempt: ConnectAttempt,
    reply_tx: Reply<SessionId>,
}

pub(crate) struct PollLoop {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    registry: ConnectionRegistry,
    connecting: Vec<PendingConnect>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl PollLoop {
    pub(crate) fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.clone()),
            config,
            connector,
            connecting: Vec::new(),
            cmd_rx,
            shutdown_tx: None,
        }
    }

    pub(crate) fn sessions(&self) -> SessionTable {
        self.registry.table()
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Poll loop started (tick {:?})", self.config.tick_interval());

        loop {
            if !self.drain_commands() {
                break;
            }
            self.advance_connects();
            self.registry.process();
            ticker.tick().await;
        }

        // === Cleanup phase ===
        for mut pending in self.connecting.drain(..) {
            pending.attempt.abort();
            let _ = pending.reply_tx.send(Err(SshError::Disconnected));
        }
        self.registry.shutdown();
        info!("Poll loop stopped");

        if let Some(reply_tx) = self.shutdown_tx.take() {
            let _ = reply_tx.send(());
        }
    }

    /// False once the loop should stop.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => {
                    if !self.apply(cmd) {
                        return false;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("All engine handles dropped");
                    return false;
                }
            }
        }
    }

    /// False for a shutdown request.
    fn apply(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::Connect { request, reply_tx } => {
                let attempt = ConnectAttempt::start(self.connector.as_ref(), request);
                self.connecting.push(PendingConnect { attempt, reply_tx });
            }

            EngineCommand::Disconnect { session, reply_tx } => {
                let found = self.registry.disconnect(session);
                if !found {
                    debug!("Disconnect for unknown session {}", session);
                }
                let _ = reply_tx.send(found);
            }

            EngineCommand::CreateTerminal {
                session,
                streams,
                reply_tx,
            } => {
                let result = self
                    .registry
                    .session_mut(session)
                    .map(|record| record.create_terminal(streams));
                let _ = reply_tx.send(result);
            }

            EngineCommand::RunCommand {
                session,
                command,
                streams,
                reply_tx,
            } => {
                let result = self
                    .registry
                    .session_mut(session)
                    .map(|record| record.run_command(command, streams));
                let _ = reply_tx.send(result);
            }

            EngineCommand::SetTerminalSize {
                session,
                channel,
                cols,
                rows,
                reply_tx,
            } => {
                let result = self.registry.session_mut(session).and_then(|record| {
                    record.mux_mut().set_terminal_size(channel, cols, rows)
                });
                let _ = reply_tx.send(result);
            }

            EngineCommand::CheckChannel {
                session,
                kind,
                channel,
                reply_tx,
            } => {
                let live = self
                    .registry
                    .get(session)
                    .map(|record| record.is_connected() && record.mux().check(kind, channel))
                    .unwrap_or(false);
                let _ = reply_tx.send(live);
            }

            EngineCommand::CloseChannel {
                session,
                kind,
                channel,
                reply_tx,
            } => {
                let closed = self
                    .registry
                    .get_mut(session)
                    .map(|record| record.mux_mut().close(kind, channel))
                    .unwrap_or(false);
                let _ = reply_tx.send(closed);
            }

            EngineCommand::LocalForward {
                session,
                forward,
                reply_tx,
            } => {
                let result = self
                    .registry
                    .session_mut(session)
                    .and_then(|record| record.add_forward(forward));
                if let Err(e) = &result {
                    warn!("Local forward on session {} failed: {}", session, e);
                }
                let _ = reply_tx.send(result);
            }

            EngineCommand::SessionInfo { session, reply_tx } => {
                let result = self
                    .registry
                    .get(session)
                    .map(|record| record.info())
                    .ok_or_else(|| SshError::SessionNotFound(session.to_string()));
                let _ = reply_tx.send(result);
            }

            EngineCommand::ListSessions { reply_tx } => {
                let _ = reply_tx.send(self.registry.ids());
            }

            EngineCommand::Shutdown { reply_tx } => {
                info!("Shutdown requested");
                self.shutdown_tx = Some(reply_tx);
                return false;
            }
        }
        true
    }

    fn advance_connects(&mut self) {
        for mut pending in std::mem::take(&mut self.connecting) {
            if pending.reply_tx.is_closed() {
                pending.attempt.abort();
                continue;
            }
            match pending.attempt.poll() {
                Poll::Pending => self.connecting.push(pending),
                Poll::Ready(Ok(established)) => {
                    let id = self.registry.register(established);
                    if pending.reply_tx.send(Ok(id)).is_err() {
                        warn!("Caller left before session {} was ready", id);
                        self.registry.disconnect(id);
                    }
                }
                Poll::Ready(Err(e)) => {
                    warn!("Connect to {} failed: {}", pending.attempt.target(), e);
                    let _ = pending.reply_tx.send(Err(e));
                }
            }
        }
    }
}
