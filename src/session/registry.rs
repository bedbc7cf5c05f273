//! Connection Registry
//!
//! Owns every live session: its transport, channel multiplexer and port
//! forwards. Only the poll loop mutates it. Session ids are also published
//! in a `DashMap` so other tasks can check whether a session exists without
//! a round trip through the worker.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::multiplexer::ChannelMultiplexer;
use super::stream::ChannelStreams;
use super::types::{ChannelId, ChannelKind, SessionId, SessionInfo};
use crate::forwarding::{LocalForward, PortForwardListener};
use crate::ssh::authenticator::{Established, ProgressLogger};
use crate::ssh::fingerprint;
use crate::ssh::transport::SshTransport;
use crate::ssh::{EngineConfig, SshError};

/// What other tasks may read about a session without asking the worker
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// Session ids readable from any task
pub type SessionTable = Arc<DashMap<SessionId, SessionSummary>>;

/// One registered session and everything multiplexed over it
pub struct SessionRecord {
    id: SessionId,
    host: String,
    port: u16,
    username: String,
    fingerprint: Vec<u8>,
    connected_at: DateTime<Utc>,
    transport: Box<dyn SshTransport>,
    mux: ChannelMultiplexer,
    forwards: Vec<PortForwardListener>,
    forward_buffer_size: usize,
    logger: Option<ProgressLogger>,
}

impl SessionRecord {
    fn new(id: SessionId, established: Established, config: &EngineConfig) -> Self {
        Self {
            id,
            host: established.host,
            port: established.port,
            username: established.username,
            fingerprint: established.fingerprint,
            connected_at: Utc::now(),
            transport: established.transport,
            mux: ChannelMultiplexer::new(config),
            forwards: Vec::new(),
            forward_buffer_size: config.forward_buffer_size,
            logger: established.logger,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn mux(&self) -> &ChannelMultiplexer {
        &self.mux
    }

    pub fn mux_mut(&mut self) -> &mut ChannelMultiplexer {
        &mut self.mux
    }

    pub fn create_terminal(&mut self, streams: ChannelStreams) -> ChannelId {
        self.mux.create_terminal(self.transport.as_mut(), streams)
    }

    pub fn run_command(&mut self, command: impl Into<Vec<u8>>, streams: ChannelStreams) -> ChannelId {
        self.mux
            .run_command(self.transport.as_mut(), command, streams)
    }

    /// Bind a local listener forwarding to `remote_host:remote_port` through
    /// this session.
    pub fn add_forward(&mut self, forward: LocalForward) -> Result<SocketAddr, SshError> {
        let listener = PortForwardListener::bind(forward, self.forward_buffer_size)?;
        let addr = listener.bound_addr();
        if let Some(logger) = &self.logger {
            logger(&format!(
                "forward {} -> {}:{}",
                addr,
                listener.config().remote_host,
                listener.config().remote_port
            ));
        }
        self.forwards.push(listener);
        Ok(addr)
    }

    pub fn forwards(&self) -> &[PortForwardListener] {
        &self.forwards
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            fingerprint: fingerprint::to_hex(&self.fingerprint),
            connected_at: self.connected_at.to_rfc3339(),
            terminals: self.mux.ids(ChannelKind::Terminal),
            commands: self.mux.ids(ChannelKind::Command),
            forwards: self.forwards.iter().map(PortForwardListener::info).collect(),
        }
    }

    /// Forwards, terminals, commands, then a second pass over the forwards
    /// to release pairs the remote closed.
    fn process(&mut self) {
        for forward in self.forwards.iter_mut() {
            forward.process(self.transport.as_mut());
        }
        self.mux.process_terminals();
        self.mux.process_commands();
        for forward in self.forwards.iter_mut() {
            let released = forward.reap_closed();
            if released > 0 {
                debug!(
                    "Session {}: released {} forwarded connection(s) on {}",
                    self.id,
                    released,
                    forward.bound_addr()
                );
            }
        }
    }

    /// Terminals, then commands, then forwards (each newest first), then the
    /// transport.
    fn teardown(&mut self) {
        self.mux.close_all();
        for mut forward in self.forwards.drain(..).rev() {
            forward.close();
        }
        self.transport.disconnect();
        info!("Session {} ({}) disconnected", self.id, self.target());
    }
}

pub struct ConnectionRegistry {
    /// Registration order
    sessions: Vec<SessionRecord>,
    table: SessionTable,
    config: EngineConfig,
}

impl ConnectionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sessions: Vec::new(),
            table: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Shared view of the registered session ids
    pub fn table(&self) -> SessionTable {
        self.table.clone()
    }

    pub fn register(&mut self, established: Established) -> SessionId {
        let id = SessionId::new();
        let record = SessionRecord::new(id, established, &self.config);
        info!("Registered session {} ({})", id, record.target());
        self.table.insert(
            id,
            SessionSummary {
                host: record.host.clone(),
                port: record.port,
                username: record.username.clone(),
            },
        );
        self.sessions.push(record);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionRecord> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionRecord> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Like [`get_mut`](Self::get_mut) but with a `SessionNotFound` error.
    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut SessionRecord, SshError> {
        self.get_mut(id)
            .ok_or_else(|| SshError::SessionNotFound(id.to_string()))
    }

    pub fn check_session(&self, id: SessionId) -> bool {
        self.get(id).map(SessionRecord::is_connected).unwrap_or(false)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tear a session down and forget it. False when the id is unknown.
    pub fn disconnect(&mut self, id: SessionId) -> bool {
        let Some(index) = self.sessions.iter().position(|s| s.id == id) else {
            return false;
        };
        let mut record = self.sessions.remove(index);
        self.table.remove(&id);
        record.teardown();
        true
    }

    /// One tick for every session. Sessions whose transport went away are
    /// torn down; there is no reconnect.
    pub fn process(&mut self) {
        let mut lost = Vec::new();
        for record in self.sessions.iter_mut() {
            if !record.is_connected() {
                lost.push(record.id);
                continue;
            }
            record.process();
        }
        for id in lost {
            warn!("Session {} lost its transport", id);
            self.disconnect(id);
        }
    }

    /// Disconnect everything, newest session first.
    pub fn shutdown(&mut self) {
        if !self.sessions.is_empty() {
            info!("Disconnecting {} session(s)", self.sessions.len());
        }
        while let Some(mut record) = self.sessions.pop() {
            self.table.remove(&record.id);
            record.teardown();
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
