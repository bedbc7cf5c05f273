//! ProxyJump Implementation for SSH
//!
//! Reaches a server through one or more jump hosts. Every hop is a full
//! session of its own:
//! ```text
//! Client --SSH--> [Jump1]
//! Client --SSH--> localhost:p1 --forward on Jump1--> [Jump2]
//! Client --SSH--> localhost:p2 --forward on Jump2--> [Target]
//! ```
//!
//! Hop *i* waits for hop *i-1*'s session, asks it for a local forward on a
//! random ephemeral port to its own host:port, then connects through that
//! port. Later transports run inside earlier forwards, so teardown always
//! goes target first.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::authenticator::{ConnectRequest, ProgressLogger};
use super::config::Identity;
use super::error::SshError;
use crate::config::{ProfileSource, ServerProfile};
use crate::engine::SshEngine;
use crate::session::SessionId;

/// Receives the host key digest of each hop as it is verified or first
/// seen, with the hop's server profile id when it has one.
pub type HostKeyCallback = Arc<dyn Fn(Option<Uuid>, &[u8]) + Send + Sync>;

/// Proxy hop configuration
#[derive(Debug, Clone)]
pub struct ProxyHop {
    /// Profile this hop was resolved from
    pub server_id: Option<Uuid>,
    /// Hostname of the jump host, as seen from the previous hop
    pub host: String,
    /// Port of the jump host (default: 22)
    pub port: u16,
    pub identity: Identity,
    /// Pinned host key digest; empty means trust on first use
    pub pinned: Vec<u8>,
}

impl ProxyHop {
    pub fn new(host: impl Into<String>, identity: Identity) -> Self {
        Self {
            server_id: None,
            host: host.into(),
            port: 22,
            identity,
            pinned: Vec::new(),
        }
    }

    fn from_profile(server: &ServerProfile, identity: Identity) -> Self {
        Self {
            server_id: Some(server.id),
            host: server.host.clone(),
            port: server.port,
            identity,
            pinned: server.host_key.clone(),
        }
    }

    /// Set custom port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn pinned(mut self, fingerprint: Vec<u8>) -> Self {
        self.pinned = fingerprint;
        self
    }
}

/// Ordered connection tasks, first jump host first and target last
#[derive(Clone, Default)]
pub struct ProxyChain {
    pub hops: Vec<ProxyHop>,
    logger: Option<ProgressLogger>,
    on_host_key: Option<HostKeyCallback>,
}

impl std::fmt::Debug for ProxyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyChain").field("hops", &self.hops).finish()
    }
}

impl ProxyChain {
    /// Create an empty proxy chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hop to the chain
    pub fn add_hop(mut self, hop: ProxyHop) -> Self {
        self.hops.push(hop);
        self
    }

    /// Follow `proxy_id` links from `server_id` back to the first jump host.
    pub fn resolve(source: &dyn ProfileSource, server_id: Uuid) -> Result<Self, SshError> {
        let mut hops = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(server_id);

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(SshError::Profile(format!("proxy cycle through server {}", id)));
            }
            let server = source
                .server(id)
                .ok_or_else(|| SshError::Profile(format!("unknown server {}", id)))?;
            let identity = source
                .identity(server.identity_id)
                .ok_or_else(|| {
                    SshError::Profile(format!(
                        "unknown identity {} for server {}",
                        server.identity_id, server.title
                    ))
                })?
                .to_identity()?;
            hops.push(ProxyHop::from_profile(&server, identity));
            next = server.proxy_id;
        }

        hops.reverse();
        debug!("Resolved proxy chain of {} hop(s) for {}", hops.len(), server_id);
        Ok(Self {
            hops,
            ..Default::default()
        })
    }

    pub fn with_logger(mut self, logger: ProgressLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn on_host_key(mut self, callback: HostKeyCallback) -> Self {
        self.on_host_key = Some(callback);
        self
    }

    /// Check if the chain is empty
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Get the number of hops
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Connect every hop in order. On failure the sessions already
    /// established are disconnected, newest first, before the error returns.
    pub async fn establish(&self, engine: &SshEngine) -> Result<ChainConnection, SshError> {
        if self.hops.is_empty() {
            return Err(SshError::Profile("empty proxy chain".into()));
        }

        let mut sessions: Vec<SessionId> = Vec::with_capacity(self.hops.len());
        let mut hop_ports = Vec::with_capacity(self.hops.len() - 1);

        for (index, hop) in self.hops.iter().enumerate() {
            match self.connect_hop(engine, hop, sessions.last().copied()).await {
                Ok((session, local_port)) => {
                    sessions.push(session);
                    hop_ports.extend(local_port);
                }
                Err(e) => {
                    if e.is_fatal_for_chain() {
                        warn!(
                            "Connection to hop {} ({}:{}) failed: {}",
                            index + 1,
                            hop.host,
                            hop.port,
                            e
                        );
                    } else {
                        warn!("Could not set up hop {} ({}): {}", index + 1, hop.host, e);
                    }
                    for session in sessions.iter().rev() {
                        if let Err(e) = engine.disconnect(*session).await {
                            debug!("Rollback of session {} failed: {}", session, e);
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!("Proxy chain established ({} hop(s))", sessions.len());
        Ok(ChainConnection {
            sessions,
            hop_ports,
        })
    }

    async fn connect_hop(
        &self,
        engine: &SshEngine,
        hop: &ProxyHop,
        parent: Option<SessionId>,
    ) -> Result<(SessionId, Option<u16>), SshError> {
        let (host, port, local_port) = match parent {
            None => (hop.host.clone(), hop.port, None),
            Some(parent) => {
                engine
                    .wait_session(parent, engine.config().session_wait())
                    .await?;
                let addr = engine
                    .forward_on_random_port(parent, &hop.host, hop.port)
                    .await?;
                debug!(
                    "Hop {}:{} tunnelled through {} on session {}",
                    hop.host, hop.port, addr, parent
                );
                (addr.ip().to_string(), addr.port(), Some(addr.port()))
            }
        };

        let mut request =
            ConnectRequest::new(host, port, hop.identity.clone()).pinned(hop.pinned.clone());
        if let Some(logger) = &self.logger {
            request = request.with_logger(logger.clone());
        }
        if let Some(callback) = &self.on_host_key {
            let callback = callback.clone();
            let server_id = hop.server_id;
            request = request.on_fingerprint(Arc::new(move |fingerprint: &[u8]| {
                callback(server_id, fingerprint)
            }));
        }

        let session = engine.connect(request).await?;
        Ok((session, local_port))
    }
}

/// Sessions of an established chain, first jump host first
#[derive(Debug, Clone)]
pub struct ChainConnection {
    pub sessions: Vec<SessionId>,
    /// Local forward port each hop after the first connected through
    pub hop_ports: Vec<u16>,
}

impl ChainConnection {
    /// Session on the final target
    pub fn target(&self) -> Option<SessionId> {
        self.sessions.last().copied()
    }

    /// Disconnect target first, then each jump host back to the first.
    /// Returns the order used.
    pub async fn disconnect(&self, engine: &SshEngine) -> Vec<SessionId> {
        let order: Vec<SessionId> = self.sessions.iter().rev().copied().collect();
        for session in &order {
            match engine.disconnect(*session).await {
                Ok(true) => debug!("Chain session {} disconnected", session),
                Ok(false) => debug!("Chain session {} was already gone", session),
                Err(e) => warn!("Failed to disconnect chain session {}: {}", session, e),
            }
        }
        order
    }
}
