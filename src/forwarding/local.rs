//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: Forward localhost:8888 -> remote_jupyter:8888
//!
//! The listener has no task of its own. The poll loop calls
//! [`PortForwardListener::process`] every tick, which
//! 1. relays channel output to the local sockets,
//! 2. relays local socket input to the channels,
//! 3. accepts new local connections and opens a direct-tcpip channel for each,
//!
//! and [`PortForwardListener::reap_closed`] once the session's channels have
//! been serviced. Readiness comes from tokio's reactor through `try_read`,
//! `try_write` and a no-op-waker `poll_accept`, so nothing here blocks.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use futures_util::task::noop_waker_ref;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::session::types::ForwardInfo;
use crate::ssh::transport::{ChannelIo, Pending, SshTransport, StreamId};
use crate::ssh::SshError;

/// Originator address reported in direct-tcpip requests
const ORIGINATOR_HOST: &str = "127.0.0.1";

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local interface to bind (default "localhost")
    pub bind_host: String,
    /// Local port; 0 picks a free one
    pub local_port: u16,
    /// Remote host to connect to through SSH (e.g., "localhost")
    pub remote_host: String,
    /// Remote port to connect to
    pub remote_port: u16,
    /// Description for logs
    pub description: Option<String>,
}

impl LocalForward {
    /// Create a new local port forward
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            bind_host: "localhost".into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            description: None,
        }
    }

    /// Bind a different local interface
    pub fn bind_on(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Set description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Accepted connections whose channel could not be opened
    pub failed_opens: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

struct ForwardConnection {
    stream: TcpStream,
    channel: Box<dyn ChannelIo>,
    peer: SocketAddr,
    /// Channel output the local socket has not taken yet
    backlog: Vec<u8>,
    failed: bool,
}

struct OpeningConnection {
    stream: TcpStream,
    peer: SocketAddr,
    open: Pending<Box<dyn ChannelIo>>,
}

/// A bound local port and the connections relayed through it
pub struct PortForwardListener {
    config: LocalForward,
    listener: TcpListener,
    bound_addr: SocketAddr,
    connections: HashMap<u64, ForwardConnection>,
    opening: Vec<OpeningConnection>,
    next_conn_id: u64,
    buffer: Vec<u8>,
    stats: ForwardStats,
}

impl PortForwardListener {
    /// Bind the local port. Must run inside a tokio runtime.
    pub fn bind(config: LocalForward, buffer_size: usize) -> Result<Self, SshError> {
        let local = format!("{}:{}", config.bind_host, config.local_port);
        let listener = std::net::TcpListener::bind((config.bind_host.as_str(), config.local_port))
            .map_err(|e| bind_error(&local, e))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let bound_addr = listener.local_addr()?;

        info!(
            "Started local port forward: {} -> {}:{}",
            bound_addr, config.remote_host, config.remote_port
        );

        Ok(Self {
            config,
            listener,
            bound_addr,
            connections: HashMap::new(),
            opening: Vec::new(),
            next_conn_id: 1,
            buffer: vec![0u8; buffer_size.max(1)],
            stats: ForwardStats::default(),
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn config(&self) -> &LocalForward {
        &self.config
    }

    /// Relayed connections currently in the table
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.clone()
    }

    pub fn info(&self) -> ForwardInfo {
        ForwardInfo {
            local_addr: self.bound_addr.to_string(),
            remote_host: self.config.remote_host.clone(),
            remote_port: self.config.remote_port,
            connections: self.connections.len(),
        }
    }

    /// One tick of relaying and accepting.
    pub fn process(&mut self, transport: &mut dyn SshTransport) {
        self.relay_from_remote();
        self.relay_to_remote();
        self.accept(transport);
        self.settle_opening();
    }

    fn relay_from_remote(&mut self) {
        for conn in self.connections.values_mut() {
            if conn.failed {
                continue;
            }
            if conn.backlog.is_empty() {
                if !conn.channel.poll_readable() {
                    continue;
                }
                match conn.channel.read(StreamId::Stdout, &mut self.buffer) {
                    Ok(0) => continue,
                    Ok(n) => conn.backlog.extend_from_slice(&self.buffer[..n]),
                    Err(e) => {
                        debug!("Forward channel for {} failed: {}", conn.peer, e);
                        conn.failed = true;
                        continue;
                    }
                }
            }
            match conn.stream.try_write(&conn.backlog) {
                Ok(written) => {
                    conn.backlog.drain(..written);
                    self.stats.bytes_received += written as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("Write to {} failed: {}", conn.peer, e);
                    conn.failed = true;
                }
            }
        }
    }

    fn relay_to_remote(&mut self) {
        for conn in self.connections.values_mut() {
            // A full channel leaves the bytes in the socket, so the local
            // peer sees TCP backpressure
            if conn.failed || !conn.channel.is_writable() {
                continue;
            }
            match conn.stream.try_read(&mut self.buffer) {
                Ok(0) => {
                    debug!("{} closed its end", conn.peer);
                    conn.failed = true;
                }
                Ok(n) => match conn.channel.write(&self.buffer[..n]) {
                    Ok(written) if written == n => self.stats.bytes_sent += n as u64,
                    Ok(written) => {
                        warn!("Short channel write for {}: {} of {}", conn.peer, written, n);
                        conn.failed = true;
                    }
                    Err(e) => {
                        debug!("Channel write for {} failed: {}", conn.peer, e);
                        conn.failed = true;
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("Read from {} failed: {}", conn.peer, e);
                    conn.failed = true;
                }
            }
        }
    }

    fn accept(&mut self, transport: &mut dyn SshTransport) {
        let mut cx = Context::from_waker(noop_waker_ref());
        while let Poll::Ready(result) = self.listener.poll_accept(&mut cx) {
            match result {
                Ok((stream, peer)) => {
                    // Disable Nagle's algorithm for low-latency forwarding
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("Accepted connection from {} on {}", peer, self.bound_addr);
                    let open = transport.open_direct_tcpip(
                        &self.config.remote_host,
                        self.config.remote_port,
                        ORIGINATOR_HOST,
                        self.bound_addr.port(),
                    );
                    self.opening.push(OpeningConnection { stream, peer, open });
                }
                Err(e) => {
                    warn!("Accept error on {}: {}", self.bound_addr, e);
                    break;
                }
            }
        }
    }

    fn settle_opening(&mut self) {
        for mut pending in std::mem::take(&mut self.opening) {
            match pending.open.poll() {
                Poll::Pending => self.opening.push(pending),
                Poll::Ready(Ok(channel)) => {
                    let id = self.next_conn_id;
                    self.next_conn_id += 1;
                    self.stats.connection_count += 1;
                    self.connections.insert(
                        id,
                        ForwardConnection {
                            stream: pending.stream,
                            channel,
                            peer: pending.peer,
                            backlog: Vec::new(),
                            failed: false,
                        },
                    );
                }
                Poll::Ready(Err(e)) => {
                    // Dropping the stream closes the local socket
                    warn!(
                        "Forward {} -> {}:{} failed for {}: {}",
                        self.bound_addr, self.config.remote_host, self.config.remote_port,
                        pending.peer, e
                    );
                    self.stats.failed_opens += 1;
                }
            }
        }
    }

    /// Drop pairs whose channel closed or hit EOF (once their output reached
    /// the local socket) and pairs that failed. Returns how many went away.
    pub fn reap_closed(&mut self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, conn| {
            let finished = conn.failed
                || (conn.backlog.is_empty() && (!conn.channel.is_open() || conn.channel.is_eof()));
            if finished {
                debug!("Releasing forwarded connection from {}", conn.peer);
                conn.channel.close();
            }
            !finished
        });
        before - self.connections.len()
    }

    /// Close every relayed connection and stop accepting.
    pub fn close(&mut self) {
        for (_, mut conn) in self.connections.drain() {
            conn.channel.close();
        }
        self.opening.clear();
        info!(
            "Stopped local port forward {} -> {}:{}",
            self.bound_addr, self.config.remote_host, self.config.remote_port
        );
    }
}

fn bind_error(local: &str, e: std::io::Error) -> SshError {
    match e.kind() {
        ErrorKind::AddrInUse => SshError::Transport(format!(
            "Port already in use: {}. Another application may be using this port.",
            local
        )),
        ErrorKind::PermissionDenied => SshError::Transport(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local
        )),
        ErrorKind::AddrNotAvailable => SshError::Transport(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local
        )),
        _ => SshError::Transport(format!("Failed to bind to {}: {}", local, e)),
    }
}
