//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the russh `Handle`.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. The poll loop talks to it
//! through a `HandleController`, which queues commands over an mpsc channel
//! and hands back a [`Pending`] for each reply. The worker never awaits the
//! handle directly.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Holding locks across `.await`
//! - Concurrent Handle access from several channels of one session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::channel::RusshChannel;
use super::client::ClientHandler;
use super::error::SshError;
use super::transport::{ChannelIo, Pending};

/// How often the owner checks whether the underlying connection died.
const LIVENESS_CHECK: Duration = Duration::from_millis(500);

type Reply<T> = oneshot::Sender<Result<T, SshError>>;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Probe which RSA signature hash the server accepts for `username`
    OfferPublicKey {
        username: String,
        reply_tx: Reply<bool>,
    },

    /// Public key authentication with the probed hash
    Authenticate {
        username: String,
        key: Arc<PrivateKey>,
        reply_tx: Reply<bool>,
    },

    /// Open a session channel (for PTY/shell or exec)
    ChannelOpenSession { reply_tx: Reply<Box<dyn ChannelIo>> },

    /// Open a direct-tcpip channel (for local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: Reply<Box<dyn ChannelIo>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::UnboundedSender<HandleCommand>,
    alive: Arc<AtomicBool>,
}

impl HandleController {
    /// A dropped owner task resolves the pending reply to `Disconnected`.
    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> HandleCommand) -> Pending<T> {
        let (reply_tx, pending) = Pending::channel();
        let _ = self.cmd_tx.send(build(reply_tx));
        pending
    }

    pub fn offer_public_key(&self, username: &str) -> Pending<bool> {
        let username = username.to_string();
        self.request(|reply_tx| HandleCommand::OfferPublicKey { username, reply_tx })
    }

    pub fn authenticate(&self, username: &str, key: Arc<PrivateKey>) -> Pending<bool> {
        let username = username.to_string();
        self.request(|reply_tx| HandleCommand::Authenticate {
            username,
            key,
            reply_tx,
        })
    }

    /// Open a session channel (for PTY/shell)
    pub fn open_session_channel(&self) -> Pending<Box<dyn ChannelIo>> {
        self.request(|reply_tx| HandleCommand::ChannelOpenSession { reply_tx })
    }

    /// Open a direct-tcpip channel (for local forward)
    pub fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Pending<Box<dyn ChannelIo>> {
        let host = host.to_string();
        let originator_host = originator_host.to_string();
        self.request(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        })
    }

    /// Disconnect the SSH connection
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect);
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, target: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<HandleCommand>();
    let alive = Arc::new(AtomicBool::new(true));
    let alive_flag = alive.clone();

    tokio::spawn(async move {
        let mut handle = handle; // Move into task, becomes sole owner
        let mut liveness = tokio::time::interval(LIVENESS_CHECK);
        // Set by the offer, consumed by authenticate
        let mut rsa_hash = None;

        info!("Handle owner task started for {}", target);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for {}", target);
                        break;
                    };
                    match cmd {
                        // No unsigned key query in russh; pick the hash
                        // and leave acceptance to the signed attempt
                        HandleCommand::OfferPublicKey { username, reply_tx } => {
                            let result = match handle.best_supported_rsa_hash().await {
                                Ok(hash) => {
                                    rsa_hash = hash.flatten();
                                    debug!("Offering public key for {} on {}", username, target);
                                    Ok(true)
                                }
                                Err(e) => Err(SshError::Auth(e.to_string())),
                            };
                            let _ = reply_tx.send(result);
                        }

                        HandleCommand::Authenticate { username, key, reply_tx } => {
                            let result = handle
                                .authenticate_publickey(
                                    &username,
                                    PrivateKeyWithHashAlg::new(key, rsa_hash),
                                )
                                .await
                                .map(|auth| auth.success())
                                .map_err(|e| SshError::Auth(e.to_string()));
                            let _ = reply_tx.send(result);
                        }

                        HandleCommand::ChannelOpenSession { reply_tx } => {
                            let result = handle
                                .channel_open_session()
                                .await
                                .map(|channel| Box::new(RusshChannel::spawn(channel)) as Box<dyn ChannelIo>)
                                .map_err(|e| SshError::Channel(e.to_string()));
                            if reply_tx.send(result).is_err() {
                                // Channel will be dropped, the server closes it
                                warn!("Caller dropped before receiving channel_open_session result");
                            }
                        }

                        HandleCommand::ChannelOpenDirectTcpip {
                            host,
                            port,
                            originator_host,
                            originator_port,
                            reply_tx,
                        } => {
                            let result = handle
                                .channel_open_direct_tcpip(
                                    &host,
                                    port,
                                    &originator_host,
                                    originator_port,
                                )
                                .await
                                .map(|channel| Box::new(RusshChannel::spawn(channel)) as Box<dyn ChannelIo>)
                                .map_err(|e| SshError::Channel(e.to_string()));
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        }

                        HandleCommand::Disconnect => {
                            info!("Disconnect requested for {}", target);
                            break;
                        }
                    }
                }
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("Connection to {} lost", target);
                        break;
                    }
                }
            }
        }

        // === Cleanup phase ===
        alive_flag.store(false, Ordering::Release);

        // Dropping the queued replies resolves each caller to Disconnected
        cmd_rx.close();
        while cmd_rx.try_recv().is_ok() {}

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", target);
    });

    HandleController { cmd_tx, alive }
}
