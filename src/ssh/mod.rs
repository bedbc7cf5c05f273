//! SSH module - handles SSH connections and sessions
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Public key authentication with pinned (or first-use) host keys
//! - ProxyJump (jump host) chains built from server profiles
//! - A non-blocking transport seam so the poll loop never awaits the network

pub mod authenticator;
mod channel;
pub mod client;
mod config;
mod error;
pub mod fingerprint;
mod handle_owner;
mod proxy;
pub mod transport;

pub use authenticator::{
    ConnectAttempt, ConnectRequest, Established, FingerprintCallback, ProgressLogger,
};
pub use client::{ClientHandler, RusshConnector};
pub use config::{expand_tilde, EngineConfig, Identity};
pub use error::SshError;
pub use fingerprint::HostKeyVerification;
pub use handle_owner::{spawn_handle_owner_task, HandleController};
pub use proxy::{ChainConnection, HostKeyCallback, ProxyChain, ProxyHop};
