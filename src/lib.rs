//! sshmux - a non-blocking SSH session engine
//!
//! Interactive terminals, remote commands and local port forwards over
//! public-key authenticated sessions, optionally reached through a chain of
//! jump hosts. One worker task owns every session and drives it from a
//! periodic poll loop; callers talk to it through [`SshEngine`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod engine;
pub mod forwarding;
pub mod session;
pub mod ssh;

pub use config::{IdentityProfile, ProfileBook, ProfileSource, ServerProfile};
pub use engine::SshEngine;
pub use forwarding::{LocalForward, PortForwardListener};
pub use session::{
    ChannelId, ChannelKind, DiscoveredPort, InputWriter, OutputReader, PortWatcher, SessionId,
    SessionInfo, StreamHandles,
};
pub use ssh::{
    ChainConnection, ConnectRequest, EngineConfig, Identity, ProxyChain, ProxyHop, SshError,
};

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` filter. Calling this more than
/// once, or after another subscriber was installed, does nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
