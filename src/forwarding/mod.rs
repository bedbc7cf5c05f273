//! Port Forwarding Module
//!
//! Local port forwarding over a session's direct-tcpip channels, serviced
//! by the poll loop like every other channel. Also carries proxy-chain hops
//! (a jump host's forward is what the next hop connects to).

mod local;

pub use local::{ForwardStats, LocalForward, PortForwardListener};
