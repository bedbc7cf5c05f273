//! Session Types and Data Structures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one registered session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a terminal or command within its session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Terminal,
    Command,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Terminal => write!(f, "terminal"),
            ChannelKind::Command => write!(f, "command"),
        }
    }
}

/// Protocol steps of opening a channel, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenStep {
    OpenSession,
    RequestPty,
    SetSize,
    RequestShell,
    RequestExec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum ChannelState {
    Opening(OpenStep),
    Open,
    /// Input finished and EOF sent; output is drained until the remote closes
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardInfo {
    pub local_addr: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub connections: usize,
}

/// Snapshot of a session for callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Hex host key digest, `aa:bb:...`
    pub fingerprint: String,
    /// RFC 3339
    pub connected_at: String,
    pub terminals: Vec<ChannelId>,
    pub commands: Vec<ChannelId>,
    pub forwards: Vec<ForwardInfo>,
}
