//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    /// Socket, DNS or handshake failure while opening a transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server presented a key that does not match the pinned fingerprint
    #[error("Host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    /// Malformed or undecryptable private key material
    #[error("Key import failed: {0}")]
    KeyImport(String),

    /// Public key offer or authentication rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A channel open/request step failed, or a protocol-level channel failure
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Server/identity records could not be resolved into a connection chain
    #[error("Profile error: {0}")]
    Profile(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Errors raised while establishing a session. In a proxy chain any of
    /// these aborts the whole chain.
    pub fn is_fatal_for_chain(&self) -> bool {
        matches!(
            self,
            SshError::Transport(_)
                | SshError::HostKeyMismatch { .. }
                | SshError::KeyImport(_)
                | SshError::Auth(_)
                | SshError::Timeout(_)
                | SshError::Disconnected
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Transport(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyImport(err.to_string())
    }
}
