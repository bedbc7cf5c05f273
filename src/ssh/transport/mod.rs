//! Transport seam
//!
//! The poll loop drives every SSH call from a single worker and never
//! awaits. Calls that need a network round trip return a [`Pending`]; the
//! worker polls it once per tick and `Poll::Pending` is the would-block
//! outcome, so the same step is retried on the next tick.
//!
//! Three traits separate the engine from the protocol library:
//! - [`Connector`] opens a handshaked transport to `host:port`
//! - [`SshTransport`] is one authenticated (or authenticating) connection
//! - [`ChannelIo`] is one open channel on that connection
//!
//! The russh implementation lives in `ssh::client`; an in-memory one for
//! tests lives in `mock`.

use std::sync::Arc;
use std::task::Poll;

use russh::keys::{PrivateKey, PublicKey};
use russh::Sig;
use tokio::sync::oneshot;

use super::error::SshError;

#[cfg(test)]
pub mod mock;

enum PendingState<T> {
    Waiting(oneshot::Receiver<Result<T, SshError>>),
    Queued {
        polls_left: u32,
        result: Option<Result<T, SshError>>,
    },
}

/// Result of a transport call that may not have completed yet.
pub struct Pending<T> {
    state: PendingState<T>,
}

impl<T> Pending<T> {
    /// A pending result fed by a background task through the returned sender.
    ///
    /// A dropped sender resolves to [`SshError::Disconnected`].
    pub fn channel() -> (oneshot::Sender<Result<T, SshError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: PendingState::Waiting(rx),
            },
        )
    }

    /// An already-completed call.
    pub fn ready(result: Result<T, SshError>) -> Self {
        Self::after_polls(0, result)
    }

    /// A call that reports would-block `polls` times before completing.
    pub fn after_polls(polls: u32, result: Result<T, SshError>) -> Self {
        Self {
            state: PendingState::Queued {
                polls_left: polls,
                result: Some(result),
            },
        }
    }

    /// Non-blocking check. Must not be called again after `Poll::Ready`.
    pub fn poll(&mut self) -> Poll<Result<T, SshError>> {
        match &mut self.state {
            PendingState::Waiting(rx) => match rx.try_recv() {
                Ok(result) => Poll::Ready(result),
                Err(oneshot::error::TryRecvError::Empty) => Poll::Pending,
                Err(oneshot::error::TryRecvError::Closed) => {
                    Poll::Ready(Err(SshError::Disconnected))
                }
            },
            PendingState::Queued { polls_left, result } => {
                if *polls_left > 0 {
                    *polls_left -= 1;
                    return Poll::Pending;
                }
                Poll::Ready(result.take().unwrap_or(Err(SshError::Disconnected)))
            }
        }
    }
}

/// Channel data stream. Extended data type 1 is stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Stdout,
    Stderr,
}

/// Requests issued on a session channel while it is being opened or resized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    Pty { term: String, cols: u32, rows: u32 },
    WindowChange { cols: u32, rows: u32 },
    Shell,
    Exec(Vec<u8>),
}

impl ChannelRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec(_) => "exec",
        }
    }
}

/// Opens transports. Implementations spawn whatever I/O they need and hand
/// the worker a [`Pending`] handle.
pub trait Connector: Send + Sync {
    fn open(&self, host: &str, port: u16) -> Pending<Box<dyn SshTransport>>;
}

/// One SSH connection past the key exchange.
pub trait SshTransport: Send {
    /// Raw public key blob the server presented during the handshake.
    fn server_key(&self) -> Result<Vec<u8>, SshError>;

    /// Offer a public key for `username` before signing with it. Transports
    /// that cannot ask without signing answer `true` and let
    /// [`authenticate`](Self::authenticate) refuse.
    fn offer_public_key(&mut self, username: &str, key: &PublicKey) -> Pending<bool>;

    /// Sign the authentication request. `Ok(false)` means the server refused.
    fn authenticate(&mut self, username: &str, key: Arc<PrivateKey>) -> Pending<bool>;

    fn open_session(&mut self) -> Pending<Box<dyn ChannelIo>>;

    fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Pending<Box<dyn ChannelIo>>;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);
}

/// One open channel. Reads and writes never block.
pub trait ChannelIo: Send {
    fn request(&mut self, request: ChannelRequest) -> Pending<()>;

    /// Copy buffered bytes of `stream` into `buf`. `Ok(0)` means nothing is
    /// buffered right now, not end of stream.
    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> Result<usize, SshError>;

    /// True when stdout has data, or the channel hit EOF or closed.
    fn poll_readable(&mut self) -> bool;

    /// Room to queue another write. While false, callers hold their input
    /// back rather than buffering it.
    fn is_writable(&self) -> bool;

    /// Queue bytes for the remote side. A short count is a failed write.
    fn write(&mut self, data: &[u8]) -> Result<usize, SshError>;

    fn send_eof(&mut self) -> Result<(), SshError>;

    fn send_signal(&mut self, signal: Sig) -> Result<(), SshError>;

    fn is_open(&self) -> bool;

    /// Remote sent EOF and everything before it has been read.
    fn is_eof(&self) -> bool;

    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_reports_would_block_until_ready() {
        let mut pending = Pending::after_polls(2, Ok(7u32));
        assert!(pending.poll().is_pending());
        assert!(pending.poll().is_pending());
        assert!(matches!(pending.poll(), Poll::Ready(Ok(7))));
    }

    #[test]
    fn test_pending_channel_dropped_sender_is_disconnect() {
        let (tx, mut pending) = Pending::<()>::channel();
        assert!(pending.poll().is_pending());
        drop(tx);
        assert!(matches!(
            pending.poll(),
            Poll::Ready(Err(SshError::Disconnected))
        ));
    }

    #[test]
    fn test_pending_channel_delivers_result() {
        let (tx, mut pending) = Pending::channel();
        tx.send(Ok("done")).unwrap();
        assert!(matches!(pending.poll(), Poll::Ready(Ok("done"))));
    }

    #[test]
    fn test_request_names() {
        assert_eq!(ChannelRequest::Shell.name(), "shell");
        assert_eq!(ChannelRequest::Exec(b"ls".to_vec()).name(), "exec");
        assert_eq!(
            ChannelRequest::Pty {
                term: "xterm".into(),
                cols: 80,
                rows: 24
            }
            .name(),
            "pty-req"
        );
    }
}
