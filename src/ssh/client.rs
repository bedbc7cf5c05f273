//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;

use parking_lot::Mutex;
use russh::client;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use tracing::{debug, info};

use super::config::EngineConfig;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::transport::{ChannelIo, Connector, Pending, SshTransport};

/// Opens russh connections on the tokio runtime.
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: Arc::new(config.client_config()),
        }
    }
}

impl Connector for RusshConnector {
    fn open(&self, host: &str, port: u16) -> Pending<Box<dyn SshTransport>> {
        let (reply_tx, pending) = Pending::channel();
        let config = self.config.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let result = connect_transport(config, host, port).await;
            // An abandoned attempt drops the transport here, which stops its owner task
            let _ = reply_tx.send(result);
        });
        pending
    }
}

async fn connect_transport(
    config: Arc<client::Config>,
    host: String,
    port: u16,
) -> Result<Box<dyn SshTransport>, SshError> {
    let addr = format!("{}:{}", host, port);

    info!("Connecting to SSH server at {}", addr);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SshError::Transport(format!("Failed to resolve address: {}", e)))?
        .next()
        .ok_or_else(|| SshError::Transport(format!("No address found for {}", addr)))?;

    let server_key = Arc::new(Mutex::new(None));
    let handler = ClientHandler::new(host.clone(), port, server_key.clone());

    let handle = client::connect(config, socket_addr, handler)
        .await
        .map_err(|e| SshError::Transport(e.to_string()))?;

    debug!("SSH handshake completed with {}", addr);

    let key = server_key
        .lock()
        .take()
        .ok_or_else(|| SshError::Transport(format!("{} presented no host key", addr)))?;

    Ok(Box::new(RusshTransport {
        controller: spawn_handle_owner_task(handle, addr),
        server_key: key.public_key_bytes(),
    }))
}

/// Client handler for russh callbacks
///
/// Records the server's host key. Pinning is checked by the authenticator
/// after the handshake so that mismatches surface as a typed error instead
/// of a dropped connection.
pub struct ClientHandler {
    host: String,
    port: u16,
    server_key: Arc<Mutex<Option<PublicKey>>>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, server_key: Arc<Mutex<Option<PublicKey>>>) -> Self {
        Self {
            host,
            port,
            server_key,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Server key for {}:{} is {}",
            self.host,
            self.port,
            server_public_key.algorithm().as_str()
        );
        *self.server_key.lock() = Some(server_public_key.clone());
        Ok(true)
    }
}

/// One russh connection, driven through its handle owner task
pub struct RusshTransport {
    controller: HandleController,
    server_key: Vec<u8>,
}

impl SshTransport for RusshTransport {
    fn server_key(&self) -> Result<Vec<u8>, SshError> {
        Ok(self.server_key.clone())
    }

    /// russh has no unsigned `publickey` query, so this step only settles
    /// the RSA hash to sign with and always answers `true`. A key the
    /// server will not take is refused by [`authenticate`](Self::authenticate).
    fn offer_public_key(&mut self, username: &str, _key: &PublicKey) -> Pending<bool> {
        self.controller.offer_public_key(username)
    }

    fn authenticate(&mut self, username: &str, key: Arc<PrivateKey>) -> Pending<bool> {
        self.controller.authenticate(username, key)
    }

    fn open_session(&mut self) -> Pending<Box<dyn ChannelIo>> {
        self.controller.open_session_channel()
    }

    fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Pending<Box<dyn ChannelIo>> {
        self.controller.open_direct_tcpip(
            host,
            u32::from(port),
            originator_host,
            u32::from(originator_port),
        )
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    fn disconnect(&mut self) {
        self.controller.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;

    #[tokio::test]
    async fn test_unresolvable_host_is_transport_error() {
        let connector = RusshConnector::new(&EngineConfig::default());
        let mut pending = connector.open("host.invalid", 22);
        let result = loop {
            if let Poll::Ready(result) = pending.poll() {
                break result;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert!(matches!(result, Err(SshError::Transport(_))));
    }

    #[tokio::test]
    async fn test_refused_port_is_transport_error() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = RusshConnector::new(&EngineConfig::default());
        let mut pending = connector.open("127.0.0.1", port);
        let result = loop {
            if let Poll::Ready(result) = pending.poll() {
                break result;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert!(matches!(result, Err(SshError::Transport(_))));
    }
}
