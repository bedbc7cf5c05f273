//! Session authenticator
//!
//! Drives one connection attempt through
//! open transport -> verify host key -> import key -> offer -> authenticate,
//! one non-blocking step at a time. The poll loop calls [`ConnectAttempt::poll`]
//! every tick; a step that would block is simply retried on the next tick.
//!
//! Any failure after the transport exists tears the transport down before
//! the error is returned, so a failed attempt never leaves a half-open
//! connection behind.

use std::sync::Arc;
use std::task::Poll;

use russh::keys::PrivateKey;
use tracing::{debug, info, warn};

use super::config::Identity;
use super::error::SshError;
use super::fingerprint::{self, HostKeyVerification};
use super::transport::{Connector, Pending, SshTransport};

/// Receives human-readable progress lines for one session.
pub type ProgressLogger = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives the verified (or first-seen) host key digest.
pub type FingerprintCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Everything needed to establish one authenticated session
#[derive(Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub identity: Identity,
    /// Pinned SHA-256 digest of the server key; empty means trust on first use
    pub pinned_fingerprint: Vec<u8>,
    pub logger: Option<ProgressLogger>,
    pub on_fingerprint: Option<FingerprintCallback>,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16, identity: Identity) -> Self {
        Self {
            host: host.into(),
            port,
            identity,
            pinned_fingerprint: Vec::new(),
            logger: None,
            on_fingerprint: None,
        }
    }

    pub fn pinned(mut self, fingerprint: Vec<u8>) -> Self {
        self.pinned_fingerprint = fingerprint;
        self
    }

    pub fn with_logger(mut self, logger: ProgressLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn on_fingerprint(mut self, callback: FingerprintCallback) -> Self {
        self.on_fingerprint = Some(callback);
        self
    }
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("identity", &self.identity)
            .field("pinned", &fingerprint::to_hex(&self.pinned_fingerprint))
            .finish()
    }
}

/// An authenticated transport ready to be registered
pub struct Established {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub fingerprint: Vec<u8>,
    pub transport: Box<dyn SshTransport>,
    pub logger: Option<ProgressLogger>,
}

enum Step {
    OpenTransport(Pending<Box<dyn SshTransport>>),
    VerifyHostKey,
    ImportKey,
    Offer {
        key: Arc<PrivateKey>,
        pending: Pending<bool>,
    },
    Authenticate(Pending<bool>),
    Finished,
}

pub struct ConnectAttempt {
    request: ConnectRequest,
    transport: Option<Box<dyn SshTransport>>,
    fingerprint: Vec<u8>,
    step: Step,
}

impl ConnectAttempt {
    pub fn start(connector: &dyn Connector, request: ConnectRequest) -> Self {
        debug!("Connecting to {}:{}", request.host, request.port);
        let pending = connector.open(&request.host, request.port);
        Self {
            request,
            transport: None,
            fingerprint: Vec::new(),
            step: Step::OpenTransport(pending),
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.request.host, self.request.port)
    }

    /// Advance as far as possible without blocking.
    pub fn poll(&mut self) -> Poll<Result<Established, SshError>> {
        loop {
            let step = std::mem::replace(&mut self.step, Step::Finished);
            self.step = match step {
                Step::OpenTransport(mut pending) => match pending.poll() {
                    Poll::Pending => {
                        self.step = Step::OpenTransport(pending);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(transport)) => {
                        self.transport = Some(transport);
                        Step::VerifyHostKey
                    }
                    Poll::Ready(Err(e)) => {
                        self.log(&format!("ssh_connect() failed {}", e));
                        return self.fail(e);
                    }
                },

                Step::VerifyHostKey => match self.verify_host_key() {
                    Ok(()) => Step::ImportKey,
                    Err(e) => return self.fail(e),
                },

                Step::ImportKey => match self.request.identity.import_private_key() {
                    Ok(key) => {
                        let public = match Identity::derive_public_key(&key) {
                            Ok(public) => public,
                            Err(e) => {
                                self.log("public key cannot convert");
                                return self.fail(e);
                            }
                        };
                        let Some(transport) = self.transport.as_mut() else {
                            return self.fail(SshError::Disconnected);
                        };
                        let pending =
                            transport.offer_public_key(&self.request.identity.username, &public);
                        Step::Offer {
                            key: Arc::new(key),
                            pending,
                        }
                    }
                    Err(e) => {
                        self.log("private key cannot load");
                        return self.fail(e);
                    }
                },

                Step::Offer { key, mut pending } => match pending.poll() {
                    Poll::Pending => {
                        self.step = Step::Offer { key, pending };
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(true)) => {
                        let Some(transport) = self.transport.as_mut() else {
                            return self.fail(SshError::Disconnected);
                        };
                        Step::Authenticate(
                            transport.authenticate(&self.request.identity.username, key),
                        )
                    }
                    Poll::Ready(Ok(false)) => {
                        self.log("auth error (public key offer rejected)");
                        return self.fail(SshError::Auth("public key offer rejected".into()));
                    }
                    Poll::Ready(Err(e)) => {
                        self.log(&format!("auth error (public key offer) {}", e));
                        return self.fail(SshError::Auth(e.to_string()));
                    }
                },

                Step::Authenticate(mut pending) => match pending.poll() {
                    Poll::Pending => {
                        self.step = Step::Authenticate(pending);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(true)) => return self.finish(),
                    Poll::Ready(Ok(false)) => {
                        self.log("auth error (public key) rejected");
                        return self.fail(SshError::Auth(format!(
                            "public key rejected for {}",
                            self.request.identity.username
                        )));
                    }
                    Poll::Ready(Err(e)) => {
                        self.log(&format!("auth error (public key) {}", e));
                        return self.fail(SshError::Auth(e.to_string()));
                    }
                },

                Step::Finished => {
                    return Poll::Ready(Err(SshError::Transport(
                        "connect attempt already finished".into(),
                    )))
                }
            };
        }
    }

    /// Give up on the attempt, disconnecting whatever was opened.
    pub fn abort(&mut self) {
        self.step = Step::Finished;
        if let Some(mut transport) = self.transport.take() {
            info!("Abandoned connect to {}, disconnecting", self.target());
            transport.disconnect();
        }
    }

    fn verify_host_key(&mut self) -> Result<(), SshError> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(SshError::Disconnected);
        };
        let digest = fingerprint::fingerprint(&transport.server_key()?);
        self.log(&format!("server key : {}", fingerprint::to_hex(&digest)));

        match fingerprint::verify(&self.request.pinned_fingerprint, &digest) {
            HostKeyVerification::Verified => {
                debug!(
                    "Host key verified for {}: {}",
                    self.target(),
                    fingerprint::to_openssh(&digest)
                );
            }
            HostKeyVerification::FirstUse => {
                info!(
                    "Trusting {} on first use: {}",
                    self.target(),
                    fingerprint::to_openssh(&digest)
                );
            }
            HostKeyVerification::Mismatch { expected, actual } => {
                self.log("server key not match!");
                warn!(
                    "HOST KEY MISMATCH for {}: expected {}, got {}",
                    self.target(),
                    expected,
                    actual
                );
                return Err(SshError::HostKeyMismatch { expected, actual });
            }
        }

        if let Some(callback) = &self.request.on_fingerprint {
            callback(&digest);
        }
        self.fingerprint = digest;
        Ok(())
    }

    fn finish(&mut self) -> Poll<Result<Established, SshError>> {
        let Some(transport) = self.transport.take() else {
            return Poll::Ready(Err(SshError::Disconnected));
        };
        self.log("Connect successfully");
        info!(
            "Authenticated {}@{}",
            self.request.identity.username,
            self.target()
        );
        Poll::Ready(Ok(Established {
            host: self.request.host.clone(),
            port: self.request.port,
            username: self.request.identity.username.clone(),
            fingerprint: std::mem::take(&mut self.fingerprint),
            transport,
            logger: self.request.logger.clone(),
        }))
    }

    fn fail(&mut self, err: SshError) -> Poll<Result<Established, SshError>> {
        warn!("Connect to {} failed: {}", self.target(), err);
        self.step = Step::Finished;
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        Poll::Ready(Err(err))
    }

    fn log(&self, line: &str) {
        if let Some(logger) = &self.request.logger {
            logger(line);
        }
    }
}
