//! SSH Engine
//!
//! [`SshEngine`] is the cloneable handle applications hold. Every operation
//! is queued to the [`PollLoop`](poll_loop::PollLoop) worker and answered
//! through a oneshot reply, so callers never touch a socket. The one
//! exception is [`SshEngine::check_session`], which reads the registry's
//! shared session table directly.
//!
//! Waiting is done the way the terminal front end does it: poll a liveness
//! predicate every `liveness_poll_ms` until it holds or the timeout passes.

mod poll_loop;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::forwarding::LocalForward;
use crate::session::{
    ChannelId, ChannelKind, ChannelStreams, DiscoveredPort, InputWriter, SessionId, SessionInfo,
    SessionTable, StreamHandles,
};
use crate::ssh::authenticator::ConnectRequest;
use crate::ssh::client::RusshConnector;
use crate::ssh::transport::Connector;
use crate::ssh::{EngineConfig, SshError};

use poll_loop::{EngineCommand, PollLoop};

/// Fresh random ports tried before a local listener bind is given up
const BIND_ATTEMPTS: usize = 5;

/// Handle to a running poll loop. Dropping every clone stops the loop and
/// disconnects all sessions.
#[derive(Clone)]
pub struct SshEngine {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    sessions: SessionTable,
    config: Arc<EngineConfig>,
}

impl SshEngine {
    /// Spawn the poll loop with the russh connector. Must be called inside a
    /// tokio runtime.
    pub fn start(config: EngineConfig) -> Self {
        let connector = Arc::new(RusshConnector::new(&config));
        Self::with_connector(config, connector)
    }

    /// Spawn the poll loop with any transport connector.
    pub fn with_connector(config: EngineConfig, connector: Arc<dyn Connector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let poll_loop = PollLoop::new(config.clone(), connector, cmd_rx);
        let sessions = poll_loop.sessions();
        tokio::spawn(poll_loop.run());
        Self {
            cmd_tx,
            sessions,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }

    /// Open, verify and authenticate a session. Dropping the returned future
    /// abandons the attempt and tears its transport down.
    pub async fn connect(&self, request: ConnectRequest) -> Result<SessionId, SshError> {
        self.call(|reply_tx| EngineCommand::Connect { request, reply_tx })
            .await?
    }

    /// Close every channel and forward of the session, then its transport.
    /// False when the session was not registered.
    pub async fn disconnect(&self, session: SessionId) -> Result<bool, SshError> {
        self.call(|reply_tx| EngineCommand::Disconnect { session, reply_tx })
            .await
    }

    pub fn check_session(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registered sessions, oldest first
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>, SshError> {
        self.call(|reply_tx| EngineCommand::ListSessions { reply_tx })
            .await
    }

    pub async fn session_info(&self, session: SessionId) -> Result<SessionInfo, SshError> {
        self.call(|reply_tx| EngineCommand::SessionInfo { session, reply_tx })
            .await?
    }

    /// Start opening a shell with a PTY. The id is issued right away; use
    /// [`wait_terminal`](Self::wait_terminal) to learn when it is usable.
    pub async fn create_terminal(
        &self,
        session: SessionId,
        streams: ChannelStreams,
    ) -> Result<ChannelId, SshError> {
        self.call(|reply_tx| EngineCommand::CreateTerminal {
            session,
            streams,
            reply_tx,
        })
        .await?
    }

    /// [`create_terminal`](Self::create_terminal) wired to bounded queues.
    pub async fn open_terminal(
        &self,
        session: SessionId,
    ) -> Result<(ChannelId, StreamHandles), SshError> {
        let (streams, handles) = ChannelStreams::queued(self.config.stream_queue_depth);
        let id = self.create_terminal(session, streams).await?;
        Ok((id, handles))
    }

    pub async fn run_command(
        &self,
        session: SessionId,
        command: impl Into<Vec<u8>>,
        streams: ChannelStreams,
    ) -> Result<ChannelId, SshError> {
        let command = command.into();
        self.call(|reply_tx| EngineCommand::RunCommand {
            session,
            command,
            streams,
            reply_tx,
        })
        .await?
    }

    /// [`run_command`](Self::run_command) wired to bounded queues.
    pub async fn exec(
        &self,
        session: SessionId,
        command: impl Into<Vec<u8>>,
    ) -> Result<(ChannelId, StreamHandles), SshError> {
        let (streams, handles) = ChannelStreams::queued(self.config.stream_queue_depth);
        let id = self.run_command(session, command, streams).await?;
        Ok((id, handles))
    }

    /// A failed resize closes the terminal.
    pub async fn set_terminal_size(
        &self,
        session: SessionId,
        terminal: ChannelId,
        cols: u32,
        rows: u32,
    ) -> Result<(), SshError> {
        self.call(|reply_tx| EngineCommand::SetTerminalSize {
            session,
            channel: terminal,
            cols,
            rows,
            reply_tx,
        })
        .await?
    }

    async fn check_channel(&self, session: SessionId, kind: ChannelKind, channel: ChannelId) -> bool {
        self.call(|reply_tx| EngineCommand::CheckChannel {
            session,
            kind,
            channel,
            reply_tx,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn check_terminal(&self, session: SessionId, terminal: ChannelId) -> bool {
        self.check_channel(session, ChannelKind::Terminal, terminal)
            .await
    }

    pub async fn check_command(&self, session: SessionId, command: ChannelId) -> bool {
        self.check_channel(session, ChannelKind::Command, command)
            .await
    }

    async fn close_channel(&self, session: SessionId, kind: ChannelKind, channel: ChannelId) -> bool {
        self.call(|reply_tx| EngineCommand::CloseChannel {
            session,
            kind,
            channel,
            reply_tx,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn close_terminal(&self, session: SessionId, terminal: ChannelId) -> bool {
        self.close_channel(session, ChannelKind::Terminal, terminal)
            .await
    }

    pub async fn close_command(&self, session: SessionId, command: ChannelId) -> bool {
        self.close_channel(session, ChannelKind::Command, command)
            .await
    }

    /// Listen on `localhost:local_port` and forward each connection to
    /// `remote_host:remote_port` through the session. False when the port
    /// cannot be bound; there is no retry.
    pub async fn local_port_forward(
        &self,
        session: SessionId,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> bool {
        self.add_local_forward(session, LocalForward::new(local_port, remote_host, remote_port))
            .await
            .is_ok()
    }

    pub async fn add_local_forward(
        &self,
        session: SessionId,
        forward: LocalForward,
    ) -> Result<SocketAddr, SshError> {
        self.call(|reply_tx| EngineCommand::LocalForward {
            session,
            forward,
            reply_tx,
        })
        .await?
    }

    pub fn pick_ephemeral_port(&self) -> u16 {
        rand::thread_rng().gen_range(self.config.ephemeral_ports())
    }

    /// Forward a random ephemeral local port to `remote_host:remote_port`,
    /// trying a few ports if one is taken.
    pub async fn forward_on_random_port(
        &self,
        session: SessionId,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<SocketAddr, SshError> {
        let mut last_err = None;
        for _ in 0..BIND_ATTEMPTS {
            let port = self.pick_ephemeral_port();
            match self
                .add_local_forward(session, LocalForward::new(port, remote_host, remote_port))
                .await
            {
                Ok(addr) => return Ok(addr),
                Err(SshError::Transport(msg)) => {
                    debug!("Local port {} unavailable: {}", port, msg);
                    last_err = Some(SshError::Transport(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| SshError::Transport("no free local port".into())))
    }

    /// Forward a port found in command output and return the local URL.
    pub async fn forward_discovered_port(
        &self,
        session: SessionId,
        discovered: &DiscoveredPort,
    ) -> Result<String, SshError> {
        let addr = self
            .forward_on_random_port(session, "localhost", discovered.port)
            .await?;
        let url = discovered.url(addr.port());
        info!("Remote port {} available at {}", discovered.port, url);
        Ok(url)
    }

    /// Poll `ready` every liveness interval until it holds or `timeout`
    /// passes. Always checks at least once.
    async fn poll_until<F, Fut>(&self, timeout: Duration, mut ready: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if ready().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.liveness_poll().min(deadline - now)).await;
        }
    }

    pub async fn wait_session(&self, session: SessionId, timeout: Duration) -> Result<(), SshError> {
        if self
            .poll_until(timeout, || async move { self.check_session(session) })
            .await
        {
            Ok(())
        } else {
            Err(SshError::Timeout(format!("session {} not ready", session)))
        }
    }

    pub async fn wait_terminal(
        &self,
        session: SessionId,
        terminal: ChannelId,
        timeout: Duration,
    ) -> Result<(), SshError> {
        if self
            .poll_until(timeout, || self.check_terminal(session, terminal))
            .await
        {
            Ok(())
        } else {
            Err(SshError::Timeout(format!("terminal {} not ready", terminal)))
        }
    }

    pub async fn wait_command(
        &self,
        session: SessionId,
        command: ChannelId,
        timeout: Duration,
    ) -> Result<(), SshError> {
        if self
            .poll_until(timeout, || self.check_command(session, command))
            .await
        {
            Ok(())
        } else {
            Err(SshError::Timeout(format!("command {} not ready", command)))
        }
    }

    /// Cooperative break: send ETX and end input, give the remote side the
    /// break grace period to close the channel, then close it ourselves.
    pub async fn cancel_channel(
        &self,
        session: SessionId,
        kind: ChannelKind,
        channel: ChannelId,
        input: InputWriter,
    ) -> Result<(), SshError> {
        if let Err(e) = input.interrupt().await {
            debug!("Input of {} {} already closed: {}", kind, channel, e);
        }
        let ended = self
            .poll_until(self.config.break_grace(), || async move {
                !self.check_channel(session, kind, channel).await
            })
            .await;
        if !ended {
            info!("{} {} still open after break, closing", kind, channel);
        }
        self.close_channel(session, kind, channel).await;
        Ok(())
    }

    /// Disconnect every session (newest first) and stop the poll loop.
    pub async fn shutdown(&self) -> Result<(), SshError> {
        match self
            .call(|reply_tx| EngineCommand::Shutdown { reply_tx })
            .await
        {
            Ok(()) | Err(SshError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fingerprint;
    use crate::ssh::transport::mock::{MockConnector, MockEvent, MockScript, TEST_KEY};
    use crate::ssh::Identity;
    use parking_lot::Mutex;
    use tokio::net::TcpStream;

    fn test_config() -> EngineConfig {
        EngineConfig {
            liveness_poll_ms: 5,
            break_grace_secs: 0,
            ..Default::default()
        }
    }

    fn engine(script: MockScript) -> (MockConnector, SshEngine) {
        let connector = MockConnector::new(script);
        let engine = SshEngine::with_connector(test_config(), Arc::new(connector.clone()));
        (connector, engine)
    }

    fn request(host: &str) -> ConnectRequest {
        ConnectRequest::new(host, 22, Identity::new("ops", TEST_KEY, None))
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_trust_on_first_use_then_mismatch() {
        let (connector, engine) = engine(MockScript::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let first = engine
            .connect(request("alpha").on_fingerprint(Arc::new(move |fp: &[u8]| {
                sink.lock().push(fp.to_vec())
            })))
            .await
            .unwrap();
        let pinned = seen.lock()[0].clone();
        assert!(!pinned.is_empty());
        assert_eq!(pinned, fingerprint::fingerprint(&connector.host_key("alpha")));
        assert!(engine.check_session(first));

        connector
            .script()
            .host_keys
            .insert("alpha".into(), b"rotated-key".to_vec());
        let second = engine.connect(request("alpha").pinned(pinned)).await;

        assert!(matches!(second, Err(SshError::HostKeyMismatch { .. })));
        assert_eq!(engine.list_sessions().await.unwrap(), vec![first]);
        // The rejected transport was torn down
        assert_eq!(connector.disconnects().len(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_tears_transport_down() {
        let (connector, engine) = engine(MockScript {
            reject_auth: true,
            ..Default::default()
        });
        let result = engine.connect(request("alpha")).await;
        assert!(matches!(result, Err(SshError::Auth(_))));
        assert_eq!(connector.disconnects(), vec![("alpha".to_string(), 22)]);
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_log() {
        let (_connector, engine) = engine(MockScript::default());
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = lines.clone();
        engine
            .connect(request("alpha").with_logger(Arc::new(move |line: &str| {
                sink.lock().push(line.to_string())
            })))
            .await
            .unwrap();
        let lines = lines.lock();
        assert!(lines[0].starts_with("server key : "));
        assert_eq!(lines.last().map(String::as_str), Some("Connect successfully"));
    }

    #[tokio::test]
    async fn test_terminal_echo() {
        let (_connector, engine) = engine(MockScript {
            echo: true,
            latency: 2,
            ..Default::default()
        });
        let session = engine.connect(request("alpha")).await.unwrap();
        let (terminal, mut handles) = engine.open_terminal(session).await.unwrap();
        engine.wait_terminal(session, terminal, WAIT).await.unwrap();

        let payload = b"echo hello; exit\n";
        for chunk in payload.chunks(5) {
            handles.input.write(chunk.to_vec()).await.unwrap();
        }

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let chunk = tokio::time::timeout(WAIT, handles.stdout.recv_data())
                .await
                .expect("echo timed out")
                .expect("stdout closed");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_command_done_interrupts_then_closes() {
        let (connector, engine) = engine(MockScript::default());
        let session = engine.connect(request("alpha")).await.unwrap();
        let (command, handles) = engine.exec(session, "tail -f /var/log/syslog").await.unwrap();
        engine.wait_command(session, command, WAIT).await.unwrap();

        handles.input.finish();
        let channel = &connector.channels()[0];
        assert!(
            engine
                .poll_until(WAIT, || async move { channel.eof_sent() == 1 })
                .await
        );
        assert_eq!(channel.interrupts(), 2);
        // Still draining output until the remote closes
        assert!(engine.check_command(session, command).await);

        channel.remote_eof();
        channel.remote_close();
        let e = &engine;
        assert!(
            e.poll_until(WAIT, || async move { !e.check_command(session, command).await })
                .await
        );
        let info = engine.session_info(session).await.unwrap();
        assert!(info.commands.is_empty());
    }

    #[tokio::test]
    async fn test_failed_pty_leaves_no_terminal() {
        let mut script = MockScript::default();
        script.fail_requests.insert("pty-req");
        let (_connector, engine) = engine(script);
        let session = engine.connect(request("alpha")).await.unwrap();

        let terminal = engine
            .create_terminal(session, ChannelStreams::new())
            .await
            .unwrap();
        let waited = engine
            .wait_terminal(session, terminal, Duration::from_millis(50))
            .await;

        assert!(matches!(waited, Err(SshError::Timeout(_))));
        assert!(engine.session_info(session).await.unwrap().terminals.is_empty());
        assert!(!engine.close_terminal(session, terminal).await);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let (connector, engine) = engine(MockScript::default());
        let session = engine.connect(request("alpha")).await.unwrap();
        let (terminal, _t) = engine.open_terminal(session).await.unwrap();
        let (command, _c) = engine.exec(session, "top").await.unwrap();
        let addr = engine
            .add_local_forward(session, LocalForward::new(0, "web", 80).bind_on("127.0.0.1"))
            .await
            .unwrap();
        engine.wait_terminal(session, terminal, WAIT).await.unwrap();
        engine.wait_command(session, command, WAIT).await.unwrap();

        assert!(engine.disconnect(session).await.unwrap());

        assert!(!engine.check_session(session));
        assert!(!engine.check_terminal(session, terminal).await);
        assert!(!engine.check_command(session, command).await);
        assert!(matches!(
            engine.session_info(session).await,
            Err(SshError::SessionNotFound(_))
        ));
        assert!(connector.channels().iter().all(|c| c.closed_locally()));
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(!engine.disconnect(session).await.unwrap());
    }

    #[tokio::test]
    async fn test_resize() {
        let (connector, engine) = engine(MockScript::default());
        let session = engine.connect(request("alpha")).await.unwrap();
        let (terminal, _handles) = engine.open_terminal(session).await.unwrap();
        engine.wait_terminal(session, terminal, WAIT).await.unwrap();

        engine
            .set_terminal_size(session, terminal, 132, 43)
            .await
            .unwrap();
        let channel = &connector.channels()[0];
        assert!(
            engine
                .poll_until(WAIT, || async move {
                    channel.requests().last()
                        == Some(&crate::ssh::transport::ChannelRequest::WindowChange {
                            cols: 132,
                            rows: 43,
                        })
                })
                .await
        );
        assert!(engine
            .set_terminal_size(session, ChannelId(999), 1, 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_channel() {
        let (connector, engine) = engine(MockScript::default());
        let session = engine.connect(request("alpha")).await.unwrap();
        let (terminal, handles) = engine.open_terminal(session).await.unwrap();
        engine.wait_terminal(session, terminal, WAIT).await.unwrap();

        engine
            .cancel_channel(session, ChannelKind::Terminal, terminal, handles.input)
            .await
            .unwrap();

        let channel = connector.channels()[0].clone();
        assert!(channel.closed_locally());
        assert!(!engine.check_terminal(session, terminal).await);
    }

    #[tokio::test]
    async fn test_forward_discovered_port() {
        let (connector, engine) = engine(MockScript::default());
        let session = engine.connect(request("alpha")).await.unwrap();
        let discovered = DiscoveredPort {
            port: 8888,
            path: "?token=abc".into(),
        };

        let url = engine
            .forward_discovered_port(session, &discovered)
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:"));
        assert!(url.ends_with("/?token=abc"));
        let info = engine.session_info(session).await.unwrap();
        assert_eq!(info.forwards.len(), 1);
        assert_eq!(info.forwards[0].remote_port, 8888);
        let local_port: u16 = info.forwards[0]
            .local_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap();
        assert!(engine.config().ephemeral_ports().contains(&local_port));
        assert!(connector.events().iter().all(|e| !matches!(e, MockEvent::OpenDirectTcpip { .. })));
    }

    #[tokio::test]
    async fn test_wait_session_times_out() {
        let (_connector, engine) = engine(MockScript::default());
        let result = engine
            .wait_session(SessionId::new(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(SshError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_newest_first() {
        let (connector, engine) = engine(MockScript::default());
        engine.connect(request("alpha")).await.unwrap();
        engine.connect(request("beta")).await.unwrap();

        engine.shutdown().await.unwrap();

        let hosts: Vec<String> = connector.disconnects().into_iter().map(|(h, _)| h).collect();
        assert_eq!(hosts, vec!["beta", "alpha"]);
        assert_eq!(engine.session_count(), 0);
        assert!(matches!(
            engine.connect(request("gamma")).await,
            Err(SshError::Disconnected)
        ));
    }
}
