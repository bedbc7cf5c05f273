//! Engine and identity configuration

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::error::SshError;

/// Runtime settings for the poll loop, channels and forwards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sleep between poll loop ticks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Interval of the `wait_*` liveness polls
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,

    /// How long a proxy hop waits for its parent session
    #[serde(default = "default_session_wait_secs")]
    pub session_wait_secs: u64,

    /// Suggested timeout for `wait_terminal` / `wait_command`
    #[serde(default = "default_channel_wait_secs")]
    pub channel_wait_secs: u64,

    /// Grace period after a break before the channel is closed
    #[serde(default = "default_break_grace_secs")]
    pub break_grace_secs: u64,

    /// Relay buffer per forward listener
    #[serde(default = "default_forward_buffer_size")]
    pub forward_buffer_size: usize,

    /// Read buffer shared by all channels of a session
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// Depth of the queues behind `ChannelStreams::queued`
    #[serde(default = "default_stream_queue_depth")]
    pub stream_queue_depth: usize,

    #[serde(default = "default_terminal_type")]
    pub terminal_type: String,

    /// Terminal columns
    #[serde(default = "default_cols")]
    pub cols: u32,

    /// Terminal rows
    #[serde(default = "default_rows")]
    pub rows: u32,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// First port tried for proxy hop listeners and discovered-port forwards
    #[serde(default = "default_ephemeral_port_min")]
    pub ephemeral_port_min: u16,

    #[serde(default = "default_ephemeral_port_max")]
    pub ephemeral_port_max: u16,
}

fn default_tick_interval_ms() -> u64 {
    1
}

fn default_liveness_poll_ms() -> u64 {
    1000
}

fn default_session_wait_secs() -> u64 {
    15
}

fn default_channel_wait_secs() -> u64 {
    20
}

fn default_break_grace_secs() -> u64 {
    5
}

fn default_forward_buffer_size() -> usize {
    32768
}

fn default_channel_buffer_size() -> usize {
    512 * 1024
}

fn default_stream_queue_depth() -> usize {
    256
}

fn default_terminal_type() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_ephemeral_port_min() -> u16 {
    49152
}

fn default_ephemeral_port_max() -> u16 {
    65535
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            liveness_poll_ms: default_liveness_poll_ms(),
            session_wait_secs: default_session_wait_secs(),
            channel_wait_secs: default_channel_wait_secs(),
            break_grace_secs: default_break_grace_secs(),
            forward_buffer_size: default_forward_buffer_size(),
            channel_buffer_size: default_channel_buffer_size(),
            stream_queue_depth: default_stream_queue_depth(),
            terminal_type: default_terminal_type(),
            cols: default_cols(),
            rows: default_rows(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_max: default_keepalive_max(),
            ephemeral_port_min: default_ephemeral_port_min(),
            ephemeral_port_max: default_ephemeral_port_max(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, SshError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SshError::Profile(format!("invalid engine config: {}", e)))?;
        if config.ephemeral_port_min == 0 || config.ephemeral_port_min > config.ephemeral_port_max
        {
            return Err(SshError::Profile(format!(
                "invalid ephemeral port range {}..={}",
                config.ephemeral_port_min, config.ephemeral_port_max
            )));
        }
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms.max(1))
    }

    pub fn session_wait(&self) -> Duration {
        Duration::from_secs(self.session_wait_secs)
    }

    pub fn channel_wait(&self) -> Duration {
        Duration::from_secs(self.channel_wait_secs)
    }

    pub fn break_grace(&self) -> Duration {
        Duration::from_secs(self.break_grace_secs)
    }

    pub fn ephemeral_ports(&self) -> RangeInclusive<u16> {
        self.ephemeral_port_min..=self.ephemeral_port_max
    }

    /// russh client settings derived from this config
    pub fn client_config(&self) -> russh::client::Config {
        russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(self.keepalive_interval_secs)),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

/// Username plus private key material for public-key authentication.
///
/// Key text and passphrase are wiped from memory on drop.
#[derive(Clone)]
pub struct Identity {
    pub username: String,
    private_key: Zeroizing<String>,
    passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Identity {
    /// An empty passphrase means the key is not encrypted.
    pub fn new(
        username: impl Into<String>,
        private_key: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            private_key: Zeroizing::new(private_key.into()),
            passphrase: passphrase
                .filter(|p| !p.is_empty())
                .map(Zeroizing::new),
        }
    }

    /// Read an OpenSSH private key file; `~` expands to the home directory.
    pub fn from_key_file(
        username: impl Into<String>,
        key_path: &str,
        passphrase: Option<String>,
    ) -> Result<Self, SshError> {
        let path = expand_tilde(key_path);
        let key = std::fs::read_to_string(&path).map_err(|e| {
            SshError::KeyImport(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self::new(username, key, passphrase))
    }

    pub fn has_passphrase(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Decode (and decrypt) the private key.
    pub fn import_private_key(&self) -> Result<PrivateKey, SshError> {
        russh::keys::decode_secret_key(
            self.private_key.as_str(),
            self.passphrase.as_ref().map(|p| p.as_str()),
        )
        .map_err(|e| SshError::KeyImport(e.to_string()))
    }

    /// Public half of the imported key, as offered to the server.
    pub fn derive_public_key(key: &PrivateKey) -> Result<PublicKey, SshError> {
        let public = key.public_key().clone();
        if public.public_key_bytes().is_empty() {
            return Err(SshError::KeyImport("public key cannot convert".into()));
        }
        Ok(public)
    }
}

/// Expand `~` and `~/...`
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
