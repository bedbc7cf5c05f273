//! Server and identity profiles
//!
//! The records a front end keeps for each saved server and key. This crate
//! only reads them (to resolve proxy chains) and pins first-use host keys;
//! storing them is up to the caller.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::PortWatcher;
use crate::ssh::{Identity, SshError};

fn default_port() -> u16 {
    22
}

/// A saved server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub id: Uuid,
    #[serde(default)]
    pub title: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub identity_id: Uuid,
    /// Jump host this server is reached through
    #[serde(default)]
    pub proxy_id: Option<Uuid>,
    /// Pinned host key digest, empty until first connect
    #[serde(default)]
    pub host_key: Vec<u8>,
    /// Run this instead of opening a shell
    #[serde(default)]
    pub command: Option<String>,
    /// Regex over the command's output; group 1 is the port, group 2 the path
    #[serde(default)]
    pub port_pattern: Option<String>,
    /// Port to forward when no pattern is given
    #[serde(default)]
    pub fixed_forward_port: Option<u16>,
}

impl ServerProfile {
    pub fn new(title: impl Into<String>, host: impl Into<String>, identity_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            host: host.into(),
            port: default_port(),
            identity_id,
            proxy_id: None,
            host_key: Vec::new(),
            command: None,
            port_pattern: None,
            fixed_forward_port: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn via(mut self, proxy_id: Uuid) -> Self {
        self.proxy_id = Some(proxy_id);
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Watcher for the port this server's command announces, if it has one.
    pub fn port_watcher(&self) -> Result<Option<PortWatcher>, SshError> {
        if self.command.is_none() {
            return Ok(None);
        }
        let watcher = PortWatcher::new(self.port_pattern.as_deref(), self.fixed_forward_port)?;
        Ok(watcher.is_active().then_some(watcher))
    }
}

/// A saved user name and private key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub id: Uuid,
    #[serde(default)]
    pub title: String,
    pub username: String,
    /// OpenSSH private key, either PEM text or base64 of it
    pub private_key: String,
    /// Empty when the key is not encrypted
    #[serde(default)]
    pub passphrase: String,
}

impl std::fmt::Debug for IdentityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityProfile")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl IdentityProfile {
    pub fn new(
        title: impl Into<String>,
        username: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            username: username.into(),
            private_key: private_key.into(),
            passphrase: String::new(),
        }
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self
    }

    pub fn to_identity(&self) -> Result<Identity, SshError> {
        let key = self.private_key.trim();
        let pem = if key.starts_with("-----BEGIN") {
            key.to_string()
        } else {
            let compact: String = key.split_whitespace().collect();
            let decoded = BASE64
                .decode(compact.as_bytes())
                .map_err(|e| SshError::KeyImport(format!("{}: {}", self.title, e)))?;
            String::from_utf8(decoded)
                .map_err(|e| SshError::KeyImport(format!("{}: {}", self.title, e)))?
        };
        Ok(Identity::new(
            self.username.clone(),
            pem,
            Some(self.passphrase.clone()),
        ))
    }
}

/// Where proxy chains look up their hops
pub trait ProfileSource {
    fn server(&self, id: Uuid) -> Option<ServerProfile>;
    fn identity(&self, id: Uuid) -> Option<IdentityProfile>;
}

/// In-memory profile collection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileBook {
    #[serde(default)]
    servers: Vec<ServerProfile>,
    #[serde(default)]
    identities: Vec<IdentityProfile>,
}

impl ProfileBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, SshError> {
        serde_json::from_str(json).map_err(|e| SshError::Profile(format!("invalid profiles: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, SshError> {
        serde_json::to_string_pretty(self).map_err(|e| SshError::Profile(e.to_string()))
    }

    /// Insert or replace by id
    pub fn add_server(&mut self, server: ServerProfile) -> Uuid {
        let id = server.id;
        match self.servers.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = server,
            None => self.servers.push(server),
        }
        id
    }

    /// Insert or replace by id
    pub fn add_identity(&mut self, identity: IdentityProfile) -> Uuid {
        let id = identity.id;
        match self.identities.iter_mut().find(|i| i.id == id) {
            Some(existing) => *existing = identity,
            None => self.identities.push(identity),
        }
        id
    }

    pub fn remove_server(&mut self, id: Uuid) -> Option<ServerProfile> {
        let index = self.servers.iter().position(|s| s.id == id)?;
        Some(self.servers.remove(index))
    }

    pub fn servers(&self) -> &[ServerProfile] {
        &self.servers
    }

    pub fn identities(&self) -> &[IdentityProfile] {
        &self.identities
    }

    /// Record a first-use host key. A key that is already pinned is never
    /// replaced; returns whether anything changed.
    pub fn pin_host_key(&mut self, server_id: Uuid, fingerprint: &[u8]) -> bool {
        match self.servers.iter_mut().find(|s| s.id == server_id) {
            Some(server) if server.host_key.is_empty() && !fingerprint.is_empty() => {
                server.host_key = fingerprint.to_vec();
                true
            }
            _ => false,
        }
    }
}

impl ProfileSource for ProfileBook {
    fn server(&self, id: Uuid) -> Option<ServerProfile> {
        self.servers.iter().find(|s| s.id == id).cloned()
    }

    fn identity(&self, id: Uuid) -> Option<IdentityProfile> {
        self.identities.iter().find(|i| i.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::transport::mock::TEST_KEY;

    #[test]
    fn test_server_defaults_from_json() {
        let identity = Uuid::new_v4();
        let json = format!(
            r#"{{"servers": [{{"id": "{}", "host": "login.hpc", "identity_id": "{}"}}]}}"#,
            Uuid::new_v4(),
            identity
        );
        let book = ProfileBook::from_json(&json).unwrap();
        let server = &book.servers()[0];
        assert_eq!(server.port, 22);
        assert_eq!(server.identity_id, identity);
        assert!(server.host_key.is_empty());
        assert!(server.proxy_id.is_none());
    }

    #[test]
    fn test_pin_host_key_only_once() {
        let mut book = ProfileBook::new();
        let id = book.add_server(ServerProfile::new("gpu", "gpu01", Uuid::new_v4()));

        assert!(book.pin_host_key(id, &[1, 2, 3]));
        assert!(!book.pin_host_key(id, &[9, 9, 9]));
        assert_eq!(book.server(id).unwrap().host_key, vec![1, 2, 3]);
        assert!(!book.pin_host_key(Uuid::new_v4(), &[1]));
    }

    #[test]
    fn test_identity_accepts_pem_or_base64() {
        let pem = IdentityProfile::new("laptop", "ops", TEST_KEY);
        assert!(pem.to_identity().unwrap().import_private_key().is_ok());

        let wrapped = IdentityProfile::new("laptop", "ops", BASE64.encode(TEST_KEY));
        let identity = wrapped.to_identity().unwrap();
        assert_eq!(identity.username, "ops");
        assert!(!identity.has_passphrase());
        assert!(identity.import_private_key().is_ok());

        let broken = IdentityProfile::new("bad", "ops", "not base64 at all!");
        assert!(matches!(broken.to_identity(), Err(SshError::KeyImport(_))));
    }

    #[test]
    fn test_port_watcher_only_for_commands() {
        let mut server = ServerProfile::new("nb", "gpu01", Uuid::new_v4());
        server.port_pattern = Some(r"localhost:(\d+)/(\S*)".into());
        assert!(server.port_watcher().unwrap().is_none());

        let server = server.command("jupyter lab --no-browser");
        assert!(server.port_watcher().unwrap().is_some());

        let mut plain = ServerProfile::new("sh", "gpu01", Uuid::new_v4()).command("htop");
        assert!(plain.port_watcher().unwrap().is_none());
        plain.fixed_forward_port = Some(6006);
        assert!(plain.port_watcher().unwrap().is_some());
    }

    #[test]
    fn test_replace_and_remove() {
        let mut book = ProfileBook::new();
        let mut server = ServerProfile::new("a", "host-a", Uuid::new_v4());
        let id = book.add_server(server.clone());
        server.title = "renamed".into();
        book.add_server(server);
        assert_eq!(book.servers().len(), 1);
        assert_eq!(book.server(id).unwrap().title, "renamed");

        let json = book.to_json().unwrap();
        assert_eq!(ProfileBook::from_json(&json).unwrap().servers().len(), 1);

        assert!(book.remove_server(id).is_some());
        assert!(book.servers().is_empty());
    }
}
