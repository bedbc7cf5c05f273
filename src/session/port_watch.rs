//! Port discovery on command output
//!
//! A command profile may name a regular expression whose first capture
//! group is the remote port a server announces (and whose optional second
//! group is a URL path), or a fixed port to use instead. [`PortWatcher`]
//! scans the command's stdout for it and reports the port once.

use regex::Regex;
use tracing::debug;

use crate::ssh::SshError;

/// Output kept for matching; older bytes are dropped first.
const MAX_SCAN_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPort {
    pub port: u16,
    /// Path without the leading slash, empty when none was captured
    pub path: String,
}

impl DiscoveredPort {
    /// Address to browse once the port is forwarded to `local_port`.
    pub fn url(&self, local_port: u16) -> String {
        format!("http://localhost:{}/{}", local_port, self.path)
    }
}

pub struct PortWatcher {
    pattern: Option<Regex>,
    fixed_port: Option<u16>,
    seen: String,
    reported: bool,
}

impl PortWatcher {
    pub fn new(pattern: Option<&str>, fixed_port: Option<u16>) -> Result<Self, SshError> {
        let pattern = pattern
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| SshError::Profile(format!("invalid port pattern: {}", e)))?;
        Ok(Self {
            pattern,
            fixed_port,
            seen: String::new(),
            reported: false,
        })
    }

    /// A watcher that reports `port` on the first call to [`feed`](Self::feed).
    pub fn fixed(port: u16) -> Self {
        Self {
            pattern: None,
            fixed_port: Some(port),
            seen: String::new(),
            reported: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.reported && (self.pattern.is_some() || self.fixed_port.is_some())
    }

    /// Scan another chunk of output. Returns the port the first time it is
    /// found and `None` afterwards.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<DiscoveredPort> {
        if !self.is_active() {
            return None;
        }
        let Some(pattern) = &self.pattern else {
            self.reported = true;
            return self.fixed_port.map(|port| DiscoveredPort {
                port,
                path: String::new(),
            });
        };
        if chunk.is_empty() {
            return None;
        }

        let plain = strip_ansi_escapes::strip(chunk);
        self.seen.push_str(&String::from_utf8_lossy(&plain));
        if self.seen.len() > MAX_SCAN_BYTES {
            let mut cut = self.seen.len() - MAX_SCAN_BYTES;
            while !self.seen.is_char_boundary(cut) {
                cut += 1;
            }
            self.seen.drain(..cut);
        }

        let found = pattern.captures_iter(&self.seen).find_map(|caps| {
            let port = caps.get(1)?.as_str().parse::<u16>().ok()?;
            let path = caps
                .get(2)
                .map(|m| m.as_str().trim_start_matches('/').to_string())
                .unwrap_or_default();
            Some(DiscoveredPort { port, path })
        });
        if let Some(found) = &found {
            debug!("Discovered remote port {} in command output", found.port);
            self.reported = true;
            self.seen.clear();
        }
        found
    }
}
