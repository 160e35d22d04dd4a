//! Daemon configuration — `config.json` in the control directory.
//!
//! Holds the federation port, the persisted peer list, and the timing
//! tunables. Loaded once at startup; `add_peer`/`remove_peer` rewrite it
//! so the peer set survives restarts.

use std::fs;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use tether_wire::ControlDir;

/// Default federation port.
pub const DEFAULT_PORT: u16 = 7433;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    pub port: u16,
    /// Peer addresses as `host[:port]` strings.
    pub peers: Vec<String>,
    /// Seconds of zero-session, zero-peer idleness before the daemon
    /// exits on its own.
    pub auto_shutdown_timeout: u64,
    /// Seconds between heartbeat frames on each peer link.
    pub heartbeat_interval: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            peers: Vec::new(),
            auto_shutdown_timeout: 300,
            heartbeat_interval: 15,
        }
    }
}

impl DaemonConfig {
    /// Load from `config.json`, falling back to defaults when the file is
    /// missing. A corrupt file is reported and replaced by defaults
    /// rather than killing the daemon.
    pub fn load(dir: &ControlDir) -> Self {
        let path = dir.config_file();
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), "unreadable config, using defaults: {e}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, dir: &ControlDir) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.config_file(), json)
    }

    pub fn auto_shutdown(&self) -> Duration {
        Duration::from_secs(self.auto_shutdown_timeout)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Record a peer address, deduplicating on the host part.
    pub fn add_peer_addr(&mut self, host: &str, port: u16) {
        self.remove_peer_addr(host);
        if port == DEFAULT_PORT {
            self.peers.push(host.to_owned());
        } else {
            self.peers.push(format!("{host}:{port}"));
        }
    }

    pub fn remove_peer_addr(&mut self, host: &str) {
        self.peers.retain(|p| parse_peer_addr(p).0 != host);
    }
}

/// Parse a `host[:port]` peer string.
///
/// A trailing `:<digits>` that parses to a nonzero port splits off;
/// anything else (`host:0`, non-numeric suffix, no colon) is a bare host
/// on the default port.
pub fn parse_peer_addr(addr: &str) -> (String, u16) {
    if let Some((host, suffix)) = addr.rsplit_once(':') {
        if !host.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(port) = suffix.parse::<u16>() {
                if port != 0 {
                    return (host.to_owned(), port);
                }
            }
        }
    }
    (addr.to_owned(), DEFAULT_PORT)
}
