//! Control-directory layout — the on-disk rendezvous shared by every
//! endpoint and the daemon.
//!
//! ```text
//! ~/.pi/remote-control/
//!   daemon.sock            daemon IPC (mode 0600)
//!   daemon.pid             textual PID of live daemon
//!   config.json            peer list + tunables
//!   audit.log              one JSON object per line
//!   names/<sessionId>      persisted auto-name
//!   <sessionId>.sock       per-session IPC
//!   <alias>.alias          symlink → <sessionId>.sock
//! ```
//!
//! Ownership: each endpoint is the sole writer of its own node and alias
//! links; the daemon is the sole reader of endpoint nodes and the sole
//! writer of the singletons. Alias links are eventually consistent —
//! readers reread before acting, nothing here is cached.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::ident::validate_id;

const SOCK_SUFFIX: &str = ".sock";
const ALIAS_SUFFIX: &str = ".alias";
const DAEMON_SOCK: &str = "daemon.sock";

/// Handle on one control directory.
#[derive(Debug, Clone)]
pub struct ControlDir {
    root: PathBuf,
}

impl ControlDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default per-user location, `<home>/.pi/remote-control`.
    pub fn default_root() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".pi").join("remote-control")))
    }

    /// Create the directory tree (0700) if missing.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.names_dir())?;
        for dir in [&self.root, &self.names_dir()] {
            let mut perms = fs::metadata(dir)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(dir, perms)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn daemon_sock(&self) -> PathBuf {
        self.root.join(DAEMON_SOCK)
    }

    pub fn daemon_pid(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    pub fn names_dir(&self) -> PathBuf {
        self.root.join("names")
    }

    pub fn name_file(&self, session_id: &str) -> PathBuf {
        self.names_dir().join(session_id)
    }

    pub fn endpoint_sock(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}{SOCK_SUFFIX}"))
    }

    pub fn alias_link(&self, alias: &str) -> PathBuf {
        self.root.join(format!("{alias}{ALIAS_SUFFIX}"))
    }

    /// Enumerate session ids with an endpoint node on disk, daemon
    /// singleton excluded. Ids failing validation are skipped.
    pub fn sessions(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == DAEMON_SOCK {
                continue;
            }
            if let Some(id) = name.strip_suffix(SOCK_SUFFIX) {
                if validate_id(id).is_ok() {
                    out.push(id.to_owned());
                }
            }
        }
        out.sort();
        out
    }

    /// Point `<alias>.alias` at `<session_id>.sock`, replacing any link
    /// that resolves elsewhere. The target is the bare filename so links
    /// survive a directory move.
    pub fn write_alias(&self, alias: &str, session_id: &str) -> io::Result<()> {
        validate_id(alias).map_err(invalid_input)?;
        validate_id(session_id).map_err(invalid_input)?;
        let link = self.alias_link(alias);
        let target = format!("{session_id}{SOCK_SUFFIX}");
        if let Ok(existing) = fs::read_link(&link) {
            if existing == Path::new(&target) {
                return Ok(());
            }
            fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(&target, &link)
    }

    /// Resolve an alias link to a session id, rereading from disk.
    pub fn read_alias(&self, alias: &str) -> Option<String> {
        validate_id(alias).ok()?;
        let target = fs::read_link(self.alias_link(alias)).ok()?;
        let id = target.file_name()?.to_str()?.strip_suffix(SOCK_SUFFIX)?;
        validate_id(id).ok()?;
        Some(id.to_owned())
    }

    pub fn remove_alias(&self, alias: &str) -> io::Result<()> {
        validate_id(alias).map_err(invalid_input)?;
        match fs::remove_file(self.alias_link(alias)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// All aliases currently resolving to `session_id`, in name order.
    pub fn aliases_for(&self, session_id: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(alias) = name.strip_suffix(ALIAS_SUFFIX) else {
                continue;
            };
            if self.read_alias(alias).as_deref() == Some(session_id) {
                out.push(alias.to_owned());
            }
        }
        out.sort();
        out
    }

    /// Resolve a name to a session id: a live endpoint node wins, then an
    /// alias link. Always rereads — never serves a stale redirect.
    pub fn resolve(&self, name_or_id: &str) -> Option<String> {
        validate_id(name_or_id).ok()?;
        if self.endpoint_sock(name_or_id).exists() {
            return Some(name_or_id.to_owned());
        }
        self.read_alias(name_or_id)
    }
}

fn invalid_input(e: crate::ident::IdError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}
