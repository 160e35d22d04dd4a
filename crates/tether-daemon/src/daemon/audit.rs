//! Relay audit log — one JSON object per line, append-only.
//!
//! Records who asked which session to do what and how it went. Write
//! failures are reported and swallowed; auditing never takes the relay
//! path down with it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use tether_wire::ControlDir;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord<'a> {
    pub timestamp: String,
    /// Requester identity: `"local"` or a peer address.
    pub peer: &'a str,
    /// Relayed command type, e.g. `get_message`.
    pub action: &'a str,
    pub data: AuditTarget<'a>,
    /// `"ok"` or `"fail"`.
    pub result: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTarget<'a> {
    pub target_session_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(dir: &ControlDir) -> Self {
        Self {
            path: dir.audit_log(),
        }
    }

    pub fn record(&self, peer: &str, action: &str, target: &str, error: Option<&str>) {
        let record = AuditRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            peer,
            action,
            data: AuditTarget {
                target_session_id: target,
            },
            result: if error.is_none() { "ok" } else { "fail" },
            error,
        };
        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = appended {
            warn!(path = %self.path.display(), "audit write failed: {e}");
        }
    }
}
