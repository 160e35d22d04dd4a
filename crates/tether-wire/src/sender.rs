//! Sender-info convention for relayed `send` payloads.
//!
//! Callers embed `<sender_info>{json}</sender_info>` exactly once in the
//! message body; endpoints forward it verbatim, and renderers strip and
//! show it as "from <name> [remote: <host>]". The fragment is display
//! metadata only — it is never interpreted as a directive.

use serde::{Deserialize, Serialize};

const OPEN_TAG: &str = "<sender_info>";
const CLOSE_TAG: &str = "</sender_info>";

/// Identity of the session that originated a relayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl SenderInfo {
    /// Append the tagged fragment to a message body.
    pub fn embed(&self, message: &str) -> String {
        // Serialization of a struct with string fields cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{message}\n\n{OPEN_TAG}{json}{CLOSE_TAG}")
    }

    /// Display label: "from <name-or-id>" plus a remote-host suffix.
    pub fn display_label(&self) -> String {
        let who = self.session_name.as_deref().unwrap_or(&self.session_id);
        match self.hostname.as_deref() {
            Some(host) => format!("from {who} [remote: {host}]"),
            None => format!("from {who}"),
        }
    }
}

/// Extract and strip the sender fragment from a message body.
///
/// Returns the display text and the parsed sender. Absent or malformed
/// fragments leave the message untouched with no sender — an untagged
/// message, never an error.
pub fn extract(message: &str) -> (String, Option<SenderInfo>) {
    let Some(open) = message.find(OPEN_TAG) else {
        return (message.to_owned(), None);
    };
    let after_open = open + OPEN_TAG.len();
    let Some(close_rel) = message[after_open..].find(CLOSE_TAG) else {
        return (message.to_owned(), None);
    };
    let close = after_open + close_rel;

    let Ok(info) = serde_json::from_str::<SenderInfo>(&message[after_open..close]) else {
        return (message.to_owned(), None);
    };

    let mut clean = String::with_capacity(message.len());
    clean.push_str(&message[..open]);
    clean.push_str(&message[close + CLOSE_TAG.len()..]);
    (clean.trim().to_owned(), Some(info))
}
