//! Safe-id validation for session identifiers and aliases.
//!
//! Session ids and alias names become filenames inside the control
//! directory, so anything that could escape it is rejected at every
//! ingress: wire frames, directory scans, relay targets.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("id is empty")]
    Empty,
    #[error("id contains a path separator")]
    PathSeparator,
    #[error("id contains a parent-directory component")]
    ParentComponent,
}

/// Validate a session id or alias accepted from the wire or from disk.
///
/// Rules: non-empty, no `/` or `\` anywhere, no `..` anywhere. Ids are
/// treated case-sensitively; this check never canonicalizes.
pub fn validate_id(id: &str) -> Result<(), IdError> {
    if id.is_empty() {
        return Err(IdError::Empty);
    }
    if id.contains('/') || id.contains('\\') {
        return Err(IdError::PathSeparator);
    }
    if id.contains("..") {
        return Err(IdError::ParentComponent);
    }
    Ok(())
}
