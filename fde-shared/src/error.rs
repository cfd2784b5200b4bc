use thiserror::Error;

use crate::keyslot::KeyslotRef;

/// Admission-time rejection raised by `ConflictDetector` (§4.2, §7).
/// Carries enough structure for callers to render a precise message without
/// string-matching.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ChangeConflictError {
    /// Kind of the conflicting change (e.g. `fde-efi-secureboot-db-update`,
    /// `kernel-snap-remove`).
    pub kind: String,
    /// Id of the conflicting change, when known.
    pub id: Option<String>,
    /// Name of the conflicting snap, set only for DBX-vs-snap conflicts.
    pub snap: Option<String>,
    /// Keyslot the conflicting task already claims, set only for
    /// keyslot-vs-task conflicts.
    pub keyslot: Option<KeyslotRef>,
    pub message: String,
}

impl ChangeConflictError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            snap: None,
            keyslot: None,
            message: message.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_snap(mut self, snap: impl Into<String>) -> Self {
        self.snap = Some(snap.into());
        self
    }

    pub fn with_keyslot(mut self, keyslot: KeyslotRef) -> Self {
        self.keyslot = Some(keyslot);
        self
    }
}

/// The closed error taxonomy of §7. Every failure path the core can produce
/// fits one of these; nothing "falls off the edge" into a bare string.
#[derive(Error, Debug)]
pub enum FdeError {
    /// Admission-time rejection; returns before any state is touched.
    #[error(transparent)]
    ChangeConflict(#[from] ChangeConflictError),

    /// The crypto backend, or the task engine's own collaborator calls,
    /// returned an error. The task fails and undo runs.
    #[error("{0:#}")]
    Backend(#[from] anyhow::Error),

    /// A referenced keyslot, recovery-key id, or auth option was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A recovery-key id was resolved past its cache TTL.
    #[error("expired: {0}")]
    Expired(String),

    /// `ExternalOperation::update` found no matching operation, or a
    /// handler requested an illegal edge of the §3 DAG. Always a caller
    /// bug in this layer or its embedder.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// `change-auth` was asked for an auth mode this crate does not
    /// implement (`pin`, `none`).
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An invariant in §3 was found violated (e.g. two pending operations
    /// of the same kind). Fatal: return to the caller, do not proceed.
    #[error("state corruption: {0}")]
    StateCorruption(String),
}

pub type Result<T> = std::result::Result<T, FdeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_conflict_display_is_the_message() {
        let e = ChangeConflictError::new("fde-efi-secureboot-db-update", "cannot start a new DBX update when conflicting actions are in progress");
        assert_eq!(
            e.to_string(),
            "cannot start a new DBX update when conflicting actions are in progress"
        );
    }

    #[test]
    fn backend_error_wraps_anyhow_context() {
        let source = anyhow::anyhow!("tpm sealed object busy");
        let wrapped = anyhow::Error::from(source)
            .context("cannot perform initial reseal of keys for DBX update");
        let err = FdeError::from(wrapped);
        assert!(err
            .to_string()
            .starts_with("cannot perform initial reseal of keys for DBX update"));
    }
}
