//! `ConflictDetector` (§4.2): the two (plus one, for DBX) admission-time
//! checks that keep unrelated system mutations from interleaving with an
//! open FDE change and invalidating its re-seal.

use fde_shared::{ChangeConflictError, KeyslotRef};

use crate::engine::TaskEngine;

pub const DBX_CHANGE_KIND: &str = "fde-efi-secureboot-db-update";
pub const REPLACE_RECOVERY_KEY_CHANGE_KIND: &str = "fde-replace-recovery-key";

/// Narrow interface onto the snap-install subsystem (§1, §4.2c). Consulted
/// only for conflict checks; it calls into us symmetrically via
/// [`dbx_in_progress`].
pub trait SnapSubsystem: Send + Sync {
    fn conflicting_snap_change(&self) -> Option<SnapChange>;
}

#[derive(Debug, Clone)]
pub struct SnapChange {
    pub kind: String,
    pub snap_name: String,
}

pub struct ConflictDetector<'a> {
    engine: &'a dyn TaskEngine,
    snap: Option<&'a dyn SnapSubsystem>,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(engine: &'a dyn TaskEngine, snap: Option<&'a dyn SnapSubsystem>) -> Self {
        Self { engine, snap }
    }

    /// (a) FDE-vs-FDE conflict (§4.2a).
    pub fn check_fde_conflict(&self) -> Result<(), ChangeConflictError> {
        for change in self.engine.non_ready_changes() {
            if change.kind == DBX_CHANGE_KIND || change.kind == REPLACE_RECOVERY_KEY_CHANGE_KIND {
                return Err(ChangeConflictError::new(
                    change.kind.clone(),
                    "cannot start a new DBX update when conflicting actions are in progress",
                )
                .with_id(change.id.to_string()));
            }
            if change.tasks.iter().any(|t| t.kind.starts_with("fde-")) {
                log::warn!(
                    "rejecting admission: in-progress change {} (kind {:?}) already carries an fde- task",
                    change.id,
                    change.kind
                );
                return Err(ChangeConflictError::new(
                    change.kind.clone(),
                    format!(
                        "cannot start a new FDE change while change {} is in progress",
                        change.id
                    ),
                )
                .with_id(change.id.to_string()));
            }
        }
        Ok(())
    }

    /// (b) keyslot-vs-task conflict (§4.2b).
    pub fn check_keyslot_conflict(&self, keyslots: &[KeyslotRef]) -> Result<(), ChangeConflictError> {
        for change in self.engine.non_ready_changes() {
            for task in &change.tasks {
                if task.status.is_ready() {
                    continue;
                }
                if let Some(hit) = task.keyslots.iter().find(|k| keyslots.contains(k)) {
                    return Err(ChangeConflictError::new(
                        change.kind.clone(),
                        format!(
                            "keyslot {hit} is already claimed by change {} (kind {:?})",
                            change.id, change.kind
                        ),
                    )
                    .with_id(change.id.to_string())
                    .with_keyslot(hit.clone()));
                }
            }
        }
        Ok(())
    }

    /// (c) DBX-vs-snap conflict, the DBX-side half (§4.2c).
    pub fn check_snap_conflict(&self) -> Result<(), ChangeConflictError> {
        let Some(snap) = self.snap else {
            return Ok(());
        };
        if let Some(conflict) = snap.conflicting_snap_change() {
            return Err(ChangeConflictError::new(
                conflict.kind,
                format!(
                    "cannot start a DBX update while snap {:?} is being installed",
                    conflict.snap_name
                ),
            )
            .with_snap(conflict.snap_name));
        }
        Ok(())
    }
}

/// The snap-side half of (c): snap installs call this before starting, to
/// reject if a DBX change is already in progress (§4.2c "Symmetrically").
pub fn dbx_in_progress(engine: &dyn TaskEngine) -> Option<ChangeConflictError> {
    engine
        .non_ready_changes()
        .into_iter()
        .find(|c| c.kind == DBX_CHANGE_KIND)
        .map(|c| {
            ChangeConflictError::new(
                c.kind.clone(),
                format!("cannot install: a DBX update (change {}) is in progress", c.id),
            )
            .with_id(c.id.to_string())
        })
}
