//! `FdeState`, the root persisted object (§3), and `FdeStore`, the typed
//! view handlers and coordinators use to read and mutate it. A `FdeStore`
//! only ever exists for the duration of a closure run under the task
//! engine's single lock (§5) — see [`crate::engine::TaskEngine::with_state`].

use std::collections::BTreeMap;

use fde_shared::{ContainerRole, ExtStatus, ExternalOperation, KeyslotRole, SealingParameters};
use serde::{Deserialize, Serialize};

use crate::error::{FdeError, Result};

/// The object persisted under the task engine's `"fde"` state-store key
/// (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FdeState {
    pub keyslot_roles: BTreeMap<String, KeyslotRole>,
    pub pending_external_operations: Vec<ExternalOperation>,
}

/// Typed, lock-scoped access to [`FdeState`].
pub struct FdeStore<'a> {
    state: &'a mut FdeState,
}

impl<'a> FdeStore<'a> {
    pub fn new(state: &'a mut FdeState) -> Self {
        Self { state }
    }

    pub fn role(&self, name: &str) -> Option<&KeyslotRole> {
        self.state.keyslot_roles.get(name)
    }

    /// Mutable access to a role, creating it with a fresh primary-key id if
    /// it doesn't exist yet. Roles come into existence the first time a
    /// sealing or keyslot operation touches them.
    pub fn role_mut_or_create(&mut self, name: &str) -> &mut KeyslotRole {
        self.state
            .keyslot_roles
            .entry(name.to_string())
            .or_insert_with(|| KeyslotRole::new(format!("{name}-primary")))
    }

    /// Records the result of a reseal for one (role, container) pair. This
    /// is the callback target described in §4.6: "Both are expected to
    /// synchronously call back into the manager's `update(role,
    /// container_role, SealingParameters)`".
    pub fn set_container_sealing(
        &mut self,
        role: &str,
        container_role: ContainerRole,
        params: SealingParameters,
    ) {
        self.role_mut_or_create(role)
            .set_container_sealing(container_role, params);
    }

    pub fn roles(&self) -> impl Iterator<Item = (&String, &KeyslotRole)> {
        self.state.keyslot_roles.iter()
    }

    // --- ExternalOperation SM contract (§4.1) ---

    /// Invariant 1 (§8): at most one non-ready operation per kind at any
    /// time.
    pub fn add_operation(&mut self, op: ExternalOperation) -> Result<()> {
        let conflict = self
            .state
            .pending_external_operations
            .iter()
            .any(|existing| existing.kind == op.kind && !existing.status.is_ready());
        if conflict {
            return Err(FdeError::StateCorruption(format!(
                "a non-ready external operation of kind {:?} already exists",
                op.kind
            )));
        }
        self.state.pending_external_operations.push(op);
        Ok(())
    }

    /// Matches by `(kind, change_id)`; fails if nothing matches (§4.1
    /// "Failure").
    pub fn update_operation(
        &mut self,
        kind: &str,
        change_id: &str,
        f: impl FnOnce(&mut ExternalOperation),
    ) -> Result<()> {
        let op = self
            .state
            .pending_external_operations
            .iter_mut()
            .find(|op| op.is(kind, change_id))
            .ok_or_else(|| {
                FdeError::InvalidTransition(format!(
                    "no external operation matches kind={kind:?} change_id={change_id:?}"
                ))
            })?;
        f(op);
        Ok(())
    }

    pub fn find_first_pending_by_kind(&self, kind: &str) -> Option<&ExternalOperation> {
        self.state
            .pending_external_operations
            .iter()
            .find(|op| op.kind == kind && !op.status.is_ready())
    }

    pub fn find_first_by_change_id(&self, change_id: &str) -> Option<&ExternalOperation> {
        self.state
            .pending_external_operations
            .iter()
            .find(|op| op.change_id == change_id)
    }

    /// Removes a terminal operation. Called exactly once, at the owning
    /// change's cleanup phase (§9 open-question resolution).
    pub fn remove_operation(&mut self, kind: &str, change_id: &str) {
        self.state
            .pending_external_operations
            .retain(|op| !op.is(kind, change_id));
    }

    pub fn status_of(&self, kind: &str, change_id: &str) -> Option<ExtStatus> {
        self.find_first_by_change_id(change_id)
            .filter(|op| op.kind == kind)
            .map(|op| op.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_operation_rejects_second_non_ready_of_same_kind() {
        let mut state = FdeState::default();
        let mut store = FdeStore::new(&mut state);
        store
            .add_operation(ExternalOperation::new("fde-efi-secureboot-db-update", "1"))
            .unwrap();
        let err = store
            .add_operation(ExternalOperation::new("fde-efi-secureboot-db-update", "2"))
            .unwrap_err();
        assert!(matches!(err, FdeError::StateCorruption(_)));
    }

    #[test]
    fn add_operation_allows_second_once_first_is_ready() {
        let mut state = FdeState::default();
        {
            let mut store = FdeStore::new(&mut state);
            store
                .add_operation(ExternalOperation::new("fde-efi-secureboot-db-update", "1"))
                .unwrap();
            store
                .update_operation("fde-efi-secureboot-db-update", "1", |op| {
                    op.status = ExtStatus::Error;
                })
                .unwrap();
        }
        let mut store = FdeStore::new(&mut state);
        store
            .add_operation(ExternalOperation::new("fde-efi-secureboot-db-update", "2"))
            .unwrap();
    }

    #[test]
    fn update_operation_fails_when_nothing_matches() {
        let mut state = FdeState::default();
        let mut store = FdeStore::new(&mut state);
        let err = store
            .update_operation("kind", "missing", |_| {})
            .unwrap_err();
        assert!(matches!(err, FdeError::InvalidTransition(_)));
    }

    #[test]
    fn remove_operation_is_idempotent() {
        let mut state = FdeState::default();
        let mut store = FdeStore::new(&mut state);
        store
            .add_operation(ExternalOperation::new("k", "1"))
            .unwrap();
        store.remove_operation("k", "1");
        store.remove_operation("k", "1");
        assert!(store.find_first_by_change_id("1").is_none());
    }
}
