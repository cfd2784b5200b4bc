//! `add-recovery-keys` (§4.5).

use fde_shared::KeyslotRef;

use crate::ctx::HandlerCtx;
use crate::engine::{TaskHandler, TaskInfo};
use crate::error::{FdeError, Result};

use super::attr;

pub struct AddRecoveryKeysHandler;

impl TaskHandler for AddRecoveryKeysHandler {
    fn do_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        let keyslots = super::keyslots_of(task);
        let recovery_key_id: String = attr(task, "recovery-key-id")?;
        let key = ctx.manager_state.recovery_key(&recovery_key_id)?;

        let mut added = Vec::new();
        for slot in &keyslots {
            let device = ctx.config.device_path(slot.container_role)?;
            let existing = ctx.backend.list_container_recovery_key_names(device)?;
            if existing.contains(&slot.name) {
                continue;
            }
            if let Err(e) = ctx.backend.add_container_recovery_key(device, slot, &key) {
                for done in &added {
                    rollback_one(ctx, done);
                }
                return Err(FdeError::Backend(e.context(format!("cannot add recovery key slot ({slot})"))));
            }
            added.push(slot.clone());
        }
        Ok(())
    }
}

fn rollback_one(ctx: &HandlerCtx<'_>, slot: &KeyslotRef) {
    let Ok(device) = ctx.config.device_path(slot.container_role) else {
        return;
    };
    if let Err(e) = ctx.backend.delete_container_key(device, slot) {
        log::warn!("undo of add-recovery-keys: failed to delete slot {slot}: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fde_shared::ContainerRole;

    #[test]
    fn skips_slots_that_already_exist() {
        // Exercised end-to-end in tests/scenarios.rs (S6); this module only
        // asserts the attribute-reading helper behaves.
        let task = TaskInfo {
            change: crate::engine::ChangeId("c1".into()),
            kind: super::super::ADD_RECOVERY_KEYS_TASK_KIND.to_string(),
            keyslots: vec![KeyslotRef::default_recovery(ContainerRole::SystemData)],
            attrs: crate::engine::TaskAttrs::new().with("recovery-key-id", &"id-1".to_string()),
            status: crate::engine::TaskStatus::Pending,
        };
        let id: String = attr(&task, "recovery-key-id").unwrap();
        assert_eq!(id, "id-1");
    }
}
