//! `remove-keys` (§4.5).

use fde_shared::{ContainerRole, KeyslotRef};

use crate::ctx::HandlerCtx;
use crate::engine::{TaskHandler, TaskInfo};
use crate::error::{FdeError, Result};

pub struct RemoveKeysHandler;

impl TaskHandler for RemoveKeysHandler {
    fn do_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        let keyslots = super::keyslots_of(task);
        let targets: Vec<KeyslotRef> = if keyslots.is_empty() {
            vec![
                KeyslotRef::default_recovery(ContainerRole::SystemData),
                KeyslotRef::default_recovery(ContainerRole::SystemSave),
            ]
        } else {
            keyslots
        };

        for slot in &targets {
            let device = ctx.config.device_path(slot.container_role)?;
            let existing = ctx.backend.list_container_unlock_key_names(device)?;
            if !existing.contains(&slot.name) {
                // Missing refs are silently skipped.
                continue;
            }
            ctx.backend
                .delete_container_key(device, slot)
                .map_err(|e| FdeError::Backend(e.context(format!("cannot remove keyslot {slot}"))))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_is_both_containers_recovery_slot() {
        let task = crate::engine::TaskInfo {
            change: crate::engine::ChangeId("c1".into()),
            kind: super::super::REMOVE_KEYS_TASK_KIND.to_string(),
            keyslots: vec![],
            attrs: crate::engine::TaskAttrs::new(),
            status: crate::engine::TaskStatus::Pending,
        };
        let keyslots = super::super::keyslots_of(&task);
        assert!(keyslots.is_empty());
    }
}
