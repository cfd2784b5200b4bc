//! `rename-keys` (§4.5).

use std::collections::BTreeMap;

use crate::ctx::HandlerCtx;
use crate::engine::{TaskHandler, TaskInfo};
use crate::error::{FdeError, Result};

use super::attr;

pub struct RenameKeysHandler;

impl TaskHandler for RenameKeysHandler {
    fn do_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        let keyslots = super::keyslots_of(task);
        let renames: BTreeMap<String, String> = attr(task, "renames")?;

        for slot in &keyslots {
            let new_name = renames
                .get(&slot.string_form())
                .ok_or_else(|| FdeError::InvalidTransition(format!("no rename target for keyslot {slot}")))?;
            let device = ctx.config.device_path(slot.container_role)?;
            let existing = ctx.backend.list_container_unlock_key_names(device)?;
            if !existing.contains(&slot.name) {
                continue;
            }
            if existing.contains(new_name) {
                // A prior run already completed this rename.
                continue;
            }
            ctx.backend
                .rename_container_key(device, slot, new_name)
                .map_err(|e| FdeError::Backend(e.context(format!("cannot rename keyslot {slot}"))))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fde_shared::{ContainerRole, KeyslotRef};

    #[test]
    fn missing_rename_target_is_invalid_transition() {
        let slot = KeyslotRef::new(ContainerRole::SystemData, "a");
        let mut renames = BTreeMap::new();
        renames.insert("system-data:other".to_string(), "b".to_string());
        let task = crate::engine::TaskInfo {
            change: crate::engine::ChangeId("c1".into()),
            kind: super::super::RENAME_KEYS_TASK_KIND.to_string(),
            keyslots: vec![slot.clone()],
            attrs: crate::engine::TaskAttrs::new().with("renames", &renames),
            status: crate::engine::TaskStatus::Pending,
        };
        let renames: BTreeMap<String, String> = attr(&task, "renames").unwrap();
        assert!(renames.get(&slot.string_form()).is_none());
    }
}
