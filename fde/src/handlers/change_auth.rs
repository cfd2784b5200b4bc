//! `change-auth` (§4.5). Only `passphrase` is implemented; `pin` and `none`
//! fail as internal errors.

use std::path::Path;

use fde_shared::KeyslotRef;

use crate::ctx::HandlerCtx;
use crate::engine::{TaskHandler, TaskInfo};
use crate::error::{FdeError, Result};

use super::attr;

pub struct ChangeAuthHandler;

impl TaskHandler for ChangeAuthHandler {
    fn do_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        let auth_mode: String = attr(task, "auth-mode")?;
        if auth_mode != "passphrase" {
            return Err(FdeError::Unimplemented(format!(
                "change-auth does not support auth mode {auth_mode:?}"
            )));
        }
        let keyslots = super::keyslots_of(task);
        // Absence on retry means the process restarted mid-task: fatal,
        // there is nothing left to drive the change forward with.
        let (old, new) = ctx.manager_state.auth_pair(&task.change.0)?;

        let mut changed = Vec::new();
        for slot in &keyslots {
            let device = ctx.config.device_path(slot.container_role)?;
            if let Err(e) = apply_one(ctx, device, slot, &old, &new) {
                for done in changed.iter().rev() {
                    if let Ok(done_device) = ctx.config.device_path(done.container_role) {
                        undo_one(ctx, done_device, done, &new, &old);
                    }
                }
                // Retained on failure so a retry can find the same pair (§4.5).
                return Err(FdeError::Backend(e.context(format!("cannot change passphrase for keyslot {slot}"))));
            }
            changed.push(slot.clone());
        }
        ctx.manager_state.clear_auth_pair(&task.change.0);
        Ok(())
    }
}

fn apply_one(ctx: &HandlerCtx<'_>, device: &Path, slot: &KeyslotRef, old: &str, new: &str) -> anyhow::Result<()> {
    let mut handle = ctx.backend.read_container_key_data(device, slot)?;
    handle.change_passphrase(old, new)?;
    handle.write_token_atomic(device, slot)?;
    Ok(())
}

fn undo_one(ctx: &HandlerCtx<'_>, device: &Path, slot: &KeyslotRef, new: &str, old: &str) {
    if let Err(e) = apply_one(ctx, device, slot, new, old) {
        log::warn!("undo of change-auth: failed to revert slot {slot}: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_passphrase_mode_is_unimplemented() {
        let task = crate::engine::TaskInfo {
            change: crate::engine::ChangeId("c1".into()),
            kind: super::super::CHANGE_AUTH_TASK_KIND.to_string(),
            keyslots: vec![],
            attrs: crate::engine::TaskAttrs::new().with("auth-mode", &"pin".to_string()),
            status: crate::engine::TaskStatus::Pending,
        };
        let mode: String = attr(&task, "auth-mode").unwrap();
        assert_ne!(mode, "passphrase");
    }
}
