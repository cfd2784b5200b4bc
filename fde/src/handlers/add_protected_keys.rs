//! `add-protected-keys` (§4.5).

use std::collections::BTreeMap;

use fde_shared::KeyslotRef;

use crate::backend::{BootChain, ProtectKeyParams};
use crate::ctx::HandlerCtx;
use crate::engine::{TaskHandler, TaskInfo};
use crate::error::{FdeError, Result};
use crate::indicator;
use crate::reseal;

use super::attr;

pub struct AddProtectedKeysHandler;

impl TaskHandler for AddProtectedKeysHandler {
    fn do_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        if indicator::unlocked_with_recovery_key(&ctx.config.rootdir)? {
            return Err(FdeError::InvalidTransition(
                "cannot add protected keys: host was unlocked with a recovery key this boot".to_string(),
            ));
        }

        let auth_mode: String = attr(task, "auth-mode")?;
        if auth_mode != "passphrase" {
            return Err(FdeError::Unimplemented(format!(
                "add-protected-keys does not support auth mode {auth_mode:?}"
            )));
        }
        let keyslots = super::keyslots_of(task);
        // map key is KeyslotRef::string_form — serde_json map keys must be
        // strings, same convention as rename-keys's `renames` attribute.
        let roles: BTreeMap<String, Vec<String>> = attr(task, "roles")?;
        let volumes_auth_key = task.change.0.clone();
        let volumes_auth = ctx.manager_state.volumes_auth(&volumes_auth_key)?;

        let boot_chains: Vec<BootChain> = ctx.engine.with_state(&mut |store| {
            keyslots
                .iter()
                .filter_map(|slot| {
                    let role_name = roles.get(&slot.string_form())?.first()?;
                    let boot_modes = store
                        .role(role_name)
                        .and_then(|r| r.containers.get(&slot.container_role))
                        .map(|c| c.boot_modes.clone())
                        .unwrap_or_default();
                    Some(BootChain {
                        container_role: slot.container_role,
                        boot_modes,
                    })
                })
                .collect()
        });
        let method = ctx.config.default_sealing_method.clone();
        reseal::load_parameters_for_boot_chains(ctx, &method, &boot_chains).map_err(FdeError::Backend)?;

        let mut added = Vec::new();
        for slot in &keyslots {
            let role_names = roles
                .get(&slot.string_form())
                .ok_or_else(|| FdeError::InvalidTransition(format!("keyslot {slot} maps to no role")))?;
            if role_names.len() != 1 {
                return Err(FdeError::InvalidTransition(format!(
                    "keyslot {slot} must map to exactly one role, got {}",
                    role_names.len()
                )));
            }
            let role_name = &role_names[0];
            let device = ctx.config.device_path(slot.container_role)?;
            let existing = ctx.backend.list_container_unlock_key_names(device)?;
            if existing.contains(&slot.name) {
                continue;
            }
            let pcr_profile = ctx
                .engine
                .with_state(&mut |store| {
                    store
                        .role(role_name)
                        .and_then(|r| r.containers.get(&slot.container_role))
                        .map(|c| c.pcr_profile.clone())
                })
                .unwrap_or_default();
            let params = ProtectKeyParams {
                pcr_profile,
                pcr_handle: 0,
                volumes_auth: volumes_auth.clone(),
            };
            if let Err(e) = ctx.backend.add_container_tpm_protected_key(device, slot, &params) {
                for done in &added {
                    rollback_one(ctx, done);
                }
                return Err(FdeError::Backend(e.context(format!("cannot add protected key slot ({slot})"))));
            }
            added.push(slot.clone());
        }
        ctx.manager_state.clear_volumes_auth(&volumes_auth_key);
        Ok(())
    }
}

fn rollback_one(ctx: &HandlerCtx<'_>, slot: &KeyslotRef) {
    let Ok(device) = ctx.config.device_path(slot.container_role) else {
        return;
    };
    if let Err(e) = ctx.backend.delete_container_key(device, slot) {
        log::warn!("undo of add-protected-keys: failed to delete slot {slot}: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_exactly_one_role_per_slot() {
        let mut roles = BTreeMap::new();
        roles.insert("system-data:run".to_string(), vec!["run".to_string(), "recover".to_string()]);
        let task = crate::engine::TaskInfo {
            change: crate::engine::ChangeId("c1".into()),
            kind: super::super::ADD_PROTECTED_KEYS_TASK_KIND.to_string(),
            keyslots: vec![],
            attrs: crate::engine::TaskAttrs::new()
                .with("roles", &roles)
                .with("auth-mode", &"passphrase".to_string()),
            status: crate::engine::TaskStatus::Pending,
        };
        let roles: BTreeMap<String, Vec<String>> = attr(&task, "roles").unwrap();
        assert_eq!(roles.get("system-data:run").unwrap().len(), 2);
    }
}
