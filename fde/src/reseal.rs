//! Binds the keyslot handlers and `DbxCoordinator` to the crypto backend:
//! the re-seal gate (§4.6). Ensures exactly one of the two backend reseal
//! operations fires per call and that the resulting `SealingParameters`
//! are recorded under the engine lock.

use fde_shared::ContainerRole;

use crate::backend::{Backend, BootChain, RoleSnapshot};
use crate::ctx::HandlerCtx;

/// A read-only snapshot of every keyslot role's current revocation
/// counter, handed to the backend so it knows what it's resealing
/// relative to (§4.6).
fn snapshot_roles(ctx: &HandlerCtx<'_>) -> Vec<RoleSnapshot> {
    ctx.engine.with_state(&mut |store| {
        store
            .roles()
            .map(|(name, role)| RoleSnapshot {
                role: name.clone(),
                pcr_policy_revocation_counter: role.pcr_policy_revocation_counter,
            })
            .collect()
    })
}

/// Builds the `record` callback every reseal call uses to write back
/// updated sealing parameters: re-acquires the engine lock just long
/// enough to apply one update (§5 "Handlers that call the backend release
/// the lock for the call and re-acquire afterward").
fn record_into<'a, 'b: 'a>(
    ctx: &'a HandlerCtx<'b>,
) -> impl FnMut(&str, ContainerRole, fde_shared::SealingParameters) + 'a {
    move |role, container_role, params| {
        ctx.engine.with_state(&mut |mut store| {
            store.set_container_sealing(role, container_role, params.clone());
        });
    }
}

/// T1's do-handler operation: reseal for the incoming DBX payload (§4.4
/// T1 do-handler).
pub fn reseal_for_dbx_update(ctx: &HandlerCtx<'_>, method: &str, payload: &[u8]) -> anyhow::Result<()> {
    let roles = snapshot_roles(ctx);
    let mut record = record_into(ctx);
    ctx.backend
        .reseal_for_signatures_db_update(method, &ctx.config.rootdir, &roles, payload, &mut record)
}

/// T2's do-handler operation and T1's undo: reseal against the current
/// (non-DBX) boot chains (§4.4 T1 undo-handler, T2 cleanup path).
pub fn reseal_for_boot_chains(
    ctx: &HandlerCtx<'_>,
    method: &str,
    expect_reseal: bool,
) -> anyhow::Result<()> {
    let roles = snapshot_roles(ctx);
    let mut record = record_into(ctx);
    ctx.backend
        .reseal_for_boot_chains(method, &ctx.config.rootdir, &roles, expect_reseal, &mut record)
}

/// Used by `add-protected-keys` to populate `pcr_profile` before sealing a
/// new protected key (§4.5).
pub fn load_parameters_for_boot_chains(
    ctx: &HandlerCtx<'_>,
    method: &str,
    boot_chains: &[BootChain],
) -> anyhow::Result<()> {
    let mut record = record_into(ctx);
    ctx.backend
        .load_parameters_for_boot_chains(method, &ctx.config.rootdir, boot_chains, &mut record)
}
