//! `DbxCoordinator` (§4.4): the three synchronous entry points that track
//! an EFI Secure Boot DBX update across process boundaries and reboots,
//! plus the two task handlers (`T1`, `T2`) that back them.

use std::sync::Arc;

use fde_shared::{ChangeConflictError, ContainerRole, ExtStatus, ExternalOperation};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::cache::ManagerState;
use crate::config::ManagerConfig;
use crate::conflict::{ConflictDetector, SnapSubsystem, DBX_CHANGE_KIND};
use crate::ctx::HandlerCtx;
use crate::engine::{ChangeId, TaskEngine, TaskHandler, TaskInfo, TaskSpec};
use crate::error::{FdeError, Result};
use crate::reseal;

pub const PREPARE_TASK_KIND: &str = "efi-secureboot-db-update-prepare";
pub use crate::blocker::DBX_UPDATE_TASK_KIND as UPDATE_TASK_KIND;

/// `ExternalOperation::context` for a DBX update (§4.4 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbxContext {
    payload: Vec<u8>,
    sealing_method: String,
}

pub struct DbxCoordinator {
    engine: Arc<dyn TaskEngine>,
    backend: Arc<dyn Backend>,
    manager_state: Arc<ManagerState>,
    config: Arc<ManagerConfig>,
    snap: Option<Arc<dyn SnapSubsystem>>,
}

impl DbxCoordinator {
    pub fn new(
        engine: Arc<dyn TaskEngine>,
        backend: Arc<dyn Backend>,
        manager_state: Arc<ManagerState>,
        config: Arc<ManagerConfig>,
        snap: Option<Arc<dyn SnapSubsystem>>,
    ) -> Self {
        Self {
            engine,
            backend,
            manager_state,
            config,
            snap,
        }
    }

    /// Registers `T1`/`T2`'s handlers and the task blocker. Call once at
    /// manager construction time.
    pub fn install(&self) {
        self.engine
            .register_handler(PREPARE_TASK_KIND, Arc::new(PrepareHandler));
        self.engine
            .register_handler(UPDATE_TASK_KIND, Arc::new(UpdateHandler));
        self.engine
            .register_blocker(UPDATE_TASK_KIND, crate::blocker::dbx_update_blocker());
    }

    fn ctx(&self) -> HandlerCtx<'_> {
        HandlerCtx::new(
            self.engine.as_ref(),
            self.backend.as_ref(),
            &self.manager_state,
            &self.config,
        )
    }

    /// §4.4 `prepare(db_kind, payload)`.
    pub fn prepare(&self, _db_kind: &str, payload: &[u8]) -> Result<()> {
        let device = self.config.device_path(ContainerRole::SystemData)?;
        if !self.backend.has_sealed_keys(device)? {
            // Step 1: fail fast if no sealed keys exist on disk.
            return Ok(());
        }

        let detector = ConflictDetector::new(self.engine.as_ref(), self.snap.as_deref());
        detector.check_fde_conflict()?;
        detector.check_snap_conflict()?;

        let method = self.config.default_sealing_method.clone();
        let t1 = TaskSpec::new(PREPARE_TASK_KIND);
        let t2 = TaskSpec::new(UPDATE_TASK_KIND).waiting_on([0]);
        let change_id = self.engine.create_change(DBX_CHANGE_KIND, vec![t1, t2]);

        let mut op = ExternalOperation::new(DBX_CHANGE_KIND, change_id.to_string());
        op.status = ExtStatus::Preparing;
        op.set_context(&DbxContext {
            payload: payload.to_vec(),
            sealing_method: method,
        })?;
        let mut add_op = move |store: crate::store::FdeStore<'_>| {
            let mut store = store;
            store.add_operation(op.clone())
        };
        self.engine.with_state(&mut add_op)?;
        self.manager_state.create_waiter(&change_id.0);

        let ctx = self.ctx();
        self.engine.run_change(&change_id, &ctx);

        let status = self
            .manager_state
            .wait_until(&change_id.0, |s| matches!(s, ExtStatus::Doing | ExtStatus::Error));
        match status {
            ExtStatus::Doing => Ok(()),
            ExtStatus::Error => {
                let message = self
                    .engine
                    .with_state(&mut |store| {
                        store
                            .find_first_by_change_id(&change_id.0)
                            .map(|op| op.error_message.clone())
                    })
                    .unwrap_or_default();
                Err(FdeError::Backend(anyhow::anyhow!(
                    "cannot perform initial reseal of keys for DBX update: {message}"
                )))
            }
            _ => unreachable!("wait_until only returns once the predicate matched"),
        }
    }

    /// §4.4 `cleanup()`.
    pub fn cleanup(&self) -> Result<()> {
        let Some(op) = self.pending_op() else {
            return Ok(());
        };
        if op.status == ExtStatus::Preparing {
            return Err(FdeError::ChangeConflict(ChangeConflictError::new(
                DBX_CHANGE_KIND,
                "cannot complete a DBX update that has not finished preparing",
            )
            .with_id(op.change_id.clone())));
        }
        let change_id = ChangeId(op.change_id.clone());
        self.advance(&change_id, ExtStatus::Completing)?;
        let ctx = self.ctx();
        self.engine.run_change(&change_id, &ctx);
        self.finish(&change_id, ExtStatus::Done)
    }

    /// §4.4 `startup()`, called once at process start.
    pub fn startup(&self) -> Result<()> {
        let Some(op) = self.pending_op() else {
            return Ok(());
        };
        let change_id = ChangeId(op.change_id.clone());
        self.advance(&change_id, ExtStatus::Aborting)?;
        let ctx = self.ctx();
        self.engine.force_task_error(
            &change_id,
            UPDATE_TASK_KIND,
            "'startup' action invoked while an operation is in progress",
            &ctx,
        );
        // Ending in `Error` is the *designed* outcome of the abort path
        // (§3's only edge out of `Aborting`); only a second, genuine
        // failure inside T1's undo (chained into the message) should
        // surface as an error from `startup` itself.
        self.finish(&change_id, ExtStatus::Error)
    }

    fn pending_op(&self) -> Option<ExternalOperation> {
        self.engine
            .with_state(&mut |store| store.find_first_pending_by_kind(DBX_CHANGE_KIND).cloned())
    }

    fn advance(&self, change_id: &ChangeId, status: ExtStatus) -> Result<()> {
        self.engine
            .with_state(&mut |mut store| store.update_operation(DBX_CHANGE_KIND, &change_id.0, |op| op.status = status))?;
        self.manager_state.signal(&change_id.0, status);
        Ok(())
    }

    /// Blocks until the change is ready, then removes the operation and the
    /// waiter exactly once (§9 open-question resolution). `success_status`
    /// is the terminal `ExtStatus` this call is trying to reach — `Done`
    /// for `cleanup`, `Error` for `startup` (forced abort succeeding *is*
    /// ending in `Error`). A message chained with "also failed" (T1's undo
    /// itself erroring) always surfaces as a real failure.
    fn finish(&self, change_id: &ChangeId, success_status: ExtStatus) -> Result<()> {
        let status = self.manager_state.wait_until(&change_id.0, |s| s.is_ready());
        let message = self.engine.with_state(&mut |mut store| {
            let message = store
                .find_first_by_change_id(&change_id.0)
                .map(|op| op.error_message.clone())
                .unwrap_or_default();
            store.remove_operation(DBX_CHANGE_KIND, &change_id.0);
            message
        });
        self.manager_state.remove_waiter(&change_id.0);
        self.engine.cleanup_change(change_id);
        if status == success_status && !message.contains("also failed") {
            Ok(())
        } else {
            Err(FdeError::Backend(anyhow::anyhow!(message)))
        }
    }
}

/// `T1`: `efi-secureboot-db-update-prepare`.
struct PrepareHandler;

impl TaskHandler for PrepareHandler {
    fn do_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        let change_id = task.change.0.clone();
        let dbx_ctx: DbxContext = ctx
            .engine
            .with_state(&mut |store| store.find_first_by_change_id(&change_id).map(|op| op.context_as::<DbxContext>()))
            .ok_or_else(|| FdeError::InvalidTransition(format!("no pending DBX operation for change {change_id}")))??;

        match reseal::reseal_for_dbx_update(ctx, &dbx_ctx.sealing_method, &dbx_ctx.payload) {
            Ok(()) => {
                ctx.engine.with_state(&mut |mut store| {
                    store.update_operation(DBX_CHANGE_KIND, &change_id, |op| op.status = ExtStatus::Doing)
                })?;
                ctx.manager_state.signal(&change_id, ExtStatus::Doing);
                Ok(())
            }
            Err(e) => {
                let message = format!("{e:#}");
                ctx.engine.with_state(&mut |mut store| {
                    let _ = store.update_operation(DBX_CHANGE_KIND, &change_id, |op| {
                        op.status = ExtStatus::Error;
                        op.error_message = message.clone();
                    });
                });
                ctx.manager_state.signal(&change_id, ExtStatus::Error);
                Err(FdeError::Backend(e))
            }
        }
    }

    fn undo_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        let change_id = task.change.0.clone();
        let method = ctx.config.default_sealing_method.clone();
        match reseal::reseal_for_boot_chains(ctx, &method, true) {
            Ok(()) => {
                ctx.engine.with_state(&mut |mut store| {
                    let _ = store.update_operation(DBX_CHANGE_KIND, &change_id, |op| op.status = ExtStatus::Error);
                });
                ctx.manager_state.signal(&change_id, ExtStatus::Error);
                Ok(())
            }
            Err(e) => {
                ctx.engine.with_state(&mut |mut store| {
                    let _ = store.update_operation(DBX_CHANGE_KIND, &change_id, |op| {
                        op.status = ExtStatus::Error;
                        op.error_message = format!("{}; undo reseal also failed: {e:#}", op.error_message);
                    });
                });
                ctx.manager_state.signal(&change_id, ExtStatus::Error);
                Err(FdeError::Backend(e))
            }
        }
    }
}

/// `T2`: `efi-secureboot-db-update`. Gated by [`crate::blocker::dbx_update_blocker`]
/// until the coordinator advances the operation past `Doing`. Only ever
/// actually runs `do_task` along the cleanup path — the abort path forces
/// it straight to `Error` via `TaskEngine::force_task_error`.
struct UpdateHandler;

impl TaskHandler for UpdateHandler {
    fn do_task(&self, task: &TaskInfo, ctx: &HandlerCtx<'_>) -> Result<()> {
        let change_id = task.change.0.clone();
        let method = ctx.config.default_sealing_method.clone();
        reseal::reseal_for_boot_chains(ctx, &method, true).map_err(FdeError::Backend)?;
        ctx.engine
            .with_state(&mut |mut store| store.update_operation(DBX_CHANGE_KIND, &change_id, |op| op.status = ExtStatus::Done))?;
        ctx.manager_state.signal(&change_id, ExtStatus::Done);
        Ok(())
    }
}
