//! `Manager`: the crate's single wiring point. Owns the collaborators,
//! installs every task handler and blocker, and exposes the four public
//! entry points of §6.

use std::sync::Arc;

use fde_shared::{ContainerRole, ExtStatus, ExternalOperation, KeyslotRef};

use crate::backend::{Backend, RecoveryKey};
use crate::cache::ManagerState;
use crate::config::ManagerConfig;
use crate::conflict::{ConflictDetector, SnapSubsystem, REPLACE_RECOVERY_KEY_CHANGE_KIND};
use crate::ctx::HandlerCtx;
use crate::dbx::DbxCoordinator;
use crate::engine::{ChangeStatus, TaskAttrs, TaskEngine, TaskSpec};
use crate::error::{FdeError, Result};
use crate::handlers::{
    AddProtectedKeysHandler, AddRecoveryKeysHandler, ChangeAuthHandler, RemoveKeysHandler, RenameKeysHandler,
    ADD_PROTECTED_KEYS_TASK_KIND, ADD_RECOVERY_KEYS_TASK_KIND, CHANGE_AUTH_TASK_KIND, REMOVE_KEYS_TASK_KIND,
    RENAME_KEYS_TASK_KIND, REPLACE_RECOVERY_KEY_TASK_KIND,
};

pub struct Manager {
    engine: Arc<dyn TaskEngine>,
    backend: Arc<dyn Backend>,
    manager_state: Arc<ManagerState>,
    config: Arc<ManagerConfig>,
    snap: Option<Arc<dyn SnapSubsystem>>,
    dbx: DbxCoordinator,
}

impl Manager {
    pub fn new(
        engine: Arc<dyn TaskEngine>,
        backend: Arc<dyn Backend>,
        config: Arc<ManagerConfig>,
        snap: Option<Arc<dyn SnapSubsystem>>,
    ) -> Self {
        let manager_state = Arc::new(ManagerState::new());
        let dbx = DbxCoordinator::new(
            engine.clone(),
            backend.clone(),
            manager_state.clone(),
            config.clone(),
            snap.clone(),
        );
        Self {
            engine,
            backend,
            manager_state,
            config,
            snap,
            dbx,
        }
    }

    /// Registers every task handler and blocker this crate owns. Call once,
    /// before the engine starts scheduling.
    pub fn install(&self) {
        self.dbx.install();
        self.engine.register_handler(ADD_RECOVERY_KEYS_TASK_KIND, Arc::new(AddRecoveryKeysHandler));
        self.engine
            .register_handler(REPLACE_RECOVERY_KEY_TASK_KIND, Arc::new(AddRecoveryKeysHandler));
        self.engine.register_handler(REMOVE_KEYS_TASK_KIND, Arc::new(RemoveKeysHandler));
        self.engine.register_handler(RENAME_KEYS_TASK_KIND, Arc::new(RenameKeysHandler));
        self.engine.register_handler(CHANGE_AUTH_TASK_KIND, Arc::new(ChangeAuthHandler));
        self.engine
            .register_handler(ADD_PROTECTED_KEYS_TASK_KIND, Arc::new(AddProtectedKeysHandler));
    }

    fn ctx(&self) -> HandlerCtx<'_> {
        HandlerCtx::new(self.engine.as_ref(), self.backend.as_ref(), &self.manager_state, &self.config)
    }

    /// §6 entry point: start tracking an EFI Secure Boot DBX update.
    pub fn prepare(&self, db_kind: &str, payload: &[u8]) -> Result<()> {
        self.dbx.prepare(db_kind, payload)
    }

    /// §6 entry point: the external DBX manager reports success.
    pub fn cleanup(&self) -> Result<()> {
        self.dbx.cleanup()
    }

    /// §6 entry point: called once at process start to roll back any
    /// update interrupted by a restart.
    pub fn startup(&self) -> Result<()> {
        self.dbx.startup()
    }

    /// §6 entry point: generate and install a replacement recovery key
    /// across both containers' default recovery slot.
    pub fn add_recovery_key_change(&self, method: &str, payload: &[u8]) -> (ExternalOperation, Result<()>) {
        let detector = ConflictDetector::new(self.engine.as_ref(), self.snap.as_deref());
        if let Err(e) = detector.check_fde_conflict() {
            return (
                ExternalOperation::new(REPLACE_RECOVERY_KEY_CHANGE_KIND, ""),
                Err(FdeError::ChangeConflict(e)),
            );
        }

        let recovery_key_id = format!("{method}-recovery-key");
        let keyslots = vec![
            KeyslotRef::default_recovery(ContainerRole::SystemData),
            KeyslotRef::default_recovery(ContainerRole::SystemSave),
        ];
        if let Err(e) = detector.check_keyslot_conflict(&keyslots) {
            return (
                ExternalOperation::new(REPLACE_RECOVERY_KEY_CHANGE_KIND, ""),
                Err(FdeError::ChangeConflict(e)),
            );
        }
        let task = TaskSpec::new(REPLACE_RECOVERY_KEY_TASK_KIND)
            .with_keyslots(keyslots)
            .with_attrs(TaskAttrs::new().with("recovery-key-id", &recovery_key_id));
        let change_id = self.engine.create_change(REPLACE_RECOVERY_KEY_CHANGE_KIND, vec![task]);
        self.manager_state
            .cache_recovery_key(&recovery_key_id, RecoveryKey(payload.to_vec()), self.config.recovery_key_cache_ttl);

        let mut op = ExternalOperation::new(REPLACE_RECOVERY_KEY_CHANGE_KIND, change_id.to_string());
        op.status = ExtStatus::Doing;
        if let Err(e) = self.engine.with_state(&mut |mut store| store.add_operation(op.clone())) {
            return (op, Err(e));
        }

        let ctx = self.ctx();
        let status = self.engine.run_change(&change_id, &ctx);
        let message = self
            .engine
            .with_state(&mut |mut store| {
                let message = store
                    .find_first_by_change_id(&change_id.0)
                    .map(|o| o.error_message.clone())
                    .unwrap_or_default();
                store.remove_operation(REPLACE_RECOVERY_KEY_CHANGE_KIND, &change_id.0);
                message
            });
        self.engine.cleanup_change(&change_id);

        let result = match status {
            ChangeStatus::Done => {
                op.status = ExtStatus::Done;
                Ok(())
            }
            _ => {
                op.status = ExtStatus::Error;
                op.error_message = message;
                Err(FdeError::Backend(anyhow::anyhow!(op.error_message.clone())))
            }
        };
        (op, result)
    }
}
