//! `TaskBlocker` (§4.3): gates `efi-secureboot-db-update` tasks on the
//! external DBX operation's status.

use std::sync::Arc;

use fde_shared::ExtStatus;

use crate::conflict::DBX_CHANGE_KIND;
use crate::engine::{TaskBlockerFn, TaskEngine, TaskInfo};

pub const DBX_UPDATE_TASK_KIND: &str = "efi-secureboot-db-update";

/// Builds the blocking predicate registered under
/// [`DBX_UPDATE_TASK_KIND`]: blocked while the matching external
/// operation's status is still `Default`, `Preparing`, or `Doing` — i.e.
/// until the DBX manager has signaled completion and the coordinator has
/// advanced it to `Completing` or `Aborting`.
pub fn dbx_update_blocker() -> Arc<TaskBlockerFn> {
    Arc::new(|task: &TaskInfo, engine: &dyn TaskEngine| {
        if task.kind != DBX_UPDATE_TASK_KIND {
            return false;
        }
        engine.with_state(&mut |store| {
            store
                .status_of(DBX_CHANGE_KIND, &task.change.0)
                .map(|status| {
                    matches!(
                        status,
                        ExtStatus::Default | ExtStatus::Preparing | ExtStatus::Doing
                    )
                })
                .unwrap_or(false)
        })
    })
}
