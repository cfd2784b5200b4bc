//! The five idempotent keyslot-operation task handlers (§4.5). Each reads
//! its task's `keyslots` and kind-specific attributes, diffs against what
//! the backend reports already exists on the container, and acts only on
//! the delta — re-running a handler with identical inputs must produce no
//! new backend side effects.

mod add_protected_keys;
mod add_recovery_keys;
mod change_auth;
mod remove_keys;
mod rename_keys;

pub use add_protected_keys::AddProtectedKeysHandler;
pub use add_recovery_keys::AddRecoveryKeysHandler;
pub use change_auth::ChangeAuthHandler;
pub use remove_keys::RemoveKeysHandler;
pub use rename_keys::RenameKeysHandler;

pub const ADD_RECOVERY_KEYS_TASK_KIND: &str = "fde-add-recovery-keys";
pub const REMOVE_KEYS_TASK_KIND: &str = "fde-remove-keys";
pub const RENAME_KEYS_TASK_KIND: &str = "fde-rename-keys";
pub const CHANGE_AUTH_TASK_KIND: &str = "fde-change-auth";
pub const ADD_PROTECTED_KEYS_TASK_KIND: &str = "fde-add-protected-keys";
pub const REPLACE_RECOVERY_KEY_TASK_KIND: &str = "fde-replace-recovery-key";

use fde_shared::KeyslotRef;

use crate::engine::TaskInfo;
use crate::error::{FdeError, Result};

pub(crate) fn keyslots_of(task: &TaskInfo) -> Vec<KeyslotRef> {
    task.keyslots.clone()
}

pub(crate) fn attr<T: serde::de::DeserializeOwned>(task: &TaskInfo, key: &str) -> Result<T> {
    task.attrs
        .get::<T>(key)
        .ok_or_else(|| FdeError::InvalidTransition(format!("task missing required attribute {key:?}")))
}
