//! The narrow interface this crate needs from a pre-existing,
//! dependency-ordered task runner (§2 "TaskEngine (collaborator)"). This
//! crate does not implement a task engine; it defines the contract it
//! needs and, under the `testing` feature, ships an in-memory reference
//! implementation (`crate::testing::FakeEngine`) good enough to exercise
//! every handler and the coordinator against.

use std::collections::BTreeMap;
use std::sync::Arc;

use fde_shared::KeyslotRef;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::store::FdeStore;

/// Opaque handle to one engine-owned change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeId(pub String);

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task's kind-specific attributes, persisted as opaque typed values
/// (§6). Backed by JSON so any serde type can ride through it.
#[derive(Debug, Clone, Default)]
pub struct TaskAttrs(BTreeMap<String, serde_json::Value>);

impl TaskAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Serialize>(mut self, key: &str, value: &T) -> Self {
        self.set(key, value);
        self
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) {
        self.0.insert(
            key.to_string(),
            serde_json::to_value(value).expect("attribute must be JSON-serializable"),
        );
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// One task to be created as part of a change, along with its dependency
/// edges (indices into the same slice passed to
/// [`TaskEngine::create_change`]).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: String,
    pub keyslots: Vec<KeyslotRef>,
    pub attrs: TaskAttrs,
    pub waits_on: Vec<usize>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            keyslots: Vec::new(),
            attrs: TaskAttrs::new(),
            waits_on: Vec::new(),
        }
    }

    pub fn with_keyslots(mut self, keyslots: Vec<KeyslotRef>) -> Self {
        self.keyslots = keyslots;
        self
    }

    pub fn with_attrs(mut self, attrs: TaskAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn waiting_on(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.waits_on = indices.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Blocked,
    Doing,
    Done,
    Error,
    Undone,
}

impl TaskStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Undone)
    }
}

/// A read-only snapshot of one task, as seen by handlers, blockers, and the
/// conflict detector.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub change: ChangeId,
    pub kind: String,
    pub keyslots: Vec<KeyslotRef>,
    pub attrs: TaskAttrs,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    /// At least one task is still pending, blocked, or doing.
    Pending,
    Done,
    Error,
    Undone,
}

impl ChangeStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, ChangeStatus::Done | ChangeStatus::Error | ChangeStatus::Undone)
    }
}

/// A read-only snapshot of one change and its tasks, as seen by the
/// conflict detector (§4.2).
#[derive(Debug, Clone)]
pub struct ChangeInfo {
    pub id: ChangeId,
    pub kind: String,
    pub status: ChangeStatus,
    pub tasks: Vec<TaskInfo>,
}

/// Implemented by this crate's handlers for each registered task kind
/// (§6). `ctx` is the narrow accessor described in §9's "Cyclic
/// state↔engine reference" design note — handlers never hold a reference
/// back to the engine or manager beyond the lifetime of one call.
pub trait TaskHandler: Send + Sync {
    fn do_task(&self, task: &TaskInfo, ctx: &crate::ctx::HandlerCtx<'_>) -> Result<()>;

    /// Runs on change abort or on a downstream task's failure, in reverse
    /// dependency order. Default: nothing to undo.
    fn undo_task(&self, task: &TaskInfo, ctx: &crate::ctx::HandlerCtx<'_>) -> Result<()> {
        let _ = (task, ctx);
        Ok(())
    }
}

/// A task-blocking predicate (§4.3): returns `true` while `task` must not
/// run yet. Consulted once per scheduling tick; the engine defers
/// execution without consuming the task.
pub type TaskBlockerFn = dyn Fn(&TaskInfo, &dyn TaskEngine) -> bool + Send + Sync;

/// The contract this crate needs from a pre-existing task engine (§2, §5).
pub trait TaskEngine: Send + Sync {
    /// Runs `f` with exclusive access to the persisted FDE state (§5's
    /// single lock). Must not be called reentrantly from within `f`.
    fn with_state<R>(&self, f: &mut dyn FnMut(FdeStore<'_>) -> R) -> R;

    fn register_handler(&self, kind: &'static str, handler: Arc<dyn TaskHandler>);
    fn register_blocker(&self, kind: &'static str, blocker: Arc<TaskBlockerFn>);

    /// All changes not yet in a terminal status, for conflict scanning
    /// (§4.2).
    fn non_ready_changes(&self) -> Vec<ChangeInfo>;

    fn create_change(&self, kind: &str, tasks: Vec<TaskSpec>) -> ChangeId;

    /// Drives every currently-runnable task of `change` to completion,
    /// stopping when every task is done, blocked, or one has failed (in
    /// which case undo handlers for already-done upstream tasks run in
    /// reverse order before returning). Returns the resulting status.
    fn run_change(&self, change: &ChangeId, ctx: &crate::ctx::HandlerCtx<'_>) -> ChangeStatus;

    fn change_status(&self, change: &ChangeId) -> Option<ChangeStatus>;

    fn task_status(&self, change: &ChangeId, kind: &str) -> Option<TaskStatus>;

    /// Forces one task straight to `Error` with `message`, without running
    /// its handler, then runs the undo chain for anything upstream that
    /// already completed (§4.4 "Startup/abort path"). Used when an
    /// external actor's restart means the task must never actually run.
    fn force_task_error(
        &self,
        change: &ChangeId,
        task_kind: &str,
        message: &str,
        ctx: &crate::ctx::HandlerCtx<'_>,
    ) -> ChangeStatus;

    /// Drops the change's bookkeeping once it is terminal. Idempotent.
    fn cleanup_change(&self, change: &ChangeId);
}
