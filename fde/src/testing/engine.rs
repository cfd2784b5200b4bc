//! [`FakeEngine`]: an in-memory, single-process reference [`TaskEngine`].
//! Good enough to run this crate's own change graphs (a handful of tasks,
//! one or two levels of dependency) to completion; makes no attempt at
//! true concurrency or crash recovery.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use fde_shared::KeyslotRef;

use crate::ctx::HandlerCtx;
use crate::engine::{
    ChangeId, ChangeInfo, ChangeStatus, TaskAttrs, TaskBlockerFn, TaskEngine, TaskHandler, TaskInfo, TaskSpec,
    TaskStatus,
};
use crate::store::{FdeState, FdeStore};

#[derive(Clone)]
struct TaskRecord {
    kind: String,
    keyslots: Vec<KeyslotRef>,
    attrs: TaskAttrs,
    waits_on: Vec<usize>,
    status: TaskStatus,
}

struct ChangeRecord {
    kind: String,
    tasks: Vec<TaskRecord>,
    status: ChangeStatus,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FdeState>,
    changes: Mutex<BTreeMap<ChangeId, ChangeRecord>>,
    handlers: Mutex<HashMap<String, Arc<dyn TaskHandler>>>,
    blockers: Mutex<HashMap<String, Arc<TaskBlockerFn>>>,
    next_id: Mutex<u64>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_runnable(&self, change: &ChangeId, ctx: &HandlerCtx<'_>) -> Option<(usize, TaskInfo)> {
        let snapshot: Vec<TaskRecord> = self.changes.lock().unwrap().get(change)?.tasks.clone();
        for (idx, task) in snapshot.iter().enumerate() {
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
                continue;
            }
            let deps_done = task.waits_on.iter().all(|&i| snapshot[i].status == TaskStatus::Done);
            if !deps_done {
                continue;
            }
            let info = TaskInfo {
                change: change.clone(),
                kind: task.kind.clone(),
                keyslots: task.keyslots.clone(),
                attrs: task.attrs.clone(),
                status: task.status,
            };
            let blocker = self.blockers.lock().unwrap().get(&task.kind).cloned();
            if blocker.map(|b| b(&info, ctx.engine)).unwrap_or(false) {
                continue;
            }
            return Some((idx, info));
        }
        None
    }

    fn run_undo_chain(&self, change: &ChangeId, failed_idx: usize, ctx: &HandlerCtx<'_>) {
        let snapshot: Vec<TaskRecord> = match self.changes.lock().unwrap().get(change) {
            Some(record) => record.tasks.clone(),
            None => return,
        };
        for idx in (0..failed_idx).rev() {
            let task = &snapshot[idx];
            if task.status != TaskStatus::Done {
                continue;
            }
            let handler = self.handlers.lock().unwrap().get(&task.kind).cloned();
            if let Some(handler) = handler {
                let info = TaskInfo {
                    change: change.clone(),
                    kind: task.kind.clone(),
                    keyslots: task.keyslots.clone(),
                    attrs: task.attrs.clone(),
                    status: task.status,
                };
                if let Err(e) = handler.undo_task(&info, ctx) {
                    log::warn!("undo handler for task {} (change {}) failed: {e:#}", task.kind, change);
                }
            }
            self.changes.lock().unwrap().get_mut(change).unwrap().tasks[idx].status = TaskStatus::Undone;
        }
    }
}

impl TaskEngine for FakeEngine {
    fn with_state<R>(&self, f: &mut dyn FnMut(FdeStore<'_>) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(FdeStore::new(&mut state))
    }

    fn register_handler(&self, kind: &'static str, handler: Arc<dyn TaskHandler>) {
        self.handlers.lock().unwrap().insert(kind.to_string(), handler);
    }

    fn register_blocker(&self, kind: &'static str, blocker: Arc<TaskBlockerFn>) {
        self.blockers.lock().unwrap().insert(kind.to_string(), blocker);
    }

    fn non_ready_changes(&self) -> Vec<ChangeInfo> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, record)| !record.status.is_ready())
            .map(|(id, record)| ChangeInfo {
                id: id.clone(),
                kind: record.kind.clone(),
                status: record.status,
                tasks: record
                    .tasks
                    .iter()
                    .map(|t| TaskInfo {
                        change: id.clone(),
                        kind: t.kind.clone(),
                        keyslots: t.keyslots.clone(),
                        attrs: t.attrs.clone(),
                        status: t.status,
                    })
                    .collect(),
            })
            .collect()
    }

    fn create_change(&self, kind: &str, tasks: Vec<TaskSpec>) -> ChangeId {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            ChangeId(format!("change-{}", *next_id))
        };
        let records = tasks
            .into_iter()
            .map(|t| TaskRecord {
                kind: t.kind,
                keyslots: t.keyslots,
                attrs: t.attrs,
                waits_on: t.waits_on,
                status: TaskStatus::Pending,
            })
            .collect();
        self.changes.lock().unwrap().insert(
            id.clone(),
            ChangeRecord {
                kind: kind.to_string(),
                tasks: records,
                status: ChangeStatus::Pending,
            },
        );
        id
    }

    fn run_change(&self, change: &ChangeId, ctx: &HandlerCtx<'_>) -> ChangeStatus {
        loop {
            {
                let changes = self.changes.lock().unwrap();
                match changes.get(change) {
                    Some(record) if record.status.is_ready() => return record.status,
                    Some(_) => {}
                    None => return ChangeStatus::Error,
                }
            }

            let Some((idx, task_info)) = self.find_runnable(change, ctx) else {
                let mut changes = self.changes.lock().unwrap();
                let record = changes.get_mut(change).unwrap();
                if record.tasks.iter().all(|t| t.status == TaskStatus::Done) {
                    record.status = ChangeStatus::Done;
                    return ChangeStatus::Done;
                }
                return record.status;
            };

            let handler = self.handlers.lock().unwrap().get(&task_info.kind).cloned();
            let Some(handler) = handler else {
                log::warn!("no handler registered for task kind {:?}", task_info.kind);
                self.changes.lock().unwrap().get_mut(change).unwrap().tasks[idx].status = TaskStatus::Error;
                self.run_undo_chain(change, idx, ctx);
                self.changes.lock().unwrap().get_mut(change).unwrap().status = ChangeStatus::Error;
                return ChangeStatus::Error;
            };

            match handler.do_task(&task_info, ctx) {
                Ok(()) => {
                    self.changes.lock().unwrap().get_mut(change).unwrap().tasks[idx].status = TaskStatus::Done;
                }
                Err(e) => {
                    log::warn!("task {} (change {}) failed: {e:#}", task_info.kind, change);
                    self.changes.lock().unwrap().get_mut(change).unwrap().tasks[idx].status = TaskStatus::Error;
                    self.run_undo_chain(change, idx, ctx);
                    self.changes.lock().unwrap().get_mut(change).unwrap().status = ChangeStatus::Error;
                    return ChangeStatus::Error;
                }
            }
        }
    }

    fn change_status(&self, change: &ChangeId) -> Option<ChangeStatus> {
        self.changes.lock().unwrap().get(change).map(|r| r.status)
    }

    fn task_status(&self, change: &ChangeId, kind: &str) -> Option<TaskStatus> {
        self.changes
            .lock()
            .unwrap()
            .get(change)
            .and_then(|r| r.tasks.iter().find(|t| t.kind == kind).map(|t| t.status))
    }

    fn force_task_error(&self, change: &ChangeId, task_kind: &str, message: &str, ctx: &HandlerCtx<'_>) -> ChangeStatus {
        let idx = self
            .changes
            .lock()
            .unwrap()
            .get(change)
            .and_then(|r| r.tasks.iter().position(|t| t.kind == task_kind));
        let Some(idx) = idx else {
            return ChangeStatus::Error;
        };
        log::warn!("forcing task {task_kind} (change {change}) to error: {message}");
        self.changes.lock().unwrap().get_mut(change).unwrap().tasks[idx].status = TaskStatus::Error;
        self.run_undo_chain(change, idx, ctx);
        self.changes.lock().unwrap().get_mut(change).unwrap().status = ChangeStatus::Error;
        ChangeStatus::Error
    }

    fn cleanup_change(&self, change: &ChangeId) {
        self.changes.lock().unwrap().remove(change);
    }
}
