//! Integration tests reproducing the scenarios in spec §8 (S1–S7), driven
//! against the in-memory `testing` fixtures.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use fde::backend::RecoveryKey;
use fde::cache::ManagerState;
use fde::config::ManagerConfig;
use fde::conflict::{SnapChange, SnapSubsystem, DBX_CHANGE_KIND};
use fde::ctx::HandlerCtx;
use fde::engine::{ChangeId, TaskAttrs, TaskEngine, TaskHandler, TaskInfo, TaskStatus};
use fde::handlers::{AddRecoveryKeysHandler, ADD_RECOVERY_KEYS_TASK_KIND};
use fde::testing::{FakeBackend, FakeEngine, RecordedCall};
use fde::{FdeError, Manager};
use fde_shared::{ContainerRole, ExtStatus, KeyslotRef};

fn config() -> Arc<ManagerConfig> {
    Arc::new(
        ManagerConfig::new("/")
            .with_device_path(ContainerRole::SystemData, "/dev/mapper/ubuntu-data-system-data")
            .with_device_path(ContainerRole::SystemSave, "/dev/mapper/ubuntu-save-system-save"),
    )
}

fn manager(backend: Arc<FakeBackend>) -> (Arc<FakeEngine>, Manager) {
    let engine = Arc::new(FakeEngine::new());
    let manager = Manager::new(engine.clone(), backend, config(), None);
    manager.install();
    (engine, manager)
}

#[test]
fn s1_happy_dbx_update() {
    let backend = Arc::new(FakeBackend::new().with_sealed_keys(true));
    let (engine, manager) = manager(backend.clone());

    manager.prepare("db", b"payload").unwrap();

    assert_eq!(
        backend.call_count(|c| matches!(c, RecordedCall::ResealForSignaturesDbUpdate { payload } if payload == b"payload")),
        1
    );
    let status = engine.with_state(&mut |store| store.find_first_pending_by_kind(DBX_CHANGE_KIND).map(|op| op.status));
    assert_eq!(status, Some(ExtStatus::Doing));

    manager.cleanup().unwrap();
    assert_eq!(backend.call_count(|c| matches!(c, RecordedCall::ResealForBootChains { .. })), 1);
    let status = engine.with_state(&mut |store| store.find_first_pending_by_kind(DBX_CHANGE_KIND).map(|op| op.status));
    assert_eq!(status, None);
}

#[test]
fn s2_dbx_self_conflict() {
    let backend = Arc::new(FakeBackend::new().with_sealed_keys(true));
    let (_engine, manager) = manager(backend);
    manager.prepare("db", b"payload").unwrap();

    let err = manager.prepare("db", b"payload").unwrap_err();
    match err {
        FdeError::ChangeConflict(c) => {
            assert_eq!(c.kind, DBX_CHANGE_KIND);
            assert!(c.message.contains("cannot start a new DBX update"), "{}", c.message);
        }
        other => panic!("expected ChangeConflict, got {other:?}"),
    }
}

struct FakeSnap {
    conflict: Option<SnapChange>,
}

impl SnapSubsystem for FakeSnap {
    fn conflicting_snap_change(&self) -> Option<SnapChange> {
        self.conflict.clone()
    }
}

#[test]
fn s3_snap_conflict() {
    let backend = Arc::new(FakeBackend::new().with_sealed_keys(true));
    let engine = Arc::new(FakeEngine::new());
    let snap = Arc::new(FakeSnap {
        conflict: Some(SnapChange {
            kind: "kernel-snap-remove".to_string(),
            snap_name: "pc-kernel".to_string(),
        }),
    });
    let manager = Manager::new(engine.clone(), backend.clone(), config(), Some(snap));
    manager.install();

    let err = manager.prepare("db", b"payload").unwrap_err();
    match err {
        FdeError::ChangeConflict(c) => {
            assert_eq!(c.kind, "kernel-snap-remove");
            assert_eq!(c.snap.as_deref(), Some("pc-kernel"));
        }
        other => panic!("expected ChangeConflict, got {other:?}"),
    }
    assert_eq!(backend.call_count(|c| matches!(c, RecordedCall::ResealForSignaturesDbUpdate { .. })), 0);
}

#[test]
fn s4_startup_aborts_mid_update() {
    let backend = Arc::new(FakeBackend::new().with_sealed_keys(true));
    let (engine, manager) = manager(backend.clone());
    manager.prepare("db", b"payload").unwrap();

    manager.startup().unwrap();

    assert_eq!(backend.call_count(|c| matches!(c, RecordedCall::ResealForBootChains { .. })), 1);
    let status = engine.with_state(&mut |store| store.find_first_pending_by_kind(DBX_CHANGE_KIND).map(|op| op.status));
    assert_eq!(status, None);
}

#[test]
fn s5_forward_reseal_fails() {
    let backend = Arc::new(FakeBackend::new().with_sealed_keys(true));
    backend.fail_next_reseal_for_signatures_db_update();
    let (_engine, manager) = manager(backend.clone());

    let err = manager.prepare("db", b"payload").unwrap_err();
    let message = err.to_string();
    assert!(
        message.starts_with("cannot perform initial reseal of keys for DBX update"),
        "{message}"
    );
    assert_eq!(backend.call_count(|c| matches!(c, RecordedCall::ResealForBootChains { .. })), 0);
}

fn recovery_keyslots() -> Vec<KeyslotRef> {
    vec![
        KeyslotRef::new(ContainerRole::SystemData, "r1"),
        KeyslotRef::new(ContainerRole::SystemData, "r2"),
        KeyslotRef::new(ContainerRole::SystemSave, "r3"),
        KeyslotRef::new(ContainerRole::SystemSave, "r4"),
    ]
}

#[test]
fn s6_idempotent_add_recovery_keys() {
    let backend = Arc::new(FakeBackend::new());
    let engine = Arc::new(FakeEngine::new());
    let manager_state = ManagerState::new();
    let config = config();
    manager_state.cache_recovery_key("id-1", RecoveryKey(b"secret".to_vec()), Duration::from_secs(60));

    let refs = recovery_keyslots();
    backend.preload_recovery_key(config.device_path(ContainerRole::SystemData).unwrap(), "r1");

    let task = TaskInfo {
        change: ChangeId("c1".into()),
        kind: ADD_RECOVERY_KEYS_TASK_KIND.to_string(),
        keyslots: refs,
        attrs: TaskAttrs::new().with("recovery-key-id", &"id-1".to_string()),
        status: TaskStatus::Pending,
    };
    let ctx = HandlerCtx::new(engine.as_ref(), backend.as_ref(), &manager_state, &config);
    let handler = AddRecoveryKeysHandler;
    for _ in 0..3 {
        handler.do_task(&task, &ctx).unwrap();
    }

    assert_eq!(
        backend.call_count(|c| matches!(c, RecordedCall::AddContainerRecoveryKey { .. })),
        3
    );
}

#[test]
fn s7_partial_add_with_rollback() {
    let backend = Arc::new(FakeBackend::new());
    let engine = Arc::new(FakeEngine::new());
    let manager_state = ManagerState::new();
    let config = config();
    manager_state.cache_recovery_key("id-1", RecoveryKey(b"secret".to_vec()), Duration::from_secs(60));

    let refs = vec![
        KeyslotRef::new(ContainerRole::SystemData, "r1"),
        KeyslotRef::new(ContainerRole::SystemData, "r2"),
        KeyslotRef::new(ContainerRole::SystemData, "r3"),
        KeyslotRef::new(ContainerRole::SystemData, "r4"),
    ];
    backend.fail_add_recovery_key(refs[2].clone());

    let task = TaskInfo {
        change: ChangeId("c1".into()),
        kind: ADD_RECOVERY_KEYS_TASK_KIND.to_string(),
        keyslots: refs.clone(),
        attrs: TaskAttrs::new().with("recovery-key-id", &"id-1".to_string()),
        status: TaskStatus::Pending,
    };
    let ctx = HandlerCtx::new(engine.as_ref(), backend.as_ref(), &manager_state, &config);
    let handler = AddRecoveryKeysHandler;
    let err = handler.do_task(&task, &ctx).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cannot add recovery key slot"), "{message}");
    assert!(message.contains(&refs[2].to_string()), "{message}");

    assert_eq!(
        backend.call_count(|c| matches!(c, RecordedCall::AddContainerRecoveryKey { .. })),
        3
    );
    assert_eq!(backend.call_count(|c| matches!(c, RecordedCall::DeleteContainerKey { .. })), 2);
}
