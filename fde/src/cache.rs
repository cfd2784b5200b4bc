//! The process-scoped, non-persisted side-table described in §9 ("Global
//! mutable process state"): secret-material caches and the per-change
//! condition variables `DbxCoordinator` waits on. Modeled as one explicit,
//! lock-guarded struct owned by the manager — never a singleton.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use fde_shared::ExtStatus;

use crate::backend::RecoveryKey;
use crate::error::{FdeError, Result};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

#[derive(Default)]
struct ChangeWaiter {
    status: Mutex<Option<ExtStatus>>,
    condvar: Condvar,
}

#[derive(Default)]
struct Inner {
    recovery_keys: HashMap<String, Expiring<RecoveryKey>>,
    volumes_auth: HashMap<String, Expiring<Vec<u8>>>,
    change_auth_pairs: HashMap<String, (String, String)>,
    waiters: HashMap<String, Arc<ChangeWaiter>>,
}

pub struct ManagerState {
    inner: Mutex<Inner>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    // --- recovery-key cache (§4.5 add-recovery-keys) ---

    pub fn cache_recovery_key(&self, id: &str, key: RecoveryKey, ttl: Duration) {
        self.inner.lock().unwrap().recovery_keys.insert(
            id.to_string(),
            Expiring {
                value: key,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn recovery_key(&self, id: &str) -> Result<RecoveryKey> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.recovery_keys.get(id) {
            None => return Err(FdeError::NotFound(format!("recovery key id {id:?}"))),
            Some(entry) => entry.expires_at < Instant::now(),
        };
        if expired {
            inner.recovery_keys.remove(id);
            return Err(FdeError::Expired(format!("recovery key id {id:?}")));
        }
        Ok(inner.recovery_keys.get(id).unwrap().value.clone())
    }

    // --- volumes-auth cache (§4.5 add-protected-keys, change-auth) ---

    pub fn cache_volumes_auth(&self, key: &str, secret: Vec<u8>, ttl: Duration) {
        self.inner.lock().unwrap().volumes_auth.insert(
            key.to_string(),
            Expiring {
                value: secret,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn volumes_auth(&self, key: &str) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.volumes_auth.get(key) {
            None => return Err(FdeError::NotFound(format!("volumes-auth options {key:?}"))),
            Some(entry) => entry.expires_at < Instant::now(),
        };
        if expired {
            inner.volumes_auth.remove(key);
            return Err(FdeError::Expired(format!("volumes-auth options {key:?}")));
        }
        Ok(inner.volumes_auth.get(key).unwrap().value.clone())
    }

    /// Cleared on full handler success; retained on failure to enable a
    /// retry (§4.5 last paragraph).
    pub fn clear_volumes_auth(&self, key: &str) {
        self.inner.lock().unwrap().volumes_auth.remove(key);
    }

    // --- change-auth old/new passphrase pair (§4.5 change-auth) ---

    pub fn cache_auth_pair(&self, change_id: &str, old: String, new: String) {
        self.inner
            .lock()
            .unwrap()
            .change_auth_pairs
            .insert(change_id.to_string(), (old, new));
    }

    pub fn auth_pair(&self, change_id: &str) -> Result<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .change_auth_pairs
            .get(change_id)
            .cloned()
            .ok_or_else(|| FdeError::StateCorruption(format!("unexpected restart: no cached auth pair for change {change_id:?}")))
    }

    pub fn clear_auth_pair(&self, change_id: &str) {
        self.inner.lock().unwrap().change_auth_pairs.remove(change_id);
    }

    // --- per-change condition variables (§9 "Coroutines/callbacks") ---

    /// Creates the waiter for `change_id`. Idempotent: a second call
    /// against the same id is a no-op.
    pub fn create_waiter(&self, change_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .waiters
            .entry(change_id.to_string())
            .or_insert_with(|| Arc::new(ChangeWaiter::default()));
    }

    /// Records `status` against `change_id` and wakes anyone waiting on
    /// it. Called by T1's do/undo handler (§4.4).
    pub fn signal(&self, change_id: &str, status: ExtStatus) {
        let waiter = self.inner.lock().unwrap().waiters.get(change_id).cloned();
        if let Some(waiter) = waiter {
            *waiter.status.lock().unwrap() = Some(status);
            waiter.condvar.notify_all();
        }
    }

    /// Blocks until `pred(status)` holds for the status last recorded by
    /// [`ManagerState::signal`]. The caller must have released the engine
    /// lock before calling this (§5 suspension points).
    pub fn wait_until(&self, change_id: &str, pred: impl Fn(ExtStatus) -> bool) -> ExtStatus {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .waiters
                .entry(change_id.to_string())
                .or_insert_with(|| Arc::new(ChangeWaiter::default()))
                .clone()
        };
        let guard = waiter.status.lock().unwrap();
        let guard = waiter
            .condvar
            .wait_while(guard, |status| !matches!(status, Some(s) if pred(*s)))
            .unwrap();
        guard.expect("condvar predicate only releases once a status is set")
    }

    /// Removed at change cleanup (§9).
    pub fn remove_waiter(&self, change_id: &str) {
        self.inner.lock().unwrap().waiters.remove(change_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn recovery_key_round_trips_until_removed() {
        let state = ManagerState::new();
        state.cache_recovery_key("id-1", RecoveryKey(b"secret".to_vec()), Duration::from_secs(60));
        assert_eq!(state.recovery_key("id-1").unwrap().0, b"secret");
        // still there on a second read: idempotent retries rely on this.
        assert_eq!(state.recovery_key("id-1").unwrap().0, b"secret");
    }

    #[test]
    fn recovery_key_expires() {
        let state = ManagerState::new();
        state.cache_recovery_key("id-1", RecoveryKey(b"secret".to_vec()), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(state.recovery_key("id-1"), Err(FdeError::Expired(_))));
    }

    #[test]
    fn auth_pair_absence_is_state_corruption() {
        let state = ManagerState::new();
        assert!(matches!(
            state.auth_pair("c1"),
            Err(FdeError::StateCorruption(_))
        ));
    }

    #[test]
    fn waiter_wakes_blocked_thread() {
        let state = Arc::new(ManagerState::new());
        state.create_waiter("c1");
        let waiter_state = state.clone();
        let handle = thread::spawn(move || waiter_state.wait_until("c1", |s| s.is_ready()));
        thread::sleep(Duration::from_millis(20));
        state.signal("c1", ExtStatus::Doing);
        state.signal("c1", ExtStatus::Error);
        assert_eq!(handle.join().unwrap(), ExtStatus::Error);
    }
}
