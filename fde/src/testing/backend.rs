//! [`FakeBackend`]: a scriptable, in-memory [`Backend`] fixture. Tracks
//! every call it receives so tests can assert on call counts (the
//! idempotence properties in §8 are, in the end, claims about how many
//! times this fixture's methods get invoked).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fde_shared::{ContainerRole, KeyslotRef, SealingParameters};

use crate::backend::{Backend, BootChain, KeyDataHandle, ProtectKeyParams, RecordSealing, RecoveryKey, RoleSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    ResealForSignaturesDbUpdate { payload: Vec<u8> },
    ResealForBootChains { expect_reseal: bool },
    LoadParametersForBootChains,
    AddContainerRecoveryKey { device: PathBuf, slot: KeyslotRef },
    AddContainerTpmProtectedKey { device: PathBuf, slot: KeyslotRef },
    DeleteContainerKey { device: PathBuf, slot: KeyslotRef },
    RenameContainerKey { device: PathBuf, old: KeyslotRef, new_name: String },
    ChangePassphrase { slot: KeyslotRef },
}

#[derive(Default)]
struct State {
    calls: Vec<RecordedCall>,
    recovery_key_names: HashMap<PathBuf, Vec<String>>,
    unlock_key_names: HashMap<PathBuf, Vec<String>>,
    has_sealed_keys: bool,
    fail_reseal_for_signatures_db_update: bool,
    fail_add_recovery_key_on: Option<KeyslotRef>,
    fail_add_protected_key_on: Option<KeyslotRef>,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sealed_keys(self, present: bool) -> Self {
        self.state.lock().unwrap().has_sealed_keys = present;
        self
    }

    pub fn preload_unlock_key(&self, device: impl Into<PathBuf>, name: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .unlock_key_names
            .entry(device.into())
            .or_default()
            .push(name.into());
    }

    pub fn preload_recovery_key(&self, device: impl Into<PathBuf>, name: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .recovery_key_names
            .entry(device.into())
            .or_default()
            .push(name.into());
    }

    pub fn fail_next_reseal_for_signatures_db_update(&self) {
        self.state.lock().unwrap().fail_reseal_for_signatures_db_update = true;
    }

    pub fn fail_add_recovery_key(&self, slot: KeyslotRef) {
        self.state.lock().unwrap().fail_add_recovery_key_on = Some(slot);
    }

    pub fn fail_add_protected_key(&self, slot: KeyslotRef) {
        self.state.lock().unwrap().fail_add_protected_key_on = Some(slot);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, matcher: impl Fn(&RecordedCall) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| matcher(c)).count()
    }
}

struct FakeKeyDataHandle {
    applied: Option<(String, String)>,
}

impl KeyDataHandle for FakeKeyDataHandle {
    fn change_passphrase(&mut self, old: &str, new: &str) -> anyhow::Result<()> {
        self.applied = Some((old.to_string(), new.to_string()));
        Ok(())
    }

    fn write_token_atomic(&mut self, _device_path: &Path, _slot: &KeyslotRef) -> anyhow::Result<()> {
        Ok(())
    }
}

fn record_dummy_sealing(roles: &[RoleSnapshot], record: &mut RecordSealing<'_>) {
    for role in roles {
        record(
            &role.role,
            ContainerRole::SystemData,
            SealingParameters {
                pcr_profile: b"pcr-profile".to_vec(),
                pcr_policy_revocation_counter: role.pcr_policy_revocation_counter + 1,
            },
        );
    }
}

impl Backend for FakeBackend {
    fn reseal_for_signatures_db_update(
        &self,
        _method: &str,
        _rootdir: &Path,
        roles: &[RoleSnapshot],
        payload: &[u8],
        record: &mut RecordSealing<'_>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::ResealForSignaturesDbUpdate {
            payload: payload.to_vec(),
        });
        if state.fail_reseal_for_signatures_db_update {
            state.fail_reseal_for_signatures_db_update = false;
            anyhow::bail!("tpm sealed object busy");
        }
        drop(state);
        record_dummy_sealing(roles, record);
        Ok(())
    }

    fn reseal_for_boot_chains(
        &self,
        _method: &str,
        _rootdir: &Path,
        roles: &[RoleSnapshot],
        expect_reseal: bool,
        record: &mut RecordSealing<'_>,
    ) -> anyhow::Result<()> {
        self.state.lock().unwrap().calls.push(RecordedCall::ResealForBootChains { expect_reseal });
        record_dummy_sealing(roles, record);
        Ok(())
    }

    fn load_parameters_for_boot_chains(
        &self,
        _method: &str,
        _rootdir: &Path,
        _boot_chains: &[BootChain],
        record: &mut RecordSealing<'_>,
    ) -> anyhow::Result<()> {
        self.state.lock().unwrap().calls.push(RecordedCall::LoadParametersForBootChains);
        record(
            "run",
            ContainerRole::SystemData,
            SealingParameters {
                pcr_profile: b"pcr-profile".to_vec(),
                pcr_policy_revocation_counter: 1,
            },
        );
        Ok(())
    }

    fn add_container_recovery_key(
        &self,
        device_path: &Path,
        slot: &KeyslotRef,
        _recovery_key: &RecoveryKey,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::AddContainerRecoveryKey {
            device: device_path.to_path_buf(),
            slot: slot.clone(),
        });
        if state.fail_add_recovery_key_on.as_ref() == Some(slot) {
            anyhow::bail!("backend rejected recovery key slot");
        }
        state
            .recovery_key_names
            .entry(device_path.to_path_buf())
            .or_default()
            .push(slot.name.clone());
        Ok(())
    }

    fn add_container_tpm_protected_key(
        &self,
        device_path: &Path,
        slot: &KeyslotRef,
        _params: &ProtectKeyParams,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::AddContainerTpmProtectedKey {
            device: device_path.to_path_buf(),
            slot: slot.clone(),
        });
        if state.fail_add_protected_key_on.as_ref() == Some(slot) {
            anyhow::bail!("backend rejected protected key slot");
        }
        state
            .unlock_key_names
            .entry(device_path.to_path_buf())
            .or_default()
            .push(slot.name.clone());
        Ok(())
    }

    fn delete_container_key(&self, device_path: &Path, slot: &KeyslotRef) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::DeleteContainerKey {
            device: device_path.to_path_buf(),
            slot: slot.clone(),
        });
        state
            .recovery_key_names
            .entry(device_path.to_path_buf())
            .or_default()
            .retain(|n| n != &slot.name);
        state
            .unlock_key_names
            .entry(device_path.to_path_buf())
            .or_default()
            .retain(|n| n != &slot.name);
        Ok(())
    }

    fn rename_container_key(&self, device_path: &Path, old: &KeyslotRef, new_name: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::RenameContainerKey {
            device: device_path.to_path_buf(),
            old: old.clone(),
            new_name: new_name.to_string(),
        });
        let names = state.unlock_key_names.entry(device_path.to_path_buf()).or_default();
        names.retain(|n| n != &old.name);
        names.push(new_name.to_string());
        Ok(())
    }

    fn read_container_key_data(&self, _device_path: &Path, slot: &KeyslotRef) -> anyhow::Result<Box<dyn KeyDataHandle>> {
        self.state.lock().unwrap().calls.push(RecordedCall::ChangePassphrase { slot: slot.clone() });
        Ok(Box::new(FakeKeyDataHandle { applied: None }))
    }

    fn list_container_unlock_key_names(&self, device_path: &Path) -> anyhow::Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .unlock_key_names
            .get(device_path)
            .cloned()
            .unwrap_or_default())
    }

    fn list_container_recovery_key_names(&self, device_path: &Path) -> anyhow::Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .recovery_key_names
            .get(device_path)
            .cloned()
            .unwrap_or_default())
    }

    fn has_sealed_keys(&self, _device_path: &Path) -> anyhow::Result<bool> {
        Ok(self.state.lock().unwrap().has_sealed_keys)
    }
}
