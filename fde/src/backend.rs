//! The crypto backend: TPM sealing, PCR profiles, and LUKS keyslot
//! mutation. Consumed through this narrow trait (§6); this crate never
//! speaks the TPM wire protocol or chooses PCR policies itself.

use std::path::Path;

use fde_shared::{ContainerRole, KeyslotRef, SealingParameters};

/// Callback a backend call invokes, possibly more than once, to report a
/// freshly computed `SealingParameters` for one (role, container) pair. The
/// orchestrator supplies a closure that re-acquires the engine's state lock
/// just long enough to record it (§4.6, §5).
pub type RecordSealing<'a> = dyn FnMut(&str, ContainerRole, SealingParameters) + 'a;

/// One boot-chain input used to (re)compute a PCR profile for a container,
/// as consumed by [`Backend::load_parameters_for_boot_chains`].
#[derive(Debug, Clone)]
pub struct BootChain {
    pub container_role: ContainerRole,
    pub boot_modes: Vec<String>,
}

/// A snapshot of a role's current parameters, handed to backend calls that
/// need to know what they are resealing relative to. Backends must treat
/// this as read-only; updates flow back only through [`RecordSealing`].
#[derive(Debug, Clone, Default)]
pub struct RoleSnapshot {
    pub role: String,
    pub pcr_policy_revocation_counter: u32,
}

/// A live key-data handle for one keyslot, returned by
/// [`Backend::read_container_key_data`]. The handle owns whatever
/// backend-specific state (open LUKS header, decrypted key material) the
/// two mutating operations need.
pub trait KeyDataHandle: Send {
    fn change_passphrase(&mut self, old: &str, new: &str) -> anyhow::Result<()>;
    fn write_token_atomic(&mut self, device_path: &Path, slot: &KeyslotRef) -> anyhow::Result<()>;
}

/// Parameters for sealing a new TPM-protected key (§4.5 `add-protected-keys`).
#[derive(Debug, Clone, Default)]
pub struct ProtectKeyParams {
    pub pcr_profile: Vec<u8>,
    pub pcr_handle: u32,
    pub volumes_auth: Vec<u8>,
}

/// A freshly generated or cached recovery key, as produced out-of-band and
/// handed to `add-recovery-keys` via the recovery-key cache (§4.5).
#[derive(Debug, Clone)]
pub struct RecoveryKey(pub Vec<u8>);

/// The crypto backend interface (§6). Every method maps 1:1 to one of the
/// operations listed there. Implementations are expected to be blocking and
/// may take seconds (TPM round trips); callers release the manager's state
/// lock before calling in and re-acquire it only inside a `RecordSealing`
/// callback (§5).
pub trait Backend: Send + Sync {
    fn reseal_for_signatures_db_update(
        &self,
        method: &str,
        rootdir: &Path,
        roles: &[RoleSnapshot],
        payload: &[u8],
        record: &mut RecordSealing<'_>,
    ) -> anyhow::Result<()>;

    fn reseal_for_boot_chains(
        &self,
        method: &str,
        rootdir: &Path,
        roles: &[RoleSnapshot],
        expect_reseal: bool,
        record: &mut RecordSealing<'_>,
    ) -> anyhow::Result<()>;

    fn load_parameters_for_boot_chains(
        &self,
        method: &str,
        rootdir: &Path,
        boot_chains: &[BootChain],
        record: &mut RecordSealing<'_>,
    ) -> anyhow::Result<()>;

    fn add_container_recovery_key(
        &self,
        device_path: &Path,
        slot: &KeyslotRef,
        recovery_key: &RecoveryKey,
    ) -> anyhow::Result<()>;

    fn add_container_tpm_protected_key(
        &self,
        device_path: &Path,
        slot: &KeyslotRef,
        params: &ProtectKeyParams,
    ) -> anyhow::Result<()>;

    fn delete_container_key(&self, device_path: &Path, slot: &KeyslotRef) -> anyhow::Result<()>;

    fn rename_container_key(
        &self,
        device_path: &Path,
        old: &KeyslotRef,
        new_name: &str,
    ) -> anyhow::Result<()>;

    fn read_container_key_data(
        &self,
        device_path: &Path,
        slot: &KeyslotRef,
    ) -> anyhow::Result<Box<dyn KeyDataHandle>>;

    fn list_container_unlock_key_names(&self, device_path: &Path) -> anyhow::Result<Vec<String>>;

    fn list_container_recovery_key_names(&self, device_path: &Path)
        -> anyhow::Result<Vec<String>>;

    /// Whether any sealed keys exist on disk for this device. `prepare`
    /// fails fast (no-op success) when this is false (§4.4 step 1).
    fn has_sealed_keys(&self, device_path: &Path) -> anyhow::Result<bool>;
}
