//! `ManagerConfig`, following the `NetworkConfig`/`MachineContext` builder
//! pattern: a plain struct with sane defaults and fluent setters.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use fde_shared::ContainerRole;

/// Settings for one `Manager` instance. Device/disk probing is an external
/// collaborator's job (§1); this crate only consumes the paths it's told.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the filesystem the backend operates against (almost always
    /// `/` outside of tests).
    pub rootdir: PathBuf,

    /// Sealing method passed to `reseal_for_boot_chains` and
    /// `load_parameters_for_boot_chains` calls that aren't driven by a DBX
    /// update's own `sealing_method` (carried in the operation's context).
    pub default_sealing_method: String,

    pub device_paths: BTreeMap<ContainerRole, PathBuf>,

    /// TTL for cached recovery keys (§4.5 add-recovery-keys).
    pub recovery_key_cache_ttl: Duration,

    /// TTL for cached volumes-auth options (§4.5 add-protected-keys,
    /// change-auth).
    pub volumes_auth_cache_ttl: Duration,
}

impl ManagerConfig {
    pub fn new(rootdir: impl Into<PathBuf>) -> Self {
        Self {
            rootdir: rootdir.into(),
            default_sealing_method: "tpm2".to_string(),
            device_paths: BTreeMap::new(),
            recovery_key_cache_ttl: Duration::from_secs(10 * 60),
            volumes_auth_cache_ttl: Duration::from_secs(10 * 60),
        }
    }

    pub fn with_device_path(mut self, role: ContainerRole, path: impl Into<PathBuf>) -> Self {
        self.device_paths.insert(role, path.into());
        self
    }

    pub fn with_sealing_method(mut self, method: impl Into<String>) -> Self {
        self.default_sealing_method = method.into();
        self
    }

    pub fn device_path(&self, role: ContainerRole) -> crate::error::Result<&std::path::Path> {
        self.device_paths
            .get(&role)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                crate::error::FdeError::NotFound(format!("no device path configured for {role}"))
            })
    }
}
