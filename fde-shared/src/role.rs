use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::keyslot::ContainerRole;

/// Describes a model (brand/model/grade triple) a sealed key is bound to.
/// Opaque beyond identity in this crate; the backend interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub brand_id: String,
    pub model: String,
    pub grade: String,
}

/// The sealing inputs recorded for one container under one keyslot role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSealingInputs {
    /// Ordered set of boot modes this PCR profile is valid for (e.g.
    /// `["run", "recover"]`). Order matters for `run+recover` roles where
    /// mode precedence is meaningful; duplicates are a caller bug, not
    /// something this type enforces.
    pub boot_modes: Vec<String>,
    pub models: Vec<ModelDescriptor>,
    /// Opaque PCR profile bytes as produced by the crypto backend.
    pub pcr_profile: Vec<u8>,
}

/// Sealing parameters a backend call reports back to the manager via
/// `FdeStore::set_container_sealing` (§4.6).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingParameters {
    pub pcr_profile: Vec<u8>,
    pub pcr_policy_revocation_counter: u32,
}

/// One of `run`, `recover`, `run+recover`: a named TPM2-sealed key and the
/// per-container boot-chain inputs it was last sealed against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyslotRole {
    pub primary_key_id: String,
    pub pcr_policy_revocation_counter: u32,
    pub containers: BTreeMap<ContainerRole, ContainerSealingInputs>,
}

impl KeyslotRole {
    pub fn new(primary_key_id: impl Into<String>) -> Self {
        Self {
            primary_key_id: primary_key_id.into(),
            pcr_policy_revocation_counter: 0,
            containers: BTreeMap::new(),
        }
    }

    /// Records the result of a reseal for one container, bumping the
    /// revocation counter as the backend reports it.
    pub fn set_container_sealing(&mut self, container_role: ContainerRole, params: SealingParameters) {
        self.pcr_policy_revocation_counter = params.pcr_policy_revocation_counter;
        self.containers
            .entry(container_role)
            .or_default()
            .pcr_profile = params.pcr_profile;
    }
}
