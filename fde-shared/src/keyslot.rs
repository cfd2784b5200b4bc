use std::fmt;

use serde::{Deserialize, Serialize};

/// Which LUKS container a keyslot operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerRole {
    SystemData,
    SystemSave,
}

impl fmt::Display for ContainerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRole::SystemData => write!(f, "system-data"),
            ContainerRole::SystemSave => write!(f, "system-save"),
        }
    }
}

/// Uniquely identifies one named slot on one LUKS container. Equality is
/// structural: two refs naming the same container and slot name are the
/// same keyslot regardless of where they were constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyslotRef {
    pub container_role: ContainerRole,
    pub name: String,
}

impl KeyslotRef {
    pub fn new(container_role: ContainerRole, name: impl Into<String>) -> Self {
        Self {
            container_role,
            name: name.into(),
        }
    }

    /// The default recovery-key slot names a container carries when a
    /// caller doesn't name one explicitly (see `remove-keys`'s default set).
    pub fn default_recovery(container_role: ContainerRole) -> Self {
        Self::new(container_role, "default-recovery")
    }

    /// Canonical string form used as a map key for `rename-keys`'s
    /// `renames` attribute (`container_role:name`).
    pub fn string_form(&self) -> String {
        format!("{}:{}", self.container_role, self.name)
    }
}

impl fmt::Display for KeyslotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string_form())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form_round_trips_through_display() {
        let r = KeyslotRef::new(ContainerRole::SystemData, "recovery-1");
        assert_eq!(r.string_form(), "system-data:recovery-1");
        assert_eq!(r.to_string(), r.string_form());
    }

    #[test]
    fn default_recovery_names_match_spec() {
        assert_eq!(
            KeyslotRef::default_recovery(ContainerRole::SystemData).name,
            "default-recovery"
        );
    }
}
