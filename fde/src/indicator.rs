//! Reader for the `unlocked.json` indicator file (§6): tells
//! `add-protected-keys` whether the host was unlocked with a recovery key
//! this boot, in which case adding protected keys would bind to a
//! mismatched PCR state.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{FdeError, Result};

/// Path of the indicator file, relative to `ManagerConfig::rootdir`.
pub const UNLOCKED_INDICATOR_RELATIVE_PATH: &str = "run/snapd/unlocked.json";

#[derive(Debug, Deserialize)]
struct Indicator {
    #[serde(rename = "UbuntuData")]
    ubuntu_data: UbuntuData,
}

#[derive(Debug, Deserialize)]
struct UbuntuData {
    #[serde(rename = "UnlockKey")]
    unlock_key: String,
}

/// Absence of the file means "not a recovery-key boot": it is only written
/// when the initramfs actually fell back to the recovery key.
pub fn unlocked_with_recovery_key(rootdir: &Path) -> Result<bool> {
    let path = rootdir.join(UNLOCKED_INDICATOR_RELATIVE_PATH);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(FdeError::Backend(
                anyhow::Error::from(e).context(format!("cannot read {}", path.display())),
            ))
        }
    };
    let indicator: Indicator = serde_json::from_slice(&bytes)?;
    Ok(indicator.ubuntu_data.unlock_key == "recovery")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_means_not_recovery_boot() {
        let dir = std::env::temp_dir().join("fde-indicator-test-missing-nonexistent-dir");
        assert!(!unlocked_with_recovery_key(&dir).unwrap());
    }

    #[test]
    fn recovery_key_is_detected() {
        let dir = std::env::temp_dir().join("fde-indicator-test-present");
        fs::create_dir_all(dir.join("run/snapd")).unwrap();
        let mut f = fs::File::create(dir.join(UNLOCKED_INDICATOR_RELATIVE_PATH)).unwrap();
        f.write_all(br#"{"UbuntuData": {"UnlockKey": "recovery"}}"#).unwrap();
        assert!(unlocked_with_recovery_key(&dir).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn run_key_is_not_recovery() {
        let dir = std::env::temp_dir().join("fde-indicator-test-run");
        fs::create_dir_all(dir.join("run/snapd")).unwrap();
        let mut f = fs::File::create(dir.join(UNLOCKED_INDICATOR_RELATIVE_PATH)).unwrap();
        f.write_all(br#"{"UbuntuData": {"UnlockKey": "run"}}"#).unwrap();
        assert!(!unlocked_with_recovery_key(&dir).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }
}
