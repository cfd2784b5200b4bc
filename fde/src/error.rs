//! Re-exports the closed error taxonomy from `fde_shared` and adds the
//! `From` conversions this crate's handlers need, mirroring
//! `fvm/src/kernel/error.rs`'s pattern of a thin per-crate error module.

pub use fde_shared::error::{ChangeConflictError, FdeError, Result};

impl From<serde_json::Error> for FdeError {
    fn from(e: serde_json::Error) -> Self {
        FdeError::Backend(anyhow::Error::from(e).context("malformed external-operation context"))
    }
}
