//! Domain types shared between the FDE state manager and whatever embeds it.
//!
//! ## Logging
//!
//! This crate does not log. Its consumer, `fde`, emits logs using the `log`
//! façade; configure the logging backend of your choice in the embedding
//! application.

pub mod error;
pub mod keyslot;
pub mod operation;
pub mod role;

pub use error::{ChangeConflictError, FdeError};
pub use keyslot::{ContainerRole, KeyslotRef};
pub use operation::{ExtStatus, ExternalOperation};
pub use role::{KeyslotRole, SealingParameters};
