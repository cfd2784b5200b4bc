//! FDE state manager: coordinates long-running, externally-driven
//! operations against TPM-sealed key slots on an immutable-OS device.
//!
//! The crate does not implement a task engine, a crypto backend, or a
//! snap-install subsystem — it defines the narrow traits it needs from
//! each ([`engine::TaskEngine`], [`backend::Backend`],
//! [`conflict::SnapSubsystem`]) and wires its own logic (the external
//! operation state machine, conflict detection, task blocking, the DBX
//! coordinator, and the idempotent keyslot handlers) against them through
//! [`manager::Manager`].
//!
//! ## Logging
//!
//! This crate emits logs using the [`log`] façade only (`log::warn!`,
//! `log::error!`). Configure the logging backend of your choice during the
//! initialization of the consuming application; this crate never installs
//! one itself.
//!
//! ## The `testing` feature
//!
//! Enables [`testing::FakeEngine`] and [`testing::FakeBackend`], in-memory
//! reference implementations of the two collaborator traits, used by this
//! crate's own test suite and available to embedders who want the same
//! fixtures.

pub mod backend;
pub mod blocker;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod ctx;
pub mod dbx;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod indicator;
pub mod manager;
pub mod reseal;
pub mod store;

#[cfg(feature = "testing")]
pub mod testing;

pub use error::{ChangeConflictError, FdeError, Result};
pub use manager::Manager;
