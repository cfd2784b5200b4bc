//! In-memory reference implementations of [`crate::engine::TaskEngine`] and
//! [`crate::backend::Backend`], gated behind the `testing` feature. Good
//! enough to drive every handler and the coordinator in this crate's own
//! tests; not a fitness-for-production task engine or crypto backend.
//!
//! Mirrors `fvm/src/lib.rs`'s `DummyExterns` pattern: a minimal, scriptable
//! fixture rather than a second real implementation.

mod backend;
mod engine;

pub use backend::{FakeBackend, RecordedCall};
pub use engine::FakeEngine;
