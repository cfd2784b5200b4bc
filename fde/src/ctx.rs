//! The narrow accessor handlers and the coordinator receive, instead of a
//! handle back to the whole manager (§9 "Cyclic state↔engine reference").

use crate::backend::Backend;
use crate::cache::ManagerState;
use crate::config::ManagerConfig;
use crate::engine::TaskEngine;

/// Everything a handler or coordinator entry point needs, borrowed for the
/// duration of one call. Never stored past that.
pub struct HandlerCtx<'a> {
    pub engine: &'a dyn TaskEngine,
    pub backend: &'a dyn Backend,
    pub manager_state: &'a ManagerState,
    pub config: &'a ManagerConfig,
}

impl<'a> HandlerCtx<'a> {
    pub fn new(
        engine: &'a dyn TaskEngine,
        backend: &'a dyn Backend,
        manager_state: &'a ManagerState,
        config: &'a ManagerConfig,
    ) -> Self {
        Self {
            engine,
            backend,
            manager_state,
            config,
        }
    }
}
