use std::sync::{Arc, RwLock};

use crate::params::ParameterTable;

/// Link events for consumers. Callbacks run on the link's worker threads and
/// must return quickly; hand heavy work to another thread.
pub trait LinkListener: Send + Sync {
    /// Fires once per session, when the parameter table first becomes complete.
    fn on_parameters_complete(&self, _table: &ParameterTable) {}
    fn on_heartbeat_lost(&self) {}
    fn on_heartbeat_restored(&self) {}
    fn on_disconnected(&self, _reason: &str) {}
}

#[derive(Clone, Default)]
pub(crate) struct Listeners(Arc<RwLock<Vec<Arc<dyn LinkListener>>>>);

impl Listeners {
    pub fn add(&self, listener: Arc<dyn LinkListener>) {
        self.0.write().unwrap_or_else(|p| p.into_inner()).push(listener);
    }

    /// Call `f` on each listener without holding the registry lock.
    pub fn each(&self, f: impl Fn(&dyn LinkListener)) {
        let current: Vec<Arc<dyn LinkListener>> = self.0.read().unwrap_or_else(|p| p.into_inner()).clone();
        for l in &current {
            f(l.as_ref());
        }
    }
}
