//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::sync::{ChangeLog, Reconciler, SyncCoordinator, VersionStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    coordinator: SyncCoordinator,
    reconciler: Reconciler,
}

impl AppState {
    /// Create the application state over one sync backend
    pub fn new<S>(config: Config, store: Arc<S>) -> Self
    where
        S: VersionStore + ChangeLog + 'static,
    {
        let coordinator =
            SyncCoordinator::from_store(store.clone(), config.sync.coordinator_options());
        let reconciler = Reconciler::from_store(store);

        Self {
            inner: Arc::new(AppStateInner {
                config,
                coordinator,
                reconciler,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the sync coordinator
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.inner.coordinator
    }

    /// Get the reconciler
    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }
}
