use std::sync::Arc;

use crate::config::RelayConfig;
use crate::connection::ConnectionStore;
use crate::lifecycle::LifecycleController;
use crate::provider::ProviderRegistry;
use crate::thread_api::ThreadApi;

/// Shared by every request handler. Cloning is cheap; the connection store
/// is the only mutable part and is keyed by connection id.
#[derive(Clone)]
pub struct AppState {
    pub controller: LifecycleController,
    pub connections: ConnectionStore,
}

impl AppState {
    pub fn new(
        providers: ProviderRegistry,
        thread_api: Arc<dyn ThreadApi>,
        config: RelayConfig,
    ) -> Self {
        Self {
            controller: LifecycleController::new(providers, thread_api, config),
            connections: ConnectionStore::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        self.controller.config()
    }
}
