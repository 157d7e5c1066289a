//! Shared application state for the HTTP server.

use std::sync::Arc;

use routa_acp::{AgentPaths, PresetCatalog, RuntimeManager, SessionManager, WarmupService};

pub struct AppStateInner {
    pub session_manager: Arc<SessionManager>,
    pub catalog: Arc<PresetCatalog>,
    pub warmup: WarmupService,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Wire up the process-wide singletons: runtime manager, preset
    /// catalog, session manager, warmup service.
    pub fn new() -> Self {
        let paths = AgentPaths::new();
        let runtime = Arc::new(RuntimeManager::new(paths.clone()));
        let catalog = Arc::new(PresetCatalog::new(runtime, paths));
        let session_manager = Arc::new(SessionManager::new(catalog.clone()));
        let warmup = WarmupService::new(catalog.clone());
        Self {
            session_manager,
            catalog,
            warmup,
        }
    }

    /// Teardown: kill every live session. Called on server shutdown.
    pub async fn shutdown(&self) {
        self.session_manager.kill_all().await;
    }
}

impl Default for AppStateInner {
    fn default() -> Self {
        Self::new()
    }
}
