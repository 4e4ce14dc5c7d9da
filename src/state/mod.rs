/// Application state shared by every route and WebSocket connection
/// - Server configuration (read-only after startup)
/// - The Gemini spawner, which owns the process registry, the session store,
///   billing and the filesystem guards
///
/// Cloned into each handler; all members are behind `Arc`.
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::billing::Biller;
use crate::config::ServerConfig;
use crate::gemini_spawner::GeminiSpawner;
use crate::guards::{PathGuard, UserRoots};
use crate::session_store::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub spawner: Arc<GeminiSpawner>,
}

impl AppState {
    /// Build the state with the HTTP metering client
    pub fn new(config: ServerConfig) -> Self {
        let biller = Biller::with_http(config.billing.clone());
        Self::with_biller(config, biller)
    }

    /// Build the state around a caller-supplied biller
    pub fn with_biller(config: ServerConfig, biller: Biller) -> Self {
        let users = UserRoots::new(
            config.paths.user_data_base.clone(),
            config.paths.quota_bytes,
        );
        let paths = PathGuard::new(config.paths.shell_root.clone());
        let sessions = Arc::new(SessionStore::new(config.storage.sessions_dir.clone()));
        let biller = biller.with_audit(AuditLog::new(users.clone()));

        let spawner = GeminiSpawner::new(config.cli.clone(), sessions, biller, paths, users);
        Self {
            config: Arc::new(config),
            spawner: Arc::new(spawner),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.spawner.sessions()
    }
}
