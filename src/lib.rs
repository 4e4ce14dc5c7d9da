pub mod api;
pub mod attachments;
pub mod audit;
pub mod billing;
pub mod caller;
pub mod cli_command;
pub mod config;
pub mod events;
pub mod gemini_spawner;
pub mod guards;
pub mod process;
pub mod server;
pub mod session_store;
pub mod state;
pub mod stream_parser;
pub mod websocket;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use state::AppState;

/// Install the global tracing subscriber; `RUST_LOG` overrides the default level
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Load configuration, rehydrate sessions and serve until shutdown
pub async fn run() -> Result<()> {
    init_tracing();
    info!("Starting gemini-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load()?;
    let state = AppState::new(config);
    state.spawner.biller().log_startup_summary();

    let loaded = state.sessions().load_all().await?;
    info!("Session store ready with {} sessions", loaded);
    if let Some(root) = state.spawner.paths().root() {
        info!("Shell root: {}", root.display());
    }

    server::serve(state).await
}
