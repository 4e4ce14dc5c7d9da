use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api;
use crate::state::AppState;
use crate::websocket;

/// All HTTP and WebSocket routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/config", get(api::client_config))
        .route("/api/projects/{project}/sessions", get(api::list_sessions))
        .route(
            "/api/projects/{project}/sessions/{session_id}/messages",
            get(api::session_messages),
        )
        .route(
            "/api/projects/{project}/sessions/{session_id}",
            axum::routing::delete(api::delete_session),
        )
        .route(
            "/api/projects/{project}/file",
            get(api::read_file).put(api::write_file),
        )
        .route("/api/projects/{project}/files", get(api::project_files))
        .route("/api/generate-spec", post(api::generate_spec))
        .route("/ws", get(websocket::chat_upgrade))
        .route("/shell", get(websocket::shell_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl+C, then abort every running CLI process
pub async fn serve(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Gemini relay listening on http://{}", listener.local_addr()?);

    let spawner = state.spawner.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            let aborted = spawner.abort_all();
            info!("Shutting down, aborted {} running processes", aborted);
        })
        .await
        .context("Server error")?;
    Ok(())
}
