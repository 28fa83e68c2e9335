//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Bus masters
        .route("/api/masters", get(api::list_masters))
        .route("/api/masters/{id}", get(api::get_master))
        .route("/api/masters/{id}", delete(api::remove_master))
        .route("/api/masters/{id}/search_cadence", put(api::set_search_cadence))
        .route("/api/masters/{id}/pullup", put(api::set_pullup))
        .route("/api/masters/{id}/search", post(api::trigger_search))
        .route("/api/masters/{id}/verify", post(api::verify))
        .route("/api/masters/{id}/alarm", post(api::alarm_search))
        // Slaves
        .route("/api/masters/{id}/slaves", get(api::list_slaves))
        .route("/api/masters/{id}/slaves", post(api::add_slave))
        .route("/api/masters/{id}/slaves/{slave}", delete(api::remove_slave))
        .route("/api/masters/{id}/slaves/{slave}/write", post(api::write_slave))
        .route("/api/masters/{id}/slaves/{slave}/read", post(api::read_slave))
        .route("/api/slaves/{slave}", get(api::get_slave))
        // Simulated wire
        .route("/api/masters/{id}/bus", post(api::plug_device))
        .route("/api/masters/{id}/bus/{device}", delete(api::unplug_device))
        // Families and power
        .route("/api/families", get(api::list_families))
        .route("/api/power/suspend", post(api::suspend))
        .route("/api/power/resume", post(api::resume))
        // WebSocket for real-time updates
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the web server until Ctrl-C, then remove every bus master
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting web server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down bus masters");
    state.registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
