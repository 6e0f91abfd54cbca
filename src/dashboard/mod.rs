//! Dashboard — Axum JSON API for monitoring and operator control.
//!
//! Serves engine status (the same channel critical alerts surface on) and
//! the two operator actions: force-claiming leadership away from another
//! instance and stopping the scheduler. JSON only; rendering happens
//! elsewhere. CORS enabled for local development.

pub mod routes;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::scheduler::{ScanCycleScheduler, StartOutcome};
use crate::types::WardenError;
use routes::AppState;

/// Engine operations the dashboard can trigger. Kept as a trait so route
/// handlers are testable without a full engine behind them.
#[async_trait]
pub trait EngineControl: Send + Sync {
    async fn request_start(&self, force: bool) -> Result<StartOutcome, WardenError>;
    async fn request_stop(&self);
}

#[async_trait]
impl EngineControl for ScanCycleScheduler {
    async fn request_start(&self, force: bool) -> Result<StartOutcome, WardenError> {
        self.start(force).await
    }

    async fn request_stop(&self) {
        self.stop().await
    }
}

/// Start the dashboard web server.
///
/// This spawns a background task — it doesn't block.
pub fn spawn_dashboard(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "Dashboard server starting on http://localhost:{port}");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("Failed to bind dashboard port");

        axum::serve(listener, app)
            .await
            .expect("Dashboard server error");
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin("*".parse::<HeaderValue>().unwrap())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/leadership", get(routes::get_leadership))
        .route("/api/control/claim", post(routes::control_claim))
        .route("/api/control/stop", post(routes::control_stop))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}
