//! Dashboard route handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use tracing::info;

use super::EngineControl;
use crate::engine::scheduler::StartOutcome;
use crate::types::StatusSnapshot;

/// Shared dashboard state: the live status snapshot plus the control
/// surface into the engine.
pub struct DashboardState {
    pub status: Arc<RwLock<StatusSnapshot>>,
    pub control: Arc<dyn EngineControl>,
}

impl DashboardState {
    pub fn new(status: Arc<RwLock<StatusSnapshot>>, control: Arc<dyn EngineControl>) -> Self {
        Self { status, control }
    }
}

pub type AppState = Arc<DashboardState>;

/// GET /health — liveness probe.
pub async fn health() -> &'static str {
    "ok"
}

/// GET /api/status — full engine status snapshot, alerts included.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    let snapshot = state.status.read().unwrap().clone();
    Json(snapshot)
}

/// GET /api/leadership — condensed leadership view.
pub async fn get_leadership(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.status.read().unwrap().clone();
    Json(json!({
        "instance_id": snapshot.instance_id,
        "is_leader": snapshot.is_leader,
        "engine_state": snapshot.state,
    }))
}

#[derive(Debug, Deserialize, Default)]
pub struct ClaimBody {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/control/claim — operator "take control". With `force` the
/// claim overwrites another active holder.
pub async fn control_claim(
    State(state): State<AppState>,
    body: Option<Json<ClaimBody>>,
) -> (StatusCode, Json<Value>) {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    info!(force, "Claim requested via dashboard");

    match state.control.request_start(force).await {
        Ok(StartOutcome::Started) => (StatusCode::OK, Json(json!({ "outcome": "started" }))),
        Ok(StartOutcome::ConflictingHolder { holder_id }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "outcome": "already_claimed",
                "holder_id": holder_id,
                "hint": "re-POST with {\"force\": true} to take control",
            })),
        ),
        Ok(StartOutcome::ArbiterUnavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "outcome": "arbiter_unavailable" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "outcome": "error", "message": e.to_string() })),
        ),
    }
}

/// POST /api/control/stop — stop scanning and release the lease.
pub async fn control_stop(State(state): State<AppState>) -> Json<Value> {
    info!("Stop requested via dashboard");
    state.control.request_stop().await;
    Json(json!({ "outcome": "stopped" }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
