use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub run_id: Uuid,
    pub provider: String,
    /// False once the batch summary has been produced.
    pub running: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        run_id: state.aggregator.run_id(),
        provider: state.aggregator.provider().to_string(),
        running: !state.aggregator.is_finished(),
    })
}
