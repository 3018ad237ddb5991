use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::summary::ProgressSnapshot;

/// GET /api/v1/progress: terminal entries so far plus in-flight counts.
pub async fn get_progress(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    Json(state.aggregator.snapshot())
}
