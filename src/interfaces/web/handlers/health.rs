use axum::{Json, extract::State};

use super::super::AppState;

pub async fn health_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "model": state.model,
    }))
}
