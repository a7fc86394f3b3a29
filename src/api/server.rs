use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /api/health - 存活检查与调度诊断
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.scheduler.stats();
    let limits = state.scheduler.limits();
    Json(json!({
        "status": "ok",
        "message": "dataset uploader is running",
        "build_time": env!("BUILD_TIME"),
        "open_channels": state.scheduler.progress().len(),
        "tasks": state.scheduler.tasks().len(),
        "scheduler": {
            "active_local": stats.active_local,
            "max_local": limits.max_local,
            "active_remote": stats.active_remote,
            "max_remote": limits.max_remote,
            "active_url_fetch": stats.active_url_fetch,
            "pending": stats.pending
        }
    }))
}
