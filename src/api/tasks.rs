use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use dataset_uploader::error::UploadError;
use dataset_uploader::task::Task;

use super::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TaskIdRequest {
    pub id: String,
}

/// GET /api/tasks - 任务列表（最新的在前）
pub async fn get_tasks(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Task>>> {
    Json(ApiResponse::success(state.scheduler.tasks().get_all_tasks()))
}

/// POST /api/tasks/get
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdRequest>,
) -> Json<ApiResponse<Task>> {
    match state.scheduler.tasks().get_task(&req.id) {
        Some(task) => Json(ApiResponse::success(task)),
        None => Json(ApiResponse::from_error(&UploadError::NotFound(format!("task {}", req.id)))),
    }
}

/// POST /api/tasks/remove - 删除任务（执行中的任务只解除观察）
pub async fn remove_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdRequest>,
) -> Json<ApiResponse<Task>> {
    match state.scheduler.remove_task(&req.id) {
        Some(task) => Json(ApiResponse::success(task)),
        None => Json(ApiResponse::from_error(&UploadError::NotFound(format!("task {}", req.id)))),
    }
}

/// POST /api/tasks/clear - 清除已结束的任务
pub async fn clear_tasks(State(state): State<Arc<AppState>>) -> Json<ApiResponse<usize>> {
    Json(ApiResponse::success(state.scheduler.clear_terminal().len()))
}

/// POST /api/tasks/clear_all
pub async fn clear_all_tasks(State(state): State<Arc<AppState>>) -> Json<ApiResponse<usize>> {
    Json(ApiResponse::success(state.scheduler.clear_all().len()))
}

/// GET /api/tasks/events - 任务变化推送（SSE）
pub async fn task_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = BroadcastStream::new(state.scheduler.tasks().subscribe()).filter_map(|event| match event {
        Ok(event) => Some(Event::default().json_data(event)),
        Err(e) => {
            tracing::warn!("Task event observer lagging: {}", e);
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
