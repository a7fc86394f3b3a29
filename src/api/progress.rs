use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use tokio_stream::StreamExt;

use crate::state::AppState;

/// GET /api/upload/progress/:upload_id - 单次上传的进度推送（SSE）
///
/// 客户端断开时流被丢弃，通道注册随之移除
pub async fn progress_stream(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.scheduler.observe(&upload_id);
    let stream = rx.map(|event| Event::default().json_data(event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
