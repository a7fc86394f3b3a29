use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use dataset_uploader::error::UploadError;
use dataset_uploader::scheduler::{StagedUpload, TaskPayload, UploadJob};
use dataset_uploader::storage::FetchSource;
use dataset_uploader::task::{ItemKind, OriginClass};
use dataset_uploader::utils::join_dataset_path;
use dataset_uploader::validator::{validate_payload, validate_submission};

use super::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub task_id: String,
}

/// 客户端文件写入暂存目录后的信息
struct ReceivedFiles {
    dir: tempfile::TempDir,
    /// Cleaned `/`-separated paths relative to `dir/files`
    paths: Vec<String>,
}

impl ReceivedFiles {
    fn files_dir(&self) -> PathBuf {
        self.dir.path().join("files")
    }

    /// 单个且不带目录的文件作为单文件任务，其余作为目录任务
    fn item_kind(&self) -> ItemKind {
        match self.paths.as_slice() {
            [only] if !only.contains('/') => ItemKind::SingleItem,
            _ => ItemKind::Tree,
        }
    }

    /// Common top-level folder of every received path, if there is one
    fn common_folder(&self) -> Option<&str> {
        let first = self.paths.first()?.split_once('/')?.0;
        self.paths
            .iter()
            .all(|p| p.split_once('/').map(|(head, _)| head) == Some(first))
            .then_some(first)
    }

    fn into_job(
        self,
        id: Option<String>,
        name: Option<String>,
        dataset_id: String,
        base_path: String,
    ) -> Result<UploadJob, UploadError> {
        let item_kind = self.item_kind();
        let files = self.paths.len();
        let (root, default_name) = match item_kind {
            ItemKind::SingleItem => {
                let path = self.paths[0].clone();
                (self.files_dir().join(&path), path)
            }
            ItemKind::Tree => match self.common_folder() {
                Some(folder) => (self.files_dir().join(folder), folder.to_string()),
                None => (self.files_dir(), "upload".to_string()),
            },
        };
        let name = name.filter(|n| !n.trim().is_empty()).unwrap_or(default_name);
        validate_submission(&name, &dataset_id)?;

        Ok(UploadJob::new(
            id,
            name,
            item_kind,
            dataset_id,
            base_path,
            TaskPayload::Staged(StagedUpload::new(self.dir, root, files)),
        ))
    }
}

async fn write_field(
    target: &Path,
    field: &mut axum::extract::multipart::Field<'_>,
) -> Result<(), UploadError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(target).await?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| UploadError::Validation(format!("failed to read upload body: {}", e)))?
    {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// POST /api/upload/local - 客户端文件上传（multipart）
pub async fn upload_local(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Json<ApiResponse<SubmitResult>> {
    match receive_local(&state, &mut multipart).await {
        Ok(task_id) => Json(ApiResponse::success(SubmitResult { task_id })),
        Err(e) => {
            tracing::warn!("Local upload rejected: {}", e);
            Json(ApiResponse::from_error(&e))
        }
    }
}

async fn receive_local(state: &AppState, multipart: &mut Multipart) -> Result<String, UploadError> {
    let dir = tempfile::Builder::new()
        .prefix("upload-")
        .tempdir_in(&state.staging_dir)?;
    let mut received = ReceivedFiles { dir, paths: Vec::new() };

    let mut id = None;
    let mut name = None;
    let mut dataset_id = String::new();
    let mut base_path = String::new();

    let bad_request = |e: axum::extract::multipart::MultipartError| UploadError::Validation(e.to_string());
    while let Some(mut field) = multipart.next_field().await.map_err(bad_request)? {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "id" => id = Some(field.text().await.map_err(bad_request)?),
            "name" => name = Some(field.text().await.map_err(bad_request)?),
            "datasetId" => dataset_id = field.text().await.map_err(bad_request)?,
            "basePath" => base_path = field.text().await.map_err(bad_request)?,
            "file" | "files" => {
                let original = field.file_name().unwrap_or("").to_string();
                // 去掉 ..、绝对路径前缀等，只保留相对路径
                let relative = join_dataset_path("", &original);
                if relative.is_empty() {
                    return Err(UploadError::Validation(format!("invalid file name: {:?}", original)));
                }
                if received.paths.contains(&relative) {
                    return Err(UploadError::Validation(format!("duplicate file: {}", relative)));
                }
                write_field(&received.files_dir().join(&relative), &mut field).await?;
                tracing::debug!("Staged {} in {:?}", relative, received.dir.path());
                received.paths.push(relative);
            }
            _ => {}
        }
    }

    if received.paths.is_empty() {
        return Err(UploadError::Validation("no file uploaded".to_string()));
    }
    let job = received.into_job(id, name, dataset_id, base_path)?;
    state.scheduler.submit(job)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub id: Option<String>,
    pub name: String,
    pub origin_class: OriginClass,
    pub remote_path: Option<String>,
    pub url: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub destination_dataset_id: String,
    #[serde(default)]
    pub base_path: String,
}

/// POST /api/upload/submit - 服务器文件或 URL 上传
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Json<ApiResponse<SubmitResult>> {
    match submit_request(&state, req).await {
        Ok(task_id) => Json(ApiResponse::success(SubmitResult { task_id })),
        Err(e) => {
            tracing::warn!("Submission rejected: {}", e);
            Json(ApiResponse::from_error(&e))
        }
    }
}

async fn submit_request(state: &AppState, req: SubmitRequest) -> Result<String, UploadError> {
    validate_submission(&req.name, &req.destination_dataset_id)?;
    validate_payload(req.origin_class, req.remote_path.as_deref(), req.url.as_deref())?;

    let (item_kind, payload) = match (req.remote_path, req.url) {
        (Some(remote_path), _) if req.origin_class == OriginClass::RemoteOrigin => {
            let validation = state.validator.validate(&remote_path);
            if !validation.allowed {
                return Err(UploadError::AccessDenied(remote_path));
            }
            let meta = tokio::fs::metadata(&validation.resolved_path)
                .await
                .map_err(|_| UploadError::NotFound(remote_path.clone()))?;
            let item_kind = if meta.is_dir() { ItemKind::Tree } else { ItemKind::SingleItem };
            (item_kind, TaskPayload::RemotePath(remote_path))
        }
        (_, Some(url)) => (
            ItemKind::SingleItem,
            TaskPayload::FetchUrl(FetchSource {
                url,
                referer: req.referer,
                user_agent: req.user_agent,
            }),
        ),
        _ => return Err(UploadError::Validation("missing payload".to_string())),
    };

    let job = UploadJob::new(req.id, req.name, item_kind, req.destination_dataset_id, req.base_path, payload);
    state.scheduler.submit(job)
}
