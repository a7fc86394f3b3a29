//! Stage executor / 单文件三阶段执行器
//!
//! local staging (client-origin only) → object store transfer → metadata
//! registration. Percentages: staged 5, transfer 10..90, registration 90.
//! The terminal 100 is reported by whoever owns the task, not here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::TransferConfig;
use crate::error::UploadError;
use crate::metadata::MetadataService;
use crate::progress::{ProgressEvent, ProgressStatus};
use crate::storage::{
    FetchSource, ObjectStoreConnector, ObjectStoreSession, StoreCredentials, TransferProgress,
    TransferProgressCallback,
};
use crate::task::{RegisteredFile, TaskStatus};

pub const STAGED_PROGRESS: f32 = 5.0;
pub const TRANSFER_START_PROGRESS: f32 = 10.0;
pub const TRANSFER_END_PROGRESS: f32 = 90.0;
pub const FETCH_PROCESSING_PROGRESS: f32 = 50.0;

/// Map a transfer percentage into the [10, 90] stage window.
pub fn scale_transfer_progress(progress: f32) -> f32 {
    let span = TRANSFER_END_PROGRESS - TRANSFER_START_PROGRESS;
    (TRANSFER_START_PROGRESS + progress.clamp(0.0, 100.0) * span / 100.0).min(TRANSFER_END_PROGRESS)
}

/// Receives stage transitions for one task or sub-task / 阶段进度接收者
pub trait StageSink: Send + Sync {
    fn stage(&self, status: TaskStatus, event: ProgressEvent);
}

/// A client-origin file in the staging area; removed when dropped / 暂存文件，离开作用域即删除
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed staged file {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove staged file {:?}: {}", self.path, e),
        }
    }
}

pub enum StageSource {
    Staged(StagedFile),
    ServerFile(PathBuf),
    Url(FetchSource),
}

enum TransferSource {
    File(PathBuf),
    Url(FetchSource),
}

pub struct StageRequest {
    /// Name registered with the metadata service
    pub name: String,
    /// Destination-relative path inside the dataset
    pub destination_path: String,
    pub source: StageSource,
}

#[derive(Clone)]
pub struct StageExecutor {
    metadata: Arc<dyn MetadataService>,
    store: Arc<dyn ObjectStoreConnector>,
    part_concurrency: usize,
    fetch_poll_interval: Duration,
    fetch_timeout: Duration,
}

impl StageExecutor {
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        store: Arc<dyn ObjectStoreConnector>,
        transfer: &TransferConfig,
    ) -> Self {
        Self {
            metadata,
            store,
            part_concurrency: transfer.part_concurrency.max(1),
            fetch_poll_interval: transfer.fetch_poll_interval(),
            fetch_timeout: transfer.fetch_timeout(),
        }
    }

    pub async fn execute(
        &self,
        request: StageRequest,
        sink: Arc<dyn StageSink>,
    ) -> Result<RegisteredFile, UploadError> {
        let started = Instant::now();
        let StageRequest { name, destination_path, source } = request;

        // 暂存文件在本函数结束时删除（包括失败路径）
        let (staged, transfer_source) = match source {
            StageSource::Staged(file) => {
                sink.stage(
                    TaskStatus::Uploading,
                    ProgressEvent::new(ProgressStatus::ProcessingServer, STAGED_PROGRESS)
                        .with_message("File received by server, starting upload."),
                );
                let path = file.path().to_path_buf();
                (Some(file), TransferSource::File(path))
            }
            StageSource::ServerFile(path) => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|_| UploadError::NotFound(path.display().to_string()))?;
                if !meta.is_file() {
                    return Err(UploadError::Validation(format!("not a regular file: {}", path.display())));
                }
                sink.stage(
                    TaskStatus::Uploading,
                    ProgressEvent::new(ProgressStatus::ProcessingServer, STAGED_PROGRESS)
                        .with_message("Reading file on server, starting upload."),
                );
                (None, TransferSource::File(path))
            }
            StageSource::Url(fetch) => {
                sink.stage(
                    TaskStatus::Uploading,
                    ProgressEvent::new(ProgressStatus::ProcessingServer, 0.0)
                        .with_message("Starting URL fetch..."),
                );
                (None, TransferSource::Url(fetch))
            }
        };

        // 每次尝试都重新获取凭证
        let credentials = self.metadata.store_credentials().await?;
        let session = self
            .store
            .connect(&credentials)
            .map_err(|e| UploadError::Transport(format!("{:#}", e)))?;

        match &transfer_source {
            TransferSource::File(path) => self.transfer_file(path, &credentials, &session, &sink).await?,
            TransferSource::Url(fetch) => self.fetch_url(fetch, &credentials, &session, &sink).await?,
        }
        drop(staged);

        let registered = self.register(&name, &destination_path, &credentials, &sink).await?;
        tracing::info!(
            "Staged upload of {} registered as {} in {}ms",
            destination_path,
            registered.id,
            started.elapsed().as_millis()
        );
        Ok(registered)
    }

    async fn transfer_file(
        &self,
        path: &Path,
        credentials: &StoreCredentials,
        session: &Arc<dyn ObjectStoreSession>,
        sink: &Arc<dyn StageSink>,
    ) -> Result<(), UploadError> {
        let started = Instant::now();
        sink.stage(
            TaskStatus::UploadingToStore,
            ProgressEvent::new(ProgressStatus::UploadingToStoreStarted, TRANSFER_START_PROGRESS)
                .with_message("Uploading to object store..."),
        );

        let progress_sink = sink.clone();
        let on_progress: TransferProgressCallback = Arc::new(move |p: TransferProgress| {
            progress_sink.stage(
                TaskStatus::UploadingToStore,
                ProgressEvent::new(ProgressStatus::UploadingToStore, scale_transfer_progress(p.progress))
                    .with_transfer(p.loaded, p.total, p.speed),
            );
        });

        let handle = session
            .begin_multipart_upload(
                &credentials.bucket_name,
                &credentials.object_key,
                path,
                self.part_concurrency,
                on_progress,
            )
            .await
            .map_err(|e| UploadError::Transport(format!("{:#}", e)))?;
        handle
            .wait()
            .await
            .map_err(|e| UploadError::Transport(format!("{:#}", e)))?;

        tracing::debug!(
            "Transfer of {:?} to {} finished in {}ms",
            path,
            credentials.object_key,
            started.elapsed().as_millis()
        );
        sink.stage(
            TaskStatus::UploadingToStore,
            ProgressEvent::new(ProgressStatus::UploadingToStoreCompleted, TRANSFER_END_PROGRESS)
                .with_message("Object store upload finished."),
        );
        Ok(())
    }

    async fn fetch_url(
        &self,
        fetch: &FetchSource,
        credentials: &StoreCredentials,
        session: &Arc<dyn ObjectStoreSession>,
        sink: &Arc<dyn StageSink>,
    ) -> Result<(), UploadError> {
        let started = Instant::now();
        sink.stage(
            TaskStatus::UploadingToStore,
            ProgressEvent::new(ProgressStatus::UploadingToStoreStarted, TRANSFER_START_PROGRESS)
                .with_message("Fetching URL into object store..."),
        );
        session
            .fetch_object(&credentials.bucket_name, &credentials.object_key, fetch)
            .await
            .map_err(|e| UploadError::Transport(format!("{:#}", e)))?;
        sink.stage(
            TaskStatus::UploadingToStore,
            ProgressEvent::new(ProgressStatus::UploadingToStoreProcessing, FETCH_PROCESSING_PROGRESS)
                .with_message("Object store is fetching the file..."),
        );

        // 轮询直到对象可见
        loop {
            match session
                .object_exists(&credentials.bucket_name, &credentials.object_key)
                .await
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => tracing::debug!("Polling {} failed: {:#}", credentials.object_key, e),
            }
            if started.elapsed() >= self.fetch_timeout {
                return Err(UploadError::Transport(format!(
                    "object {} did not appear within {}s",
                    credentials.object_key,
                    self.fetch_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.fetch_poll_interval).await;
        }

        tracing::debug!("URL fetch of {} finished in {}ms", fetch.url, started.elapsed().as_millis());
        sink.stage(
            TaskStatus::UploadingToStore,
            ProgressEvent::new(ProgressStatus::UploadingToStoreCompleted, TRANSFER_END_PROGRESS)
                .with_message("Object store fetch finished."),
        );
        Ok(())
    }

    async fn register(
        &self,
        name: &str,
        destination_path: &str,
        credentials: &StoreCredentials,
        sink: &Arc<dyn StageSink>,
    ) -> Result<RegisteredFile, UploadError> {
        let started = Instant::now();
        sink.stage(
            TaskStatus::Registering,
            ProgressEvent::new(ProgressStatus::Registering, TRANSFER_END_PROGRESS)
                .with_message("Registering with metadata service..."),
        );
        let response = self.metadata.add_file(name, &credentials.object_key).await?;
        tracing::debug!("addFile for {} took {}ms", name, started.elapsed().as_millis());

        match response.file_id {
            Some(id) => Ok(RegisteredFile { id, path: destination_path.to_string() }),
            None => Err(UploadError::Registration(
                response
                    .error_msg
                    .unwrap_or_else(|| "malformed response: missing fileId".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMetadata, FakeStore, RecordingSink};

    fn executor(metadata: &Arc<FakeMetadata>, store: &Arc<FakeStore>) -> StageExecutor {
        let transfer = TransferConfig { fetch_poll_interval_ms: 10, fetch_timeout_secs: 1, ..TransferConfig::default() };
        StageExecutor::new(metadata.clone(), store.clone(), &transfer)
    }

    #[test]
    fn test_scale_transfer_progress() {
        assert_eq!(scale_transfer_progress(0.0), 10.0);
        assert_eq!(scale_transfer_progress(50.0), 50.0);
        assert_eq!(scale_transfer_progress(100.0), 90.0);
        assert_eq!(scale_transfer_progress(250.0), 90.0);
    }

    #[tokio::test]
    async fn test_staged_file_success_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let metadata = Arc::new(FakeMetadata::new());
        let store = Arc::new(FakeStore::new());
        let sink = Arc::new(RecordingSink::default());
        let request = StageRequest {
            name: "a.txt".to_string(),
            destination_path: "docs/a.txt".to_string(),
            source: StageSource::Staged(StagedFile::new(&path)),
        };

        let registered = executor(&metadata, &store).execute(request, sink.clone()).await.unwrap();
        assert_eq!(registered.path, "docs/a.txt");
        assert!(!path.exists());
        assert_eq!(store.uploaded_sources(), vec!["a.txt".to_string()]);

        let progress = sink.progress();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
        assert_eq!(progress.first(), Some(&STAGED_PROGRESS));
        assert_eq!(progress.last(), Some(&TRANSFER_END_PROGRESS));
        assert_eq!(sink.last_status(), Some(TaskStatus::Registering));
    }

    #[tokio::test]
    async fn test_missing_file_id_fails_and_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        std::fs::write(&path, b"payload").unwrap();

        let metadata = Arc::new(FakeMetadata::new());
        metadata.omit_file_id_for("b.bin");
        let store = Arc::new(FakeStore::new());
        let request = StageRequest {
            name: "b.bin".to_string(),
            destination_path: "b.bin".to_string(),
            source: StageSource::Staged(StagedFile::new(&path)),
        };

        let err = executor(&metadata, &store)
            .execute(request, Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Registration(_)));
        assert!(err.to_string().contains("fileId"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_transfer_failure_deletes_staged_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"payload").unwrap();

        let metadata = Arc::new(FakeMetadata::new());
        let store = Arc::new(FakeStore::new());
        store.fail_uploads_of("bad.bin");
        let request = StageRequest {
            name: "bad.bin".to_string(),
            destination_path: "bad.bin".to_string(),
            source: StageSource::Staged(StagedFile::new(&path)),
        };

        let err = executor(&metadata, &store)
            .execute(request, Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
        assert!(!path.exists());
        assert_eq!(metadata.registrations(), 0);
    }

    #[tokio::test]
    async fn test_credentials_fetched_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(FakeMetadata::new());
        let store = Arc::new(FakeStore::new());
        let executor = executor(&metadata, &store);

        for name in ["one.txt", "two.txt"] {
            let path = dir.path().join(name);
            std::fs::write(&path, name).unwrap();
            let request = StageRequest {
                name: name.to_string(),
                destination_path: name.to_string(),
                source: StageSource::ServerFile(path.clone()),
            };
            executor.execute(request, Arc::new(RecordingSink::default())).await.unwrap();
            // 服务器上的源文件不会被删除
            assert!(path.exists());
        }
        assert_eq!(metadata.credential_requests(), 2);
    }

    #[tokio::test]
    async fn test_url_fetch_stages() {
        let metadata = Arc::new(FakeMetadata::new());
        let store = Arc::new(FakeStore::new());
        let sink = Arc::new(RecordingSink::default());
        let request = StageRequest {
            name: "clip.mp4".to_string(),
            destination_path: "clip.mp4".to_string(),
            source: StageSource::Url(FetchSource {
                url: "https://example.com/clip.mp4".to_string(),
                referer: None,
                user_agent: None,
            }),
        };

        executor(&metadata, &store).execute(request, sink.clone()).await.unwrap();
        assert_eq!(sink.progress(), vec![0.0, 10.0, 50.0, 90.0, 90.0]);
        assert_eq!(store.fetched_urls(), vec!["https://example.com/clip.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_server_file() {
        let metadata = Arc::new(FakeMetadata::new());
        let store = Arc::new(FakeStore::new());
        let request = StageRequest {
            name: "gone.txt".to_string(),
            destination_path: "gone.txt".to_string(),
            source: StageSource::ServerFile(PathBuf::from("/definitely/not/here/gone.txt")),
        };
        let err = executor(&metadata, &store)
            .execute(request, Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
        assert_eq!(metadata.credential_requests(), 0);
    }
}
