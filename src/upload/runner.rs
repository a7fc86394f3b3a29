//! Task runner wiring payloads to the stage executor and the walker

use std::sync::Arc;

use async_trait::async_trait;

use super::stage::{StageExecutor, StageRequest, StageSource, StagedFile};
use super::walker::DirectoryWalker;
use crate::error::UploadError;
use crate::progress::{ProgressEvent, ProgressStatus};
use crate::scheduler::{StagedUpload, TaskOutcome, TaskPayload, TaskReporter, TaskRunner, UploadJob};
use crate::storage::FetchSource;
use crate::task::ItemKind;
use crate::utils::join_dataset_path;
use crate::validator::PathValidator;

/// 上传任务执行器
#[derive(Clone)]
pub struct UploadRunner {
    executor: StageExecutor,
    validator: Arc<dyn PathValidator>,
}

impl UploadRunner {
    pub fn new(executor: StageExecutor, validator: Arc<dyn PathValidator>) -> Self {
        Self { executor, validator }
    }

    async fn run_staged(
        &self,
        job: &JobInfo,
        staged: StagedUpload,
        reporter: &TaskReporter,
    ) -> Result<TaskOutcome, UploadError> {
        match job.item_kind {
            ItemKind::SingleItem => {
                let request = StageRequest {
                    name: job.name.clone(),
                    destination_path: job.destination(),
                    source: StageSource::Staged(StagedFile::new(staged.root())),
                };
                let registered = self.executor.execute(request, reporter.task_sink()).await?;
                Ok(TaskOutcome::Registered(registered))
            }
            ItemKind::Tree => {
                let results = DirectoryWalker::new(&self.executor, reporter, staged.root(), &job.base_path)
                    .consuming()
                    .walk()
                    .await?;
                Ok(TaskOutcome::Tree(results))
            }
        }
    }

    async fn run_remote(
        &self,
        job: &JobInfo,
        logical_path: &str,
        reporter: &TaskReporter,
    ) -> Result<TaskOutcome, UploadError> {
        // 执行前重新校验，白名单可能已变化
        let validation = self.validator.validate(logical_path);
        if !validation.allowed {
            return Err(UploadError::AccessDenied(logical_path.to_string()));
        }
        let resolved = validation.resolved_path;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| UploadError::NotFound(logical_path.to_string()))?;

        match job.item_kind {
            ItemKind::SingleItem if meta.is_file() => {
                let request = StageRequest {
                    name: job.name.clone(),
                    destination_path: job.destination(),
                    source: StageSource::ServerFile(resolved),
                };
                let registered = self.executor.execute(request, reporter.task_sink()).await?;
                Ok(TaskOutcome::Registered(registered))
            }
            ItemKind::Tree if meta.is_dir() => {
                reporter.emit(
                    ProgressEvent::new(ProgressStatus::ProcessingServer, 0.0)
                        .with_message(format!("Reading folder on server: {}", logical_path)),
                );
                let results = DirectoryWalker::new(&self.executor, reporter, &resolved, &job.base_path)
                    .walk()
                    .await?;
                Ok(TaskOutcome::Tree(results))
            }
            ItemKind::SingleItem => Err(UploadError::Validation(format!("{} is not a file", logical_path))),
            ItemKind::Tree => Err(UploadError::Validation(format!("{} is not a directory", logical_path))),
        }
    }

    async fn run_fetch(
        &self,
        job: &JobInfo,
        fetch: FetchSource,
        reporter: &TaskReporter,
    ) -> Result<TaskOutcome, UploadError> {
        if job.item_kind == ItemKind::Tree {
            return Err(UploadError::Validation("a URL can only be fetched as a single item".to_string()));
        }
        let request = StageRequest {
            name: job.name.clone(),
            destination_path: job.destination(),
            source: StageSource::Url(fetch),
        };
        let registered = self.executor.execute(request, reporter.task_sink()).await?;
        Ok(TaskOutcome::Registered(registered))
    }
}

struct JobInfo {
    name: String,
    item_kind: ItemKind,
    base_path: String,
}

impl JobInfo {
    fn destination(&self) -> String {
        join_dataset_path(&self.base_path, &self.name)
    }
}

#[async_trait]
impl TaskRunner for UploadRunner {
    async fn run(&self, job: UploadJob, reporter: TaskReporter) -> TaskOutcome {
        let UploadJob { id, name, item_kind, base_path, payload, .. } = job;
        let info = JobInfo { name, item_kind, base_path };
        tracing::info!("Running task {} ({}) as upload {}", id, info.name, reporter.upload_id());

        let result = match payload {
            TaskPayload::Staged(staged) => self.run_staged(&info, staged, &reporter).await,
            TaskPayload::RemotePath(path) => self.run_remote(&info, &path, &reporter).await,
            TaskPayload::FetchUrl(fetch) => self.run_fetch(&info, fetch, &reporter).await,
        };
        result.unwrap_or_else(TaskOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use crate::config::TransferConfig;
    use crate::progress::ProgressRegistry;
    use crate::scheduler::{SchedulerLimits, UploadScheduler};
    use crate::task::{TaskManager, TaskStatus};
    use crate::testing::{wait_terminal, FakeMetadata, FakeStore};
    use crate::validator::AllowListValidator;

    struct Harness {
        scheduler: UploadScheduler,
        metadata: Arc<FakeMetadata>,
        store: Arc<FakeStore>,
        root: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let root = tempfile::tempdir().unwrap();
        let uploads = root.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let validator = AllowListValidator::new(root.path(), &[("uploads".to_string(), uploads)]);

        let metadata = Arc::new(FakeMetadata::new());
        let store = Arc::new(FakeStore::new());
        let transfer = TransferConfig { fetch_poll_interval_ms: 10, fetch_timeout_secs: 1, ..TransferConfig::default() };
        let executor = StageExecutor::new(metadata.clone(), store.clone(), &transfer);
        let runner = UploadRunner::new(executor, Arc::new(validator));
        let scheduler = UploadScheduler::new(
            SchedulerLimits { max_local: 2, max_remote: 2 },
            TaskManager::new(),
            ProgressRegistry::new(),
            Arc::new(runner),
        );
        Harness { scheduler, metadata, store, root }
    }

    fn job(name: &str, item_kind: ItemKind, base_path: &str, payload: TaskPayload) -> UploadJob {
        UploadJob::new(None, name.to_string(), item_kind, "42".to_string(), base_path.to_string(), payload)
    }

    fn stage_single(name: &str) -> (StagedUpload, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(name);
        std::fs::write(&file, b"content").unwrap();
        let dir_path = dir.path().to_path_buf();
        (StagedUpload::new(dir, file, 1), dir_path)
    }

    fn write(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, rel.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_local_single_item_registered_and_cleaned() {
        let h = harness();
        let (staged, staged_dir) = stage_single("report.csv");
        let id = h
            .scheduler
            .submit(job("report.csv", ItemKind::SingleItem, "docs", TaskPayload::Staged(staged)))
            .unwrap();

        assert_eq!(wait_terminal(h.scheduler.tasks(), &id).await, TaskStatus::Completed);
        let task = h.scheduler.tasks().get_task(&id).unwrap();
        let registered = task.registered.unwrap();
        assert_eq!(registered.path, "docs/report.csv");
        assert_eq!(registered.id, "file-1");
        assert_eq!(task.progress, 100.0);
        assert!(!staged_dir.exists());
    }

    #[tokio::test]
    async fn test_missing_file_id_fails_and_still_cleans() {
        let h = harness();
        h.metadata.omit_file_id_for("report.csv");
        let (staged, staged_dir) = stage_single("report.csv");
        let id = h
            .scheduler
            .submit(job("report.csv", ItemKind::SingleItem, "", TaskPayload::Staged(staged)))
            .unwrap();

        assert_eq!(wait_terminal(h.scheduler.tasks(), &id).await, TaskStatus::Failed);
        let error = h.scheduler.tasks().get_task(&id).unwrap().error.unwrap();
        assert!(error.contains("missing fileId"));
        assert!(!staged_dir.exists());
    }

    #[tokio::test]
    async fn test_remote_tree_uploads_every_file() {
        let h = harness();
        let uploads = h.root.path().join("uploads");
        write(&uploads, "photos/a.jpg");
        write(&uploads, "photos/2024/b.jpg");

        let id = h
            .scheduler
            .submit(job(
                "photos",
                ItemKind::Tree,
                "imported",
                TaskPayload::RemotePath("uploads/photos".to_string()),
            ))
            .unwrap();

        assert_eq!(wait_terminal(h.scheduler.tasks(), &id).await, TaskStatus::Completed);
        let task = h.scheduler.tasks().get_task(&id).unwrap();
        let mut paths: Vec<String> = task.sub_tasks.iter().map(|s| s.relative_path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["imported/2024/b.jpg", "imported/a.jpg"]);
        assert_eq!(h.metadata.registrations(), 2);
        // 服务器文件保留
        assert!(uploads.join("photos/a.jpg").exists());
    }

    #[tokio::test]
    async fn test_remote_path_outside_allow_list_denied() {
        let h = harness();
        write(h.root.path(), "secret/keys.txt");
        let id = h
            .scheduler
            .submit(job(
                "keys.txt",
                ItemKind::SingleItem,
                "",
                TaskPayload::RemotePath("secret/keys.txt".to_string()),
            ))
            .unwrap();

        assert_eq!(wait_terminal(h.scheduler.tasks(), &id).await, TaskStatus::Failed);
        let error = h.scheduler.tasks().get_task(&id).unwrap().error.unwrap();
        assert!(error.starts_with("Access denied"));
        assert_eq!(h.metadata.credential_requests(), 0);
        assert!(h.store.uploaded_sources().is_empty());
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let h = harness();
        write(&h.root.path().join("uploads"), "one.bin");
        let id = h
            .scheduler
            .submit(job("one.bin", ItemKind::Tree, "", TaskPayload::RemotePath("uploads/one.bin".to_string())))
            .unwrap();

        assert_eq!(wait_terminal(h.scheduler.tasks(), &id).await, TaskStatus::Failed);
        let error = h.scheduler.tasks().get_task(&id).unwrap().error.unwrap();
        assert!(error.contains("not a directory"));
    }

    #[tokio::test]
    async fn test_url_fetch_registered() {
        let h = harness();
        let fetch = FetchSource {
            url: "https://example.com/data.zip".to_string(),
            referer: None,
            user_agent: None,
        };
        let id = h
            .scheduler
            .submit(job("data.zip", ItemKind::SingleItem, "", TaskPayload::FetchUrl(fetch)))
            .unwrap();

        assert_eq!(wait_terminal(h.scheduler.tasks(), &id).await, TaskStatus::Completed);
        assert_eq!(h.store.fetched_urls(), vec!["https://example.com/data.zip".to_string()]);
        assert_eq!(h.scheduler.stats().active_url_fetch, 0);
    }
}
