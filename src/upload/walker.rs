//! Recursive directory upload / 目录递归上传

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;

use super::stage::{StageExecutor, StageRequest, StageSource, StagedFile};
use crate::error::UploadError;
use crate::progress::{FileResult, ProgressEvent, ProgressStatus};
use crate::scheduler::TaskReporter;
use crate::utils::{join_dataset_path, relative_dataset_path};

/// Depth-first walker that runs the stage executor once per discovered file.
///
/// The whole tree is enumerated and every file registered as a sub-task
/// before the first upload starts, so the parent's mean progress is taken
/// over the full tree. Every file runs behind its own error boundary: a
/// failing file becomes a failed [`FileResult`] and the traversal goes on.
pub struct DirectoryWalker<'a> {
    executor: &'a StageExecutor,
    reporter: &'a TaskReporter,
    root: PathBuf,
    base_path: String,
    consume: bool,
}

/// 遍历发现的条目；`unreadable` 表示无法读取的子目录
struct WalkEntry {
    path: PathBuf,
    file_name: String,
    relative: String,
    destination: String,
    sub_id: Option<String>,
    unreadable: Option<UploadError>,
}

impl<'a> DirectoryWalker<'a> {
    pub fn new(executor: &'a StageExecutor, reporter: &'a TaskReporter, root: &Path, base_path: &str) -> Self {
        Self {
            executor,
            reporter,
            root: root.to_path_buf(),
            base_path: base_path.to_string(),
            consume: false,
        }
    }

    /// 上传后删除源文件（客户端暂存目录）
    pub fn consuming(mut self) -> Self {
        self.consume = true;
        self
    }

    /// Walk the tree. Only an unreadable root is an error; an empty tree
    /// yields an empty list.
    pub async fn walk(&self) -> Result<Vec<FileResult>, UploadError> {
        let root_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.reporter.emit(
            ProgressEvent::new(ProgressStatus::ProcessingFolder, 1.0)
                .with_message(format!("Processing folder: {}", root_name)),
        );

        let mut found = Vec::new();
        self.collect(self.root.clone(), &mut found).await?;
        let entries: Vec<WalkEntry> = found
            .into_iter()
            .map(|(path, unreadable)| self.register(path, unreadable))
            .collect();
        tracing::debug!("Folder {:?}: {} entries to upload", self.root, entries.len());

        let mut results = Vec::with_capacity(entries.len());
        let mut current_dir: Option<&str> = None;
        for entry in &entries {
            if let Some(error) = &entry.unreadable {
                results.push(self.fail_entry(entry, error.clone()));
                continue;
            }
            let dir = entry.relative.rsplit_once('/').map(|(dir, _)| dir);
            if dir.is_some() && dir != current_dir {
                self.reporter.emit(
                    ProgressEvent::new(ProgressStatus::ProcessingSubdir, self.reporter.current_progress())
                        .with_message(format!("Processing sub-folder: {}", dir.unwrap_or_default())),
                );
            }
            current_dir = dir;
            results.push(self.upload_file(entry).await);
        }

        tracing::info!(
            "Folder {:?}: {} files processed, {} failed",
            self.root,
            results.len(),
            results.iter().filter(|r| !r.success).count()
        );
        Ok(results)
    }

    fn collect<'b>(
        &'b self,
        dir: PathBuf,
        found: &'b mut Vec<(PathBuf, Option<UploadError>)>,
    ) -> BoxFuture<'b, Result<(), UploadError>> {
        async move {
            let mut reader = tokio::fs::read_dir(&dir).await?;
            let mut entries = Vec::new();
            while let Some(entry) = reader.next_entry().await? {
                entries.push(entry);
            }
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!("Skipping {:?}: {}", path, e);
                        continue;
                    }
                };

                let is_dir = if file_type.is_symlink() {
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) if meta.is_file() => false,
                        Ok(_) => {
                            tracing::debug!("Skipping symlinked directory {:?}", path);
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("Skipping dangling link {:?}: {}", path, e);
                            continue;
                        }
                    }
                } else {
                    file_type.is_dir()
                };

                if is_dir {
                    if let Err(e) = self.collect(path.clone(), found).await {
                        found.push((path, Some(e)));
                    }
                } else if file_type.is_file() || file_type.is_symlink() {
                    found.push((path, None));
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn relative_of(&self, path: &Path) -> String {
        relative_dataset_path(&self.root, path).unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    /// 登记子任务
    fn register(&self, path: PathBuf, unreadable: Option<UploadError>) -> WalkEntry {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative = self.relative_of(&path);
        let destination = join_dataset_path(&self.base_path, &relative);
        let sub_id = self.reporter.add_sub_task(&file_name, &destination);
        WalkEntry {
            path,
            file_name,
            relative,
            destination,
            sub_id,
            unreadable,
        }
    }

    async fn upload_file(&self, entry: &WalkEntry) -> FileResult {
        let file_name = entry.file_name.clone();
        let destination = entry.destination.clone();

        self.reporter.emit(
            ProgressEvent::new(ProgressStatus::ProcessingFile, self.reporter.current_progress())
                .with_message(format!("Processing file: {}", destination))
                .with_file_name(&file_name),
        );

        let source = if self.consume {
            StageSource::Staged(StagedFile::new(entry.path.clone()))
        } else {
            StageSource::ServerFile(entry.path.clone())
        };
        let request = StageRequest {
            name: file_name.clone(),
            destination_path: destination.clone(),
            source,
        };
        let sink = self.reporter.sub_task_sink(entry.sub_id.clone(), &file_name);

        let outcome = AssertUnwindSafe(self.executor.execute(request, sink))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(UploadError::Internal(format!("panic while uploading {}", destination))));

        match outcome {
            Ok(registered) => {
                self.reporter.complete_sub_task(entry.sub_id.as_deref(), &file_name, &registered);
                FileResult {
                    success: true,
                    file_name,
                    relative_path: destination,
                    file_id: Some(registered.id),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!("Upload of {} failed: {}", destination, e);
                self.reporter.fail_sub_task(entry.sub_id.as_deref(), &file_name, &e);
                FileResult {
                    success: false,
                    file_name,
                    relative_path: destination,
                    file_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// 无法读取的子目录记为一个失败条目
    fn fail_entry(&self, entry: &WalkEntry, error: UploadError) -> FileResult {
        tracing::error!("Cannot read folder {}: {}", entry.destination, error);
        self.reporter.fail_sub_task(entry.sub_id.as_deref(), &entry.file_name, &error);
        FileResult {
            success: false,
            file_name: entry.file_name.clone(),
            relative_path: entry.destination.clone(),
            file_id: None,
            error: Some(error.to_string()),
        }
    }
}
