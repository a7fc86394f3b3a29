use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::storage::FetchSource;
use crate::task::{ItemKind, OriginClass, PayloadInfo, Task};

/// 客户端上传落盘后的暂存目录；丢弃时整个目录被删除
#[derive(Debug)]
pub struct StagedUpload {
    /// 仅持有，丢弃时删除目录
    _dir: TempDir,
    root: PathBuf,
    files: usize,
}

impl StagedUpload {
    /// `root` is the staged file (single item) or directory (tree) inside `dir`.
    pub fn new(dir: TempDir, root: PathBuf, files: usize) -> Self {
        Self { _dir: dir, root, files }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> usize {
        self.files
    }
}

/// 任务负载，恰好一种
#[derive(Debug)]
pub enum TaskPayload {
    Staged(StagedUpload),
    /// Logical path, validated against the allow-list again at run time
    RemotePath(String),
    FetchUrl(FetchSource),
}

impl TaskPayload {
    pub fn info(&self) -> PayloadInfo {
        match self {
            TaskPayload::Staged(staged) => PayloadInfo::RawBytes { files: staged.files() },
            TaskPayload::RemotePath(path) => PayloadInfo::RemotePath { path: path.clone() },
            TaskPayload::FetchUrl(fetch) => PayloadInfo::FetchUrl { url: fetch.url.clone() },
        }
    }
}

/// 一次提交的完整描述（调度器持有，直到准入执行）
#[derive(Debug)]
pub struct UploadJob {
    pub id: String,
    pub name: String,
    pub item_kind: ItemKind,
    pub destination_dataset_id: String,
    pub base_path: String,
    pub payload: TaskPayload,
}

impl UploadJob {
    pub fn new(
        id: Option<String>,
        name: String,
        item_kind: ItemKind,
        destination_dataset_id: String,
        base_path: String,
        payload: TaskPayload,
    ) -> Self {
        Self {
            id: id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name,
            item_kind,
            destination_dataset_id,
            base_path,
            payload,
        }
    }

    pub fn origin_class(&self) -> OriginClass {
        self.payload.info().origin_class()
    }

    pub fn to_task(&self) -> Task {
        Task::new(
            Some(self.id.clone()),
            self.name.clone(),
            self.item_kind,
            self.payload.info(),
            self.destination_dataset_id.clone(),
            self.base_path.clone(),
        )
    }
}
