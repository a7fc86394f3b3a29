use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use super::types::{ItemKind, OriginClass, TaskStatus};
use crate::error::UploadError;

/// 元数据服务登记成功后返回的文件信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisteredFile {
    pub id: String,
    /// 数据集内的相对路径
    pub path: String,
}

/// 任务负载描述（可序列化部分，实际字节由调度器持有）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadInfo {
    /// 客户端上传的原始字节，已落盘到暂存目录
    RawBytes { files: usize },
    /// 服务器上的文件或目录
    RemotePath { path: String },
    /// 远程 URL 抓取
    FetchUrl { url: String },
}

impl PayloadInfo {
    pub fn origin_class(&self) -> OriginClass {
        match self {
            PayloadInfo::RawBytes { .. } => OriginClass::LocalOrigin,
            PayloadInfo::RemotePath { .. } => OriginClass::RemoteOrigin,
            PayloadInfo::FetchUrl { .. } => OriginClass::UrlFetch,
        }
    }
}

/// 目录任务中的单个文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub name: String,
    pub relative_path: String,
    pub status: TaskStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub registered: Option<RegisteredFile>,
}

impl SubTask {
    pub fn new(name: String, relative_path: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            relative_path,
            status: TaskStatus::Uploading,
            progress: 0.0,
            error: None,
            registered: None,
        }
    }
}

/// 目录任务的最终结论（由子任务推导，不能直接设置）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeVerdict {
    Empty,
    AllSucceeded { total: usize },
    Partial { failed: usize, total: usize },
    AllFailed { total: usize },
}

impl TreeVerdict {
    pub fn from_counts(total: usize, failed: usize) -> Self {
        if total == 0 {
            TreeVerdict::Empty
        } else if failed == 0 {
            TreeVerdict::AllSucceeded { total }
        } else if failed >= total {
            TreeVerdict::AllFailed { total }
        } else {
            TreeVerdict::Partial { failed, total }
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TreeVerdict::AllSucceeded { .. } => TaskStatus::Completed,
            TreeVerdict::Partial { .. } => TaskStatus::CompletedWithErrors,
            TreeVerdict::Empty | TreeVerdict::AllFailed { .. } => TaskStatus::Failed,
        }
    }

    pub fn message(&self) -> String {
        match self {
            TreeVerdict::Empty => UploadError::EmptyDirectory.to_string(),
            TreeVerdict::AllSucceeded { total } => {
                format!("Folder upload completed successfully ({} files).", total)
            }
            TreeVerdict::Partial { failed, total } => {
                format!("Folder upload completed with errors: {} of {} files failed.", failed, total)
            }
            TreeVerdict::AllFailed { total } => format!("All {} files failed to upload.", total),
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            TreeVerdict::AllSucceeded { .. } => None,
            _ => Some(self.message()),
        }
    }
}

/// 轻量级任务信息（用于SSE推送，不包含子任务详情）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub item_kind: ItemKind,
    pub origin_class: OriginClass,
    pub status: TaskStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub destination_dataset_id: String,
    pub upload_id: Option<String>,
    pub total_files: usize,
    pub processed_files: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            item_kind: task.item_kind,
            origin_class: task.origin_class,
            status: task.status,
            progress: task.progress,
            error: task.error.clone(),
            destination_dataset_id: task.destination_dataset_id.clone(),
            upload_id: task.upload_id.clone(),
            total_files: task.sub_tasks.len(),
            processed_files: task.sub_tasks.iter().filter(|s| s.status.is_terminal()).count(),
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
        }
    }
}

/// 任务信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// 创建顺序（同一时间戳下的排序依据）
    pub seq: u64,
    pub name: String,
    pub item_kind: ItemKind,
    pub origin_class: OriginClass,
    pub status: TaskStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub destination_dataset_id: String,
    pub base_path: String,
    pub payload: PayloadInfo,
    pub sub_tasks: Vec<SubTask>,
    /// 准入时生成，用于订阅进度通道
    pub upload_id: Option<String>,
    pub registered: Option<RegisteredFile>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: Option<String>,
        name: String,
        item_kind: ItemKind,
        payload: PayloadInfo,
        destination_dataset_id: String,
        base_path: String,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            seq: 0,
            name,
            item_kind,
            origin_class: payload.origin_class(),
            status: TaskStatus::Queued,
            progress: 0.0,
            error: None,
            destination_dataset_id,
            base_path,
            payload,
            sub_tasks: Vec::new(),
            upload_id: None,
            registered: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// 子任务进度的算术平均
    pub fn mean_sub_task_progress(&self) -> f32 {
        if self.sub_tasks.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.sub_tasks.iter().map(|s| s.progress).sum();
        sum / self.sub_tasks.len() as f32
    }

    pub fn tree_verdict(&self) -> TreeVerdict {
        let failed = self
            .sub_tasks
            .iter()
            .filter(|s| s.status == TaskStatus::Failed)
            .count();
        TreeVerdict::from_counts(self.sub_tasks.len(), failed)
    }
}
