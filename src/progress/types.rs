use serde::{Deserialize, Serialize};

use crate::task::RegisteredFile;

/// 进度通道上的状态值
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    ProcessingServer,
    ProcessingFolder,
    ProcessingSubdir,
    ProcessingFile,
    UploadingToStoreStarted,
    UploadingToStore,
    UploadingToStoreProcessing,
    UploadingToStoreCompleted,
    Registering,
    FileCompleted,
    FileFailed,
    Completed,
    CompletedWithErrors,
    Failed,
    Removed,
}

/// 目录任务中单个文件的结果（随最终事件下发）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub success: bool,
    pub file_name: String,
    pub relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 进度事件（SSE 数据体）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub individual_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// 字节/秒
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<FileResult>>,
}

impl ProgressEvent {
    pub fn new(status: ProgressStatus, progress: f32) -> Self {
        Self {
            status,
            progress,
            message: None,
            error: None,
            individual_file_name: None,
            registered_id: None,
            registered_path: None,
            loaded_bytes: None,
            total_bytes: None,
            speed: None,
            results: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.individual_file_name = Some(name.into());
        self
    }

    pub fn with_registered(mut self, registered: &RegisteredFile) -> Self {
        self.registered_id = Some(registered.id.clone());
        self.registered_path = Some(registered.path.clone());
        self
    }

    pub fn with_transfer(mut self, loaded: u64, total: u64, speed: f64) -> Self {
        self.loaded_bytes = Some(loaded);
        self.total_bytes = Some(total);
        self.speed = Some(speed);
        self
    }

    pub fn with_results(mut self, results: Vec<FileResult>) -> Self {
        self.results = Some(results);
        self
    }
}
