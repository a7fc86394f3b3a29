//! Object store client seam / 对象存储接口
//!
//! A connector turns short-lived credentials into a session; a session runs
//! multipart transfers and URL fetches against one store.

pub mod bucket;

pub use bucket::S3Connector;

use async_trait::async_trait;
use anyhow::{anyhow, Result};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 临时凭证（每次尝试单独获取，不跨任务缓存）
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub endpoint: Option<String>,
    pub bucket_name: String,
    /// 本次上传的对象键
    pub object_key: String,
}

/// 传输进度 / Transfer progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// 0-100
    pub progress: f32,
    pub loaded: u64,
    pub total: u64,
    /// bytes per second
    pub speed: f64,
}

impl TransferProgress {
    pub fn new(loaded: u64, total: u64, elapsed: Duration) -> Self {
        let progress = if total == 0 {
            100.0
        } else {
            (loaded as f64 / total as f64 * 100.0) as f32
        };
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { loaded as f64 / secs } else { 0.0 };
        Self { progress, loaded, total, speed }
    }
}

/// 进度回调类型 / Progress callback type
pub type TransferProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// 远程抓取来源
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSource {
    pub url: String,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

/// Handle of a transfer running in the background / 后台传输句柄
pub struct TransferHandle {
    join: JoinHandle<Result<()>>,
}

impl TransferHandle {
    pub fn spawn<F>(transfer: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self { join: tokio::spawn(transfer) }
    }

    pub fn is_completed(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the transfer to finish / 等待传输结束
    pub async fn wait(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| anyhow!("transfer task aborted: {}", e))?
    }
}

#[async_trait]
pub trait ObjectStoreSession: Send + Sync {
    /// Start a multipart upload of `source`; progress is reported per finished part.
    async fn begin_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        source: &Path,
        part_concurrency: usize,
        on_progress: TransferProgressCallback,
    ) -> Result<TransferHandle>;

    /// Have the store ingest `source`; returns once the fetch has been handed off.
    async fn fetch_object(&self, bucket: &str, object: &str, source: &FetchSource) -> Result<()>;

    async fn object_exists(&self, bucket: &str, object: &str) -> Result<bool>;
}

pub trait ObjectStoreConnector: Send + Sync {
    fn connect(&self, credentials: &StoreCredentials) -> Result<Arc<dyn ObjectStoreSession>>;
}
