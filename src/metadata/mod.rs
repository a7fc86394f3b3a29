//! Metadata service seam / 元数据服务接口

pub mod client;

pub use client::HttpMetadataClient;

use async_trait::async_trait;

use crate::error::UploadError;
use crate::storage::StoreCredentials;

/// `addFile` 的原始结果，是否缺少 fileId 由调用方判断
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationResponse {
    pub file_id: Option<String>,
    pub error_msg: Option<String>,
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Short-lived object store credentials plus the object key to write.
    async fn store_credentials(&self) -> Result<StoreCredentials, UploadError>;

    async fn add_file(&self, name: &str, object_key: &str) -> Result<RegistrationResponse, UploadError>;
}
