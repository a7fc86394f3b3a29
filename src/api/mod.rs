pub mod progress;
pub mod server;
pub mod tasks;
pub mod uploads;

use serde::Serialize;

use dataset_uploader::error::UploadError;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 200,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    /// 按错误类型映射响应码
    pub fn from_error(err: &UploadError) -> Self {
        Self {
            code: i32::from(err.code()),
            message: err.to_string(),
            data: None,
        }
    }
}
