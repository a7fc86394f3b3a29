//! Upload error taxonomy / 上传错误类型

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Object store transfer failed: {0}")]
    Transport(String),

    #[error("Metadata registration failed: {0}")]
    Registration(String),

    #[error("No files found in the directory to upload.")]
    EmptyDirectory,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// HTTP-style code for the `ApiResponse` envelope / 对应的响应码
    pub fn code(&self) -> u16 {
        match self {
            UploadError::Validation(_) => 400,
            UploadError::AccessDenied(_) => 403,
            UploadError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err.to_string())
    }
}
