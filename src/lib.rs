pub mod config;
pub mod error;
pub mod utils;
pub mod validator;
pub mod progress;
pub mod task;
pub mod storage;
pub mod metadata;
pub mod upload;
pub mod scheduler;

// Test doubles for the collaborator seams / 测试用替身
#[cfg(test)]
pub(crate) mod testing;
