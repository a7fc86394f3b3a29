//! Application configuration module / 应用配置模块
//!
//! Manages application configuration loaded from config.json
//! Creates default config file on first run / 首次运行时创建默认配置文件

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location / 配置文件路径环境变量
pub const CONFIG_ENV: &str = "UPLOADER_CONFIG";

/// Application configuration / 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration / 服务器配置
    pub server: ServerConfig,
    /// Local staging of client-origin bytes / 本地暂存配置
    pub staging: StagingConfig,
    /// Admission bounds / 并发上限
    pub scheduler: SchedulerConfig,
    /// Object store transfer tuning / 传输配置
    pub transfer: TransferConfig,
    /// Metadata service endpoint / 元数据服务配置
    pub metadata: MetadataConfig,
    /// Server-resident roots remote-origin paths may come from / 允许访问的服务器路径
    pub allowed_paths: AllowedPathsConfig,
}

/// Server configuration / 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host address / 服务器监听地址
    pub host: String,
    /// Server port / 服务器端口
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_local_uploads: usize,
    pub max_remote_uploads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Parts in flight per multipart upload / 分片并发数
    pub part_concurrency: usize,
    pub part_size_mb: usize,
    pub fetch_poll_interval_ms: u64,
    pub fetch_timeout_secs: u64,
    /// Used when the credentials carry no endpoint / 凭证未返回 endpoint 时使用
    pub default_endpoint: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub base_url: String,
    /// Raw cookie header / Cookie 字符串
    pub cookie: String,
    /// File holding the cookie, read when `cookie` is empty / Cookie 文件
    pub cookie_file: String,
    pub user_agent: String,
    pub token_path: String,
    pub credentials_path: String,
    pub add_file_path: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowedPathsConfig {
    /// Directory non-aliased relative paths are resolved against / 相对路径基准目录
    pub base_dir: String,
    pub roots: Vec<AllowedRoot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedRoot {
    pub name: String,
    pub alias: String,
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8190,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: "data/uploads".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_local_uploads: 2,
            max_remote_uploads: 3,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_concurrency: 2,
            part_size_mb: 8,
            fetch_poll_interval_ms: 500,
            fetch_timeout_secs: 300,
            default_endpoint: "https://bj.bcebos.com".to_string(),
            region: "bj".to_string(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://aistudio.baidu.com".to_string(),
            cookie: String::new(),
            cookie_file: "data/cookie.txt".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
            token_path: "/studio/token".to_string(),
            credentials_path: "/studio/dataset/bosacl".to_string(),
            add_file_path: "/studio/file/addfile".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for AllowedPathsConfig {
    fn default() -> Self {
        Self {
            base_dir: "data".to_string(),
            roots: vec![AllowedRoot {
                name: "Uploads".to_string(),
                alias: "uploads".to_string(),
                path: "data/uploads".to_string(),
            }],
        }
    }
}

impl TransferConfig {
    pub fn part_size_bytes(&self) -> usize {
        self.part_size_mb.max(5) * 1024 * 1024
    }

    pub fn fetch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_poll_interval_ms.max(10))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl AppConfig {
    /// Get the server bind address / 获取服务器绑定地址
    pub fn get_bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get the staging directory path / 获取暂存目录
    pub fn get_staging_dir(&self) -> PathBuf {
        PathBuf::from(&self.staging.dir)
    }
}

/// Get the config file path / 获取配置文件路径
fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config() -> Result<AppConfig, String> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(config_path: &Path) -> Result<AppConfig, String> {
    if config_path.exists() {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        tracing::info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    } else {
        let config = AppConfig::default();
        save_config(&config, config_path)?;
        tracing::info!("Created default configuration at {:?}", config_path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
pub fn save_config(config: &AppConfig, config_path: &Path) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }
    }

    std::fs::write(config_path, content)
        .map_err(|e| format!("Failed to write config file: {}", e))?;

    Ok(())
}
