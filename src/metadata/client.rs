//! HTTP metadata client / 元数据服务 HTTP 客户端
//!
//! Cookie-authenticated. The studio token is fetched lazily on first use and
//! sent as `x-studio-token` on every later request.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, COOKIE, REFERER, USER_AGENT};
use serde_json::Value;
use tokio::sync::OnceCell;

use super::{MetadataService, RegistrationResponse};
use crate::config::MetadataConfig;
use crate::error::UploadError;
use crate::storage::StoreCredentials;

const TOKEN_HEADER: &str = "x-studio-token";

pub struct HttpMetadataClient {
    http: reqwest::Client,
    base_url: String,
    token_path: String,
    credentials_path: String,
    add_file_path: String,
    token: OnceCell<String>,
}

impl HttpMetadataClient {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let cookie = resolve_cookie(config)?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        if cookie.is_empty() {
            tracing::warn!("No metadata service cookie configured, requests will be anonymous");
        } else {
            headers.insert(COOKIE, HeaderValue::from_str(&cookie).context("invalid cookie value")?);
        }
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{}/my/dataset", base_url)).context("invalid base url")?,
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("invalid user agent")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            http,
            base_url,
            token_path: config.token_path.clone(),
            credentials_path: config.credentials_path.clone(),
            add_file_path: config.add_file_path.clone(),
            token: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn token(&self) -> Result<&str> {
        let token = self
            .token
            .get_or_try_init(|| async {
                let body: Value = self
                    .http
                    .get(self.url(&self.token_path))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                let token = string_field(&body["result"], "bdToken")
                    .ok_or_else(|| anyhow!("token response has no result.bdToken"))?;
                tracing::info!("Metadata service token acquired");
                Ok::<String, anyhow::Error>(token)
            })
            .await?;
        Ok(token.as_str())
    }

    async fn post_credentials(&self) -> Result<Value> {
        let token = self.token().await?;
        let body = self
            .http
            .post(self.url(&self.credentials_path))
            .header(TOKEN_HEADER, token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }

    async fn post_add_file(&self, name: &str, object_key: &str) -> Result<Value> {
        let token = self.token().await?;
        let body = self
            .http
            .post(self.url(&self.add_file_path))
            .header(TOKEN_HEADER, token)
            .form(&[("fileOriginName", name), ("fileKey", object_key)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl MetadataService for HttpMetadataClient {
    async fn store_credentials(&self) -> Result<StoreCredentials, UploadError> {
        let body = self
            .post_credentials()
            .await
            .map_err(|e| UploadError::Transport(format!("failed to obtain store credentials: {:#}", e)))?;
        parse_credentials(&body)
    }

    async fn add_file(&self, name: &str, object_key: &str) -> Result<RegistrationResponse, UploadError> {
        let body = self
            .post_add_file(name, object_key)
            .await
            .map_err(|e| UploadError::Registration(format!("{:#}", e)))?;
        tracing::debug!("addFile response for {}: {}", name, body);
        Ok(parse_registration(&body))
    }
}

fn resolve_cookie(config: &MetadataConfig) -> Result<String> {
    if !config.cookie.trim().is_empty() {
        return Ok(config.cookie.trim().to_string());
    }
    if config.cookie_file.is_empty() {
        return Ok(String::new());
    }
    match std::fs::read_to_string(&config.cookie_file) {
        Ok(content) => Ok(content.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(anyhow!("failed to read cookie file {}: {}", config.cookie_file, e)),
    }
}

/// 字符串或数字字段统一转为字符串
fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_credentials(body: &Value) -> Result<StoreCredentials, UploadError> {
    let result = &body["result"];
    let field = |key: &str| {
        string_field(result, key).ok_or_else(|| {
            UploadError::Transport(format!("credentials response has no result.{}", key))
        })
    };
    Ok(StoreCredentials {
        access_key_id: field("accessKeyId")?,
        secret_access_key: field("secretAccessKey")?,
        session_token: string_field(result, "sessionToken"),
        endpoint: string_field(result, "endpoint"),
        bucket_name: field("bucketName")?,
        object_key: field("fileKey")?,
    })
}

fn parse_registration(body: &Value) -> RegistrationResponse {
    RegistrationResponse {
        file_id: string_field(&body["result"], "fileId"),
        error_msg: string_field(body, "error_msg").or_else(|| string_field(body, "errorMsg")),
    }
}
