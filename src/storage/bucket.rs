//! S3兼容对象存储实现
//!
//! - 分片上传，分片大小由配置决定，并发分片数由调用方指定
//! - 空文件直接 put_object
//! - URL 抓取：S3 没有服务端抓取，由本进程流式转存

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::serde_types::Part;
use s3::Region;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use super::{
    FetchSource, ObjectStoreConnector, ObjectStoreSession, StoreCredentials, TransferHandle,
    TransferProgress, TransferProgressCallback,
};
use crate::config::TransferConfig;

const CONTENT_TYPE: &str = "application/octet-stream";

/// 根据临时凭证创建会话
pub struct S3Connector {
    region: String,
    default_endpoint: String,
    part_size: usize,
    http: reqwest::Client,
}

impl S3Connector {
    pub fn new(transfer: &TransferConfig) -> Self {
        Self {
            region: transfer.region.clone(),
            default_endpoint: transfer.default_endpoint.clone(),
            part_size: transfer.part_size_bytes(),
            http: reqwest::Client::new(),
        }
    }
}

impl ObjectStoreConnector for S3Connector {
    fn connect(&self, creds: &StoreCredentials) -> Result<Arc<dyn ObjectStoreSession>> {
        let credentials = Credentials::new(
            Some(&creds.access_key_id),
            Some(&creds.secret_access_key),
            creds.session_token.as_deref().filter(|t| !t.is_empty()),
            None,
            None,
        )
        .map_err(|e| anyhow!("创建S3凭证失败: {}", e))?;

        let endpoint = creds
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| self.default_endpoint.clone());

        Ok(Arc::new(S3Session {
            credentials,
            region: Region::Custom {
                region: self.region.clone(),
                endpoint,
            },
            part_size: self.part_size,
            http: self.http.clone(),
        }))
    }
}

struct S3Session {
    credentials: Credentials,
    region: Region,
    part_size: usize,
    http: reqwest::Client,
}

impl S3Session {
    /// 创建S3 Bucket客户端
    fn bucket(&self, name: &str) -> Result<Box<Bucket>> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| anyhow!("创建S3 Bucket失败: {}", e))?;
        Ok(bucket.with_path_style())
    }
}

#[async_trait]
impl ObjectStoreSession for S3Session {
    async fn begin_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        source: &Path,
        part_concurrency: usize,
        on_progress: TransferProgressCallback,
    ) -> Result<TransferHandle> {
        let bucket = Arc::new(self.bucket(bucket)?);
        Ok(TransferHandle::spawn(multipart_upload(
            bucket,
            object.to_string(),
            source.to_path_buf(),
            self.part_size,
            part_concurrency.max(1),
            on_progress,
        )))
    }

    async fn fetch_object(&self, bucket: &str, object: &str, source: &FetchSource) -> Result<()> {
        let mut request = self.http.get(&source.url);
        if let Some(referer) = &source.referer {
            request = request.header(reqwest::header::REFERER, referer);
        }
        if let Some(user_agent) = &source.user_agent {
            request = request.header(reqwest::header::USER_AGENT, user_agent);
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("抓取URL失败: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("抓取URL失败: {}", e))?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let mut reader = StreamReader::new(Box::pin(stream));

        let bucket = self.bucket(bucket)?;
        bucket
            .put_object_stream(&mut reader, object)
            .await
            .map_err(|e| anyhow!("转存到S3失败: {}", e))?;

        tracing::debug!("S3转存完成: url={}, key={}", source.url, object);
        Ok(())
    }

    async fn object_exists(&self, bucket: &str, object: &str) -> Result<bool> {
        let bucket = self.bucket(bucket)?;
        match bucket.head_object(object).await {
            Ok((_, code)) => Ok((200..300).contains(&code)),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(anyhow!("查询S3对象失败: {}", e)),
        }
    }
}

/// 分片上传 - 并发上传，控制内存（同时最多 part_concurrency 片在内存中）
async fn multipart_upload(
    bucket: Arc<Box<Bucket>>,
    key: String,
    source: PathBuf,
    part_size: usize,
    part_concurrency: usize,
    on_progress: TransferProgressCallback,
) -> Result<()> {
    let started = Instant::now();
    let mut file = File::open(&source)
        .await
        .map_err(|e| anyhow!("打开源文件失败: {:?}: {}", source, e))?;
    let total = file.metadata().await?.len();

    if total == 0 {
        let response = bucket
            .put_object(&key, &[])
            .await
            .map_err(|e| anyhow!("上传空文件失败: {}", e))?;
        ensure_success(response.status_code(), "上传空文件")?;
        on_progress(TransferProgress::new(0, 0, started.elapsed()));
        return Ok(());
    }

    let init_response = bucket
        .initiate_multipart_upload(&key, CONTENT_TYPE)
        .await
        .map_err(|e| anyhow!("初始化分片上传失败: {}", e))?;
    let upload_id = init_response.upload_id;

    tracing::debug!("S3分片上传开始: key={}, upload_id={}, size={}", key, upload_id, total);

    let parts = upload_parts(
        &bucket,
        &key,
        &upload_id,
        &mut file,
        total,
        part_size,
        part_concurrency,
        &on_progress,
        started,
    )
    .await;

    match parts {
        Ok(mut parts) => {
            parts.sort_by_key(|p| p.part_number);
            let response = bucket
                .complete_multipart_upload(&key, &upload_id, parts)
                .await
                .map_err(|e| anyhow!("完成分片上传失败: {}", e))?;
            ensure_success(response.status_code(), "完成分片上传")?;
            tracing::debug!(
                "S3分片上传完成: key={}, elapsed={}ms",
                key,
                started.elapsed().as_millis()
            );
            Ok(())
        }
        Err(e) => {
            let _ = bucket.abort_upload(&key, &upload_id).await;
            tracing::debug!("S3分片上传已中止: key={}", key);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload_parts(
    bucket: &Arc<Box<Bucket>>,
    key: &str,
    upload_id: &str,
    file: &mut File,
    total: u64,
    part_size: usize,
    part_concurrency: usize,
    on_progress: &TransferProgressCallback,
    started: Instant,
) -> Result<Vec<Part>> {
    let mut completed_parts: Vec<Part> = Vec::new();
    let mut pending = FuturesUnordered::new();
    let mut part_number: u32 = 0;
    let mut loaded: u64 = 0;
    let mut eof = false;

    loop {
        // 并发数未满时继续读取分片
        while !eof && pending.len() < part_concurrency {
            let data = read_part(file, part_size).await?;
            if data.len() < part_size {
                eof = true;
            }
            if data.is_empty() {
                break;
            }
            part_number += 1;
            pending.push(put_part(
                bucket.clone(),
                key.to_string(),
                upload_id.to_string(),
                part_number,
                data,
            ));
        }

        match pending.next().await {
            Some(result) => {
                let (part, size) = result?;
                loaded += size;
                completed_parts.push(part);
                on_progress(TransferProgress::new(loaded, total, started.elapsed()));
            }
            None => break,
        }
    }

    Ok(completed_parts)
}

async fn put_part(
    bucket: Arc<Box<Bucket>>,
    key: String,
    upload_id: String,
    part_number: u32,
    data: Vec<u8>,
) -> Result<(Part, u64)> {
    let size = data.len() as u64;
    tracing::debug!("S3上传分片: key={}, part={}, size={}", key, part_number, size);
    let response = bucket
        .put_multipart_chunk(data, &key, part_number, &upload_id, CONTENT_TYPE)
        .await
        .map_err(|e| anyhow!("上传分片失败: part={}, error={}", part_number, e))?;
    Ok((
        Part {
            part_number,
            etag: response.etag,
        },
        size,
    ))
}

/// 读取一个完整分片（文件末尾可能不足一片）
async fn read_part(file: &mut File, part_size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; part_size];
    let mut filled = 0;
    while filled < part_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn ensure_success(code: u16, action: &str) -> Result<()> {
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(anyhow!("{}失败: HTTP {}", action, code))
    }
}
