// 分片传输执行器
//
// 负责一个分片的一次网络传输并对结果分类：
// - 中转模式：multipart POST 到应用服务器（sessionId / partIndex / totalParts / chunk，首尾分片附带元数据）
// - 直传模式：PUT 原始字节到预签名 URL，从响应头读取完整性校验值（ETag）
//
// 传输过程中按发送进度回调 PartProgress（节流）。
// 所有错误都返回 TransferError，是否重试由调度器决定。

use crate::api::{ProxyPartResponse, VideoMetadata};
use crate::error::TransferError;
use crate::uploader::part::PartReceipt;
use crate::uploader::progress::PartProgress;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{multipart, Body, Client};
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, warn};

/// 上传 body 每次交给 HTTP 层的字节数（进度粒度）
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// 默认完整性校验头
pub const DEFAULT_INTEGRITY_HEADER: &str = "etag";

/// 待传输的分片
#[derive(Debug, Clone)]
pub struct PartUpload {
    pub index: usize,
    pub range: Range<u64>,
    pub data: Bytes,
}

impl PartUpload {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 分片传输目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// 应用服务器中转
    Proxy {
        url: String,
        session_id: String,
        total_parts: usize,
        /// 只在首尾分片上携带
        metadata: Option<VideoMetadata>,
    },
    /// 预签名 URL 直传
    Direct { url: String },
}

/// 分片传输执行器
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// 传输一个分片
    async fn transfer(
        &self,
        part: PartUpload,
        destination: &Destination,
        progress: PartProgress,
    ) -> Result<PartReceipt, TransferError>;
}

/// 发请求前拦截空分片
pub fn validate_part(part: &PartUpload) -> Result<(), TransferError> {
    if part.range.is_empty() || part.data.is_empty() {
        return Err(TransferError::EmptyRange { index: part.index });
    }
    let expected = part.range.end - part.range.start;
    if part.len() != expected {
        return Err(TransferError::Source(format!(
            "分片 #{} 数据长度 {} 与范围 {:?} 不一致",
            part.index,
            part.len(),
            part.range
        )));
    }
    Ok(())
}

/// 把分片数据切成小块流式发送，每发出一块上报一次进度
fn progress_body(data: Bytes, chunk_size: usize, progress: PartProgress) -> Body {
    let total = data.len();
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = (0..total)
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(total)))
        .collect();

    let mut sent = 0u64;
    let stream = futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        progress.report(sent);
        Ok::<Bytes, std::io::Error>(chunk)
    });
    Body::wrap_stream(stream)
}

/// 基于 reqwest 的执行器
#[derive(Debug, Clone)]
pub struct HttpTransferExecutor {
    client: Client,
    /// 直传模式读取的响应头（小写）
    integrity_header: String,
    stream_chunk_size: usize,
}

impl HttpTransferExecutor {
    /// 创建执行器
    ///
    /// # 参数
    /// * `timeout` - 单次请求超时
    /// * `integrity_header` - 直传模式的完整性校验头名
    pub fn new(timeout: Duration, integrity_header: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("创建上传 HTTP 客户端失败")?;
        Ok(Self::with_client(client, integrity_header))
    }

    pub fn with_client(client: Client, integrity_header: &str) -> Self {
        Self {
            client,
            integrity_header: integrity_header.trim().to_ascii_lowercase(),
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
        }
    }

    /// 设置流式发送的块大小
    pub fn with_stream_chunk_size(mut self, chunk_size: usize) -> Self {
        self.stream_chunk_size = chunk_size.max(1);
        self
    }

    async fn send_proxy(
        &self,
        part: PartUpload,
        url: &str,
        session_id: &str,
        total_parts: usize,
        metadata: Option<&VideoMetadata>,
        progress: &PartProgress,
    ) -> Result<PartReceipt, TransferError> {
        let len = part.len();
        let body = progress_body(part.data, self.stream_chunk_size, progress.clone());
        let chunk = multipart::Part::stream_with_length(body, len)
            .file_name(format!("part-{}", part.index))
            .mime_str("application/octet-stream")
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let mut form = multipart::Form::new()
            .text("sessionId", session_id.to_string())
            .text("partIndex", part.index.to_string())
            .text("totalParts", total_parts.to_string());
        if let Some(meta) = metadata {
            form = form
                .text("title", meta.title.clone())
                .text("description", meta.description.clone())
                .text("tags", meta.tags_field());
            if let Some(channel_id) = &meta.channel_id {
                form = form.text("channelId", channel_id.clone());
            }
        }
        let form = form.part("chunk", chunk);

        let response = self.client.post(url).multipart(form).send().await?;
        let status = response.status();
        let text = response.text().await?;

        debug!(
            "中转分片响应: part={}, status={}, body={}",
            part.index, status, text
        );

        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ProxyPartResponse = serde_json::from_str(&text).map_err(|e| {
            TransferError::MalformedResponse(format!("{}: body={}", e, text))
        })?;
        if !parsed.success {
            return Err(TransferError::Rejected(
                parsed
                    .message
                    .unwrap_or_else(|| "success=false".to_string()),
            ));
        }

        Ok(PartReceipt {
            index: part.index,
            etag: parsed.etag,
            bytes: len,
        })
    }

    async fn send_direct(
        &self,
        part: PartUpload,
        url: &str,
        progress: &PartProgress,
    ) -> Result<PartReceipt, TransferError> {
        let len = part.len();
        let body = progress_body(part.data, self.stream_chunk_size, progress.clone());

        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransferError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let etag = response
            .headers()
            .get(self.integrity_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TransferError::MissingIntegrityToken(self.integrity_header.clone()))?;

        debug!("直传分片成功: part={}, etag={}", part.index, etag);

        Ok(PartReceipt {
            index: part.index,
            etag: Some(etag),
            bytes: len,
        })
    }
}

#[async_trait]
impl TransferExecutor for HttpTransferExecutor {
    async fn transfer(
        &self,
        part: PartUpload,
        destination: &Destination,
        progress: PartProgress,
    ) -> Result<PartReceipt, TransferError> {
        validate_part(&part)?;

        let index = part.index;
        let len = part.len();
        let result = match destination {
            Destination::Proxy {
                url,
                session_id,
                total_parts,
                metadata,
            } => {
                self.send_proxy(
                    part,
                    url,
                    session_id,
                    *total_parts,
                    metadata.as_ref(),
                    &progress,
                )
                .await
            }
            Destination::Direct { url } => self.send_direct(part, url, &progress).await,
        };

        match &result {
            Ok(_) => progress.finish(len),
            Err(e) => warn!("分片 #{} 传输失败: {}", index, e),
        }
        result
    }
}
