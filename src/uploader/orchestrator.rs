// 上传编排器
//
// 一次上传的完整流程：
// 1. 校验输入、计算分片大小
// 2. 初始化会话（获取会话 ID、服务端分片大小、直传地址）
// 3. 驱动调度器上传所有分片，汇总进度
// 4. 所有分片完成后调用合并接口
//
// upload() 不返回错误：任何失败都转成 success=false 的 UploadResult，
// 并且在返回前先回调 failed 阶段。

use crate::api::{
    CompletedPart, FinalizeData, FinalizeRequest, InitiateRequest, MediaApiClient, SessionApi,
    TransferMode, UploadTarget, VideoMetadata,
};
use crate::config::{AppConfig, UploadConfig};
use crate::error::{TransferError, UploadError, ValidationError};
use crate::uploader::executor::{Destination, HttpTransferExecutor, PartUpload, TransferExecutor};
use crate::uploader::part::{PartLayout, PartReceipt};
use crate::uploader::part_size::{
    compute_part_size, validate_forced_part_size, validate_server_part_size,
};
use crate::uploader::progress::{ProgressAggregator, ProgressCallback, UploadPhase, UploadProgress};
use crate::uploader::scheduler::{PartAttempt, PartScheduler};
use crate::uploader::session::{new_session_id, UploadSession};
use crate::uploader::source::{guess_content_type, UploadSource};
use crate::uploader::throughput::ThroughputConfig;
use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: UploadSource,
    pub file_name: String,
    /// 不设置时按扩展名推断
    pub content_type: Option<String>,
    pub metadata: VideoMetadata,
    /// 不设置时使用配置中的模式
    pub mode: Option<TransferMode>,
    /// 强制分片大小（字节）
    pub part_size: Option<u64>,
}

impl UploadRequest {
    pub fn new(source: UploadSource, file_name: impl Into<String>) -> Self {
        Self {
            source,
            file_name: file_name.into(),
            content_type: None,
            metadata: VideoMetadata::default(),
            mode: None,
            part_size: None,
        }
    }

    pub fn with_metadata(mut self, metadata: VideoMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// 上传结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    /// 可读的结果描述
    pub message: String,
    pub session_id: Option<String>,
    /// 平台资源 ID（成功时）
    pub resource_id: Option<String>,
    /// 最终失败的分片索引
    pub failed_parts: Vec<usize>,
    pub total_parts: usize,
    pub cancelled: bool,
    /// 合并接口返回的完整数据
    pub data: Option<FinalizeData>,
}

impl UploadResult {
    /// 失败分片数量
    pub fn failed_chunks(&self) -> usize {
        self.failed_parts.len()
    }
}

/// execute 过程中积累的会话信息（失败时也要带回给调用方）
#[derive(Debug, Default)]
struct SessionSummary {
    session_id: Option<String>,
    total_parts: usize,
    failed_parts: Vec<usize>,
}

/// 上传编排器
pub struct UploadOrchestrator {
    api: Arc<dyn SessionApi>,
    executor: Arc<dyn TransferExecutor>,
    config: UploadConfig,
    throughput: ThroughputConfig,
    /// 上一次会话的带宽估计，用于下一次计算分片大小
    last_throughput_mbps: Mutex<Option<f64>>,
}

impl UploadOrchestrator {
    pub fn new(
        api: Arc<dyn SessionApi>,
        executor: Arc<dyn TransferExecutor>,
        config: UploadConfig,
        throughput: ThroughputConfig,
    ) -> Self {
        Self {
            api,
            executor,
            config,
            throughput,
            last_throughput_mbps: Mutex::new(None),
        }
    }

    /// 使用 HTTP 实现创建编排器
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        config.validate().context("配置校验失败")?;

        let api = MediaApiClient::new(&config.api)?;
        let executor = HttpTransferExecutor::new(
            config.upload.transfer_timeout(),
            &config.api.integrity_header,
        )?;

        Ok(Self::new(
            Arc::new(api),
            Arc::new(executor),
            config.upload.clone(),
            config.throughput.clone(),
        ))
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 上一次会话的带宽估计（Mbps）
    pub fn last_throughput_mbps(&self) -> Option<f64> {
        *self.last_throughput_mbps.lock()
    }

    /// 上传一个文件
    ///
    /// # 参数
    /// * `request` - 上传请求
    /// * `progress` - 进度回调（节流）
    /// * `cancel` - 取消令牌
    pub async fn upload(
        &self,
        request: UploadRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> UploadResult {
        let total_bytes = request.source.len();
        let mut summary = SessionSummary::default();
        let mut aggregator: Option<ProgressAggregator> = None;

        let result = self
            .execute(request, progress.clone(), &cancel, &mut summary, &mut aggregator)
            .await;

        match result {
            Ok(data) => {
                info!(
                    "✓ 上传完成: session={}, resource={}",
                    summary.session_id.as_deref().unwrap_or("-"),
                    data.resource_id
                );
                UploadResult {
                    success: true,
                    message: "上传完成".to_string(),
                    session_id: summary.session_id,
                    resource_id: Some(data.resource_id.clone()),
                    failed_parts: Vec::new(),
                    total_parts: summary.total_parts,
                    cancelled: false,
                    data: Some(data),
                }
            }
            Err(e) => {
                let cancelled = matches!(e, UploadError::Cancelled);
                if cancelled {
                    warn!("上传已取消: session={:?}", summary.session_id);
                } else {
                    error!("上传失败: session={:?}, 原因: {}", summary.session_id, e);
                }

                // 先通知 failed 阶段，再返回结果
                match aggregator.as_mut() {
                    Some(agg) => {
                        let percent = agg.percent();
                        agg.emit_phase(UploadPhase::Failed, percent);
                    }
                    None => {
                        if let Some(callback) = &progress {
                            callback(UploadProgress {
                                percent: 0.0,
                                phase: UploadPhase::Failed,
                                bytes_transferred: 0,
                                total_bytes,
                                speed_mbps: None,
                            });
                        }
                    }
                }

                UploadResult {
                    success: false,
                    message: e.to_string(),
                    session_id: summary.session_id,
                    resource_id: None,
                    failed_parts: summary.failed_parts,
                    total_parts: summary.total_parts,
                    cancelled,
                    data: None,
                }
            }
        }
    }

    async fn execute(
        &self,
        request: UploadRequest,
        callback: Option<ProgressCallback>,
        cancel: &CancellationToken,
        summary: &mut SessionSummary,
        aggregator: &mut Option<ProgressAggregator>,
    ) -> Result<FinalizeData, UploadError> {
        let UploadRequest {
            source,
            file_name,
            content_type,
            metadata,
            mode,
            part_size,
        } = request;

        // 1. 校验输入
        let file_size = source.len();
        if file_size == 0 {
            return Err(ValidationError::EmptyFile.into());
        }
        let file_name = file_name.trim().to_string();
        if file_name.is_empty() {
            return Err(ValidationError::MissingFileName.into());
        }
        let metadata = metadata.with_default_title(&self.config.default_title);
        let mode = mode.unwrap_or(self.config.mode);
        let content_type =
            content_type.unwrap_or_else(|| guess_content_type(&file_name).to_string());

        // 2. 客户端建议的分片大小
        let proposed_part_size = match part_size.or_else(|| self.config.forced_part_size()) {
            Some(forced) => validate_forced_part_size(forced)?,
            None => compute_part_size(file_size, self.last_throughput_mbps())?,
        };
        let proposed_layout = PartLayout::new(file_size, proposed_part_size)?;

        // 3. 初始化会话
        let client_session_id = new_session_id();
        summary.session_id = Some(client_session_id.clone());

        let initiate = InitiateRequest {
            session_id: client_session_id.clone(),
            file_name: file_name.clone(),
            file_size,
            content_type: content_type.clone(),
            mode,
            part_size: proposed_part_size,
            total_parts: proposed_layout.total_parts(),
            metadata: metadata.clone(),
        };

        info!(
            "初始化上传: file={}, size={} bytes, mode={:?}, 建议分片大小={} bytes",
            file_name, file_size, mode, proposed_part_size
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            response = self.api.initiate(&initiate) => {
                response.map_err(|e| UploadError::Initiation(e.to_string()))?
            }
        };

        // 4. 服务端的分片大小和会话 ID 优先
        let part_size = match response.part_size {
            Some(size) => validate_server_part_size(file_size, size).map_err(|_| {
                UploadError::Initiation(format!("服务端返回的分片大小非法: {} bytes", size))
            })?,
            None => proposed_part_size,
        };
        let session_id = response
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(client_session_id);

        let session = UploadSession::new(
            session_id,
            file_name,
            content_type,
            mode,
            file_size,
            part_size,
            metadata,
        )?;
        let layout = session.layout()?;
        summary.session_id = Some(session.id.clone());
        summary.total_parts = session.total_parts;

        let destinations = Arc::new(self.build_destinations(&session, &layout, &response.targets)?);

        info!(
            "会话已建立: session={}, 分片大小={} bytes, 分片数量={}",
            session.id, session.part_size, session.total_parts
        );

        // 5. 调度所有分片
        let agg = aggregator.insert(ProgressAggregator::new(
            session.total_parts,
            file_size,
            Duration::from_millis(self.config.progress_interval_ms),
            callback,
        ));
        agg.emit_phase(UploadPhase::Uploading, 0.0);

        let scheduler_config = self.config.scheduler_config(file_size, &self.throughput);
        let mut scheduler = PartScheduler::new(layout, scheduler_config, cancel.clone());

        let executor = self.executor.clone();
        let transfer_timeout = self.config.transfer_timeout();
        let report = scheduler
            .run(
                move |attempt: PartAttempt| {
                    let source = source.clone();
                    let executor = executor.clone();
                    let destinations = destinations.clone();
                    async move {
                        transfer_part(
                            source,
                            executor,
                            destinations,
                            attempt,
                            transfer_timeout,
                        )
                        .await
                    }
                },
                |event| agg.apply(&event),
            )
            .await;

        if let Some(speed) = report.throughput_mbps {
            *self.last_throughput_mbps.lock() = Some(speed);
        }
        summary.failed_parts = report.failed_parts.clone();

        if report.cancelled {
            return Err(UploadError::Cancelled);
        }
        if !report.is_success() {
            let failed = report.failed_parts.len().max(1);
            return Err(UploadError::PartsFailed { failed });
        }

        // 6. 合并
        agg.emit_phase(UploadPhase::Finalizing, 100.0);

        let finalize = FinalizeRequest {
            session_id: session.id.clone(),
            file_name: session.file_name.clone(),
            total_parts: session.total_parts,
            metadata: session.metadata.clone(),
            parts: match session.mode {
                TransferMode::Direct => Some(completed_parts(&report.receipts)?),
                TransferMode::Proxy => None,
            },
        };

        info!("合并分片: session={}, 分片数量={}", session.id, session.total_parts);

        let data = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            data = self.api.finalize(&finalize) => {
                data.map_err(|e| UploadError::Finalize(e.to_string()))?
            }
        };

        agg.emit_phase(UploadPhase::Completed, 100.0);
        Ok(data)
    }

    /// 为每个分片生成传输目标
    fn build_destinations(
        &self,
        session: &UploadSession,
        layout: &PartLayout,
        targets: &[UploadTarget],
    ) -> Result<Vec<Destination>, UploadError> {
        match session.mode {
            TransferMode::Proxy => {
                let url = self.api.proxy_part_url();
                Ok((0..layout.total_parts())
                    .map(|index| Destination::Proxy {
                        url: url.clone(),
                        session_id: session.id.clone(),
                        total_parts: layout.total_parts(),
                        metadata: layout.is_edge(index).then(|| session.metadata.clone()),
                    })
                    .collect())
            }
            TransferMode::Direct => {
                let total = layout.total_parts();
                if targets.len() != total {
                    return Err(UploadError::Initiation(format!(
                        "直传地址数量 {} 与分片数量 {} 不一致",
                        targets.len(),
                        total
                    )));
                }

                let mut urls: Vec<Option<String>> = vec![None; total];
                for target in targets {
                    let index = (target.part_number as usize)
                        .checked_sub(1)
                        .filter(|&index| index < total);
                    match index {
                        Some(index) if urls[index].is_none() => {
                            urls[index] = Some(target.url.clone())
                        }
                        _ => {
                            return Err(UploadError::Initiation(format!(
                                "直传地址分片编号非法或重复: {}",
                                target.part_number
                            )))
                        }
                    }
                }

                Ok(urls
                    .into_iter()
                    .flatten()
                    .map(|url| Destination::Direct { url })
                    .collect())
            }
        }
    }
}

/// 读取分片数据并在超时限制内传输
async fn transfer_part(
    source: UploadSource,
    executor: Arc<dyn TransferExecutor>,
    destinations: Arc<Vec<Destination>>,
    attempt: PartAttempt,
    timeout: Duration,
) -> Result<PartReceipt, TransferError> {
    let PartAttempt {
        index,
        range,
        progress,
        ..
    } = attempt;

    let destination = destinations
        .get(index)
        .ok_or(TransferError::MissingDestination { index })?;
    let data = source.read_range(range.clone()).await?;
    let part = PartUpload { index, range, data };

    match tokio::time::timeout(timeout, executor.transfer(part, destination, progress)).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout),
    }
}

/// 合并请求中的分片列表（按分片编号升序）
///
/// 直传模式每个分片都必须有 ETag，缺失时不发起合并
fn completed_parts(receipts: &[PartReceipt]) -> Result<Vec<CompletedPart>, UploadError> {
    receipts
        .iter()
        .map(|receipt| match receipt.etag.as_deref().map(str::trim) {
            Some(etag) if !etag.is_empty() => Ok(CompletedPart {
                part_number: receipt.part_number(),
                etag: etag.to_string(),
            }),
            _ => Err(UploadError::Finalize(format!(
                "分片 #{} 缺少 ETag",
                receipt.part_number()
            ))),
        })
        .collect()
}
