//! 媒体平台会话接口
//!
//! 初始化上传、合并分片两个会话级调用；分片本身由 `uploader::executor` 传输

mod client;
mod types;

pub use client::MediaApiClient;
pub use types::{
    ApiEnvelope, CompletedPart, FinalizeData, FinalizeRequest, InitiateRequest, InitiateResponse,
    ProxyPartResponse, TransferMode, UploadTarget, VideoMetadata,
};

use crate::error::ApiError;
use async_trait::async_trait;

/// 会话级接口
///
/// 编排器只依赖这个 trait，具体实现由调用方注入
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// 初始化上传会话
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse, ApiError>;

    /// 合并分片，返回平台资源信息
    async fn finalize(&self, request: &FinalizeRequest) -> Result<FinalizeData, ApiError>;

    /// 中转模式的分片上传地址
    fn proxy_part_url(&self) -> String;
}
