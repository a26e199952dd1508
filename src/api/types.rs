// 媒体平台上传接口的数据类型
//
// 所有字段使用 camelCase 序列化，与服务端 JSON 保持一致

use serde::{Deserialize, Serialize};

/// 分片传输模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// 通过应用服务器的分片接口中转
    #[default]
    Proxy,
    /// 直接 PUT 到对象存储的预签名 URL
    Direct,
}

/// 视频元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl VideoMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// 标题为空（或只有空白）时使用默认标题
    pub fn with_default_title(mut self, default_title: &str) -> Self {
        if self.title.trim().is_empty() {
            self.title = default_title.to_string();
        }
        self
    }

    /// 标签拼接为逗号分隔的表单字段
    pub fn tags_field(&self) -> String {
        self.tags.join(",")
    }
}

/// 初始化上传请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    /// 客户端生成的会话 ID
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub mode: TransferMode,
    /// 客户端建议的分片大小
    pub part_size: u64,
    pub total_parts: usize,
    pub metadata: VideoMetadata,
}

/// 直传模式下单个分片的上传地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    /// 分片编号（从 1 开始）
    pub part_number: u32,
    /// 预签名 URL
    pub url: String,
}

/// 初始化上传响应（envelope 中的 data）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    /// 服务端分配的会话 ID（非空时替换客户端 ID）
    #[serde(default)]
    pub session_id: Option<String>,
    /// 服务端确定的分片大小（优先于客户端建议值）
    #[serde(default)]
    pub part_size: Option<u64>,
    /// 直传模式的分片上传地址
    #[serde(default)]
    pub targets: Vec<UploadTarget>,
}

/// 已完成分片（合并请求）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// 合并请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub session_id: String,
    pub file_name: String,
    pub total_parts: usize,
    pub metadata: VideoMetadata,
    /// 仅直传模式发送，按分片编号升序
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<CompletedPart>>,
}

/// 合并成功后的返回数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeData {
    /// 平台资源 ID
    pub resource_id: String,
    /// 其他字段原样保留
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// 接口统一响应结构
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

/// 中转分片接口的响应
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyPartResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}
