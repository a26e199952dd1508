// 错误类型定义
//
// 分三层：
// - ValidationError：输入非法，立即失败，不重试
// - TransferError：单个分片传输失败，调度器按重试预算处理
// - ApiError / UploadError：会话级请求（初始化、合并）失败，直接上抛

use thiserror::Error;

/// 输入校验错误（不重试）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// 0 字节文件不是合法的上传
    #[error("文件为空，无法上传")]
    EmptyFile,
    /// 缺少文件名
    #[error("缺少文件名")]
    MissingFileName,
    /// 手动指定的分片大小超出允许范围
    #[error("分片大小非法: {0} bytes")]
    InvalidPartSize(u64),
    /// 配置项非法
    #[error("配置非法: {0}")]
    InvalidConfig(String),
}

/// 单个分片传输错误
///
/// 从执行器的角度看全部可重试，只有调度器的重试预算耗尽才会让分片最终失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// 连接失败、DNS、连接被重置等
    #[error("网络错误: {0}")]
    Network(String),
    /// 超过单次传输的超时时间
    #[error("传输超时")]
    Timeout,
    /// 服务器返回非 2xx 状态码
    #[error("服务器返回状态码 {status}: {body}")]
    Status { status: u16, body: String },
    /// 响应体无法解析
    #[error("响应格式错误: {0}")]
    MalformedResponse(String),
    /// 服务器返回 success=false
    #[error("服务器拒绝分片: {0}")]
    Rejected(String),
    /// 直传存储未返回完整性校验头
    #[error("响应缺少完整性校验头: {0}")]
    MissingIntegrityToken(String),
    /// 字节范围为空（调度缺陷，发请求前拦截）
    #[error("分片 #{index} 字节范围为空")]
    EmptyRange { index: usize },
    /// 分片没有对应的传输目标
    #[error("分片 #{index} 没有传输目标")]
    MissingDestination { index: usize },
    /// 读取本地数据失败
    #[error("读取分片数据失败: {0}")]
    Source(String),
    /// 传输任务 panic 或被中止
    #[error("分片任务异常终止: {0}")]
    Aborted(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout
        } else {
            TransferError::Network(err.to_string())
        }
    }
}

/// 会话级接口（初始化 / 合并）错误
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("请求发送失败: {0}")]
    Http(#[from] reqwest::Error),
    #[error("服务器返回状态码 {status}: {body}")]
    Status { status: u16, body: String },
    #[error("服务器拒绝请求: {0}")]
    Rejected(String),
    #[error("响应格式错误: {0}")]
    Malformed(String),
}

/// 上传会话错误
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("参数校验失败: {0}")]
    Validation(#[from] ValidationError),
    #[error("上传初始化失败: {0}")]
    Initiation(String),
    #[error("{failed} 个分片上传失败")]
    PartsFailed { failed: usize },
    #[error("上传合并失败: {0}")]
    Finalize(String),
    #[error("上传已取消")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_converts_into_upload_error() {
        let err: UploadError = ValidationError::EmptyFile.into();
        assert!(matches!(err, UploadError::Validation(ValidationError::EmptyFile)));
        assert_eq!(err.to_string(), "参数校验失败: 文件为空，无法上传");
    }

    #[test]
    fn test_parts_failed_message() {
        let err = UploadError::PartsFailed { failed: 2 };
        assert_eq!(err.to_string(), "2 个分片上传失败");
    }
}
