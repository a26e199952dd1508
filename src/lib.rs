// Media Uploader Library
// 视频分片上传客户端核心库

// 媒体平台会话接口
pub mod api;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 分片上传引擎
pub mod uploader;

// 🔥 公共模块（进度节流、停滞检测）
pub mod common;

// 导出常用类型
pub use api::{MediaApiClient, SessionApi, TransferMode, VideoMetadata};
pub use config::AppConfig;
pub use error::{ApiError, TransferError, UploadError, ValidationError};
pub use uploader::{
    compute_part_size, HttpTransferExecutor, PartScheduler, ThroughputEstimator,
    TransferExecutor, UploadOrchestrator, UploadPhase, UploadProgress, UploadRequest,
    UploadResult, UploadSource,
};
