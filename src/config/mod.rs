// 配置管理模块

use crate::api::TransferMode;
use crate::common::StallConfig;
use crate::error::ValidationError;
use crate::uploader::executor::DEFAULT_INTEGRITY_HEADER;
use crate::uploader::part_size::validate_forced_part_size;
use crate::uploader::recommended_concurrency;
use crate::uploader::scheduler::SchedulerConfig;
use crate::uploader::throughput::ThroughputConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 单个分片最大重试次数上限
pub const MAX_RETRIES_LIMIT: u32 = 20;

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 媒体平台接口配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 吞吐量估算配置
    #[serde(default)]
    pub throughput: ThroughputConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 媒体平台接口配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 接口根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 初始化上传
    #[serde(default = "default_initiate_path")]
    pub initiate_path: String,
    /// 中转模式分片上传
    #[serde(default = "default_part_path")]
    pub part_path: String,
    /// 合并分片
    #[serde(default = "default_complete_path")]
    pub complete_path: String,
    /// Bearer token
    #[serde(default)]
    pub api_key: Option<String>,
    /// 会话级请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 直传模式的完整性校验响应头
    #[serde(default = "default_integrity_header")]
    pub integrity_header: String,
}

fn default_base_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_initiate_path() -> String {
    "/uploads/initiate".to_string()
}

fn default_part_path() -> String {
    "/uploads/part".to_string()
}

fn default_complete_path() -> String {
    "/uploads/complete".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_integrity_header() -> String {
    DEFAULT_INTEGRITY_HEADER.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            initiate_path: default_initiate_path(),
            part_path: default_part_path(),
            complete_path: default_complete_path(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            integrity_header: default_integrity_header(),
        }
    }
}

impl ApiConfig {
    /// 拼接接口地址
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 上传配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片传输模式
    #[serde(default)]
    pub mode: TransferMode,
    /// 初始并发分片数（0 = 按文件大小自动计算）
    #[serde(default)]
    pub max_concurrent_parts: usize,
    /// 自适应并发下限
    #[serde(default = "default_min_concurrent_parts")]
    pub min_concurrent_parts: usize,
    /// 自适应并发上限
    #[serde(default = "default_max_adaptive_parts")]
    pub max_adaptive_parts: usize,
    /// 是否根据吞吐量自适应调整并发
    #[serde(default = "default_true")]
    pub adaptive_concurrency: bool,
    /// 单个分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试退避基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 重试退避最大延迟（毫秒）
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// 停滞阈值（毫秒）
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// 停滞检测间隔（毫秒）
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
    /// 单个分片传输超时（毫秒）
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// 进度回调节流间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 强制分片大小 (MB)，不设置时自动计算
    #[serde(default)]
    pub part_size_mb: Option<u64>,
    /// 首尾分片优先上传
    #[serde(default = "default_true")]
    pub prioritize_edge_parts: bool,
    /// 标题为空时使用的默认标题
    #[serde(default = "default_title")]
    pub default_title: String,
}

fn default_true() -> bool {
    true
}

fn default_min_concurrent_parts() -> usize {
    1
}

fn default_max_adaptive_parts() -> usize {
    6
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_stall_timeout_ms() -> u64 {
    30_000
}

fn default_stall_check_interval_ms() -> u64 {
    10_000
}

fn default_transfer_timeout_ms() -> u64 {
    120_000
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_title() -> String {
    "Untitled Video".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::default(),
            max_concurrent_parts: 0,
            min_concurrent_parts: default_min_concurrent_parts(),
            max_adaptive_parts: default_max_adaptive_parts(),
            adaptive_concurrency: true,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            part_size_mb: None,
            prioritize_edge_parts: true,
            default_title: default_title(),
        }
    }
}

impl UploadConfig {
    /// 校验并发、重试、分片大小配置
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.min_concurrent_parts == 0 {
            return Err(ValidationError::InvalidConfig(
                "min_concurrent_parts 必须 >= 1".to_string(),
            ));
        }
        if self.max_adaptive_parts < self.min_concurrent_parts {
            return Err(ValidationError::InvalidConfig(format!(
                "max_adaptive_parts ({}) 不能小于 min_concurrent_parts ({})",
                self.max_adaptive_parts, self.min_concurrent_parts
            )));
        }
        if self.max_concurrent_parts != 0
            && !(self.min_concurrent_parts..=self.max_adaptive_parts)
                .contains(&self.max_concurrent_parts)
        {
            return Err(ValidationError::InvalidConfig(format!(
                "max_concurrent_parts ({}) 必须在 [{}, {}] 之间",
                self.max_concurrent_parts, self.min_concurrent_parts, self.max_adaptive_parts
            )));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ValidationError::InvalidConfig(format!(
                "max_retries ({}) 不能超过 {}",
                self.max_retries, MAX_RETRIES_LIMIT
            )));
        }
        if let Some(mb) = self.part_size_mb {
            validate_forced_part_size(mb.saturating_mul(1024 * 1024))?;
        }
        Ok(())
    }

    /// 强制分片大小（字节）
    pub fn forced_part_size(&self) -> Option<u64> {
        self.part_size_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// 生成某个文件的调度器配置
    pub fn scheduler_config(&self, file_size: u64, throughput: &ThroughputConfig) -> SchedulerConfig {
        let min = self.min_concurrent_parts.max(1);
        let max = self.max_adaptive_parts.max(min);
        let initial = if self.max_concurrent_parts == 0 {
            recommended_concurrency(file_size)
        } else {
            self.max_concurrent_parts
        };

        SchedulerConfig {
            initial_concurrency: initial.clamp(min, max),
            min_concurrency: min,
            max_concurrency: max,
            adaptive_concurrency: self.adaptive_concurrency,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_retry_delay: Duration::from_millis(self.max_retry_delay_ms),
            stall: StallConfig {
                stall_timeout: Duration::from_millis(self.stall_timeout_ms),
                check_interval: Duration::from_millis(self.stall_check_interval_ms),
            },
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            prioritize_edge_parts: self.prioritize_edge_parts,
            throughput: throughput.clone(),
        }
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.upload.validate()?;
        if self.throughput.window_size == 0 {
            return Err(ValidationError::InvalidConfig(
                "throughput.window_size 必须 >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件不存在时写出默认配置，方便用户修改
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.upload.default_title, "Untitled Video");
        assert_eq!(config.upload.stall_timeout_ms, 30_000);
        assert_eq!(config.throughput.window_size, 5);
        assert_eq!(config.api.integrity_header, "etag");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [api]
            base_url = "https://media.example.com/v1/"

            [upload]
            mode = "direct"
            max_retries = 5
            part_size_mb = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.mode, TransferMode::Direct);
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.upload.forced_part_size(), Some(8 * 1024 * 1024));
        assert_eq!(config.upload.progress_interval_ms, 100);
        assert_eq!(
            config.api.endpoint(&config.api.initiate_path),
            "https://media.example.com/v1/uploads/initiate"
        );
        assert!(config.log.enabled);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let mut upload = UploadConfig {
            min_concurrent_parts: 0,
            ..Default::default()
        };
        assert!(upload.validate().is_err());

        upload.min_concurrent_parts = 4;
        upload.max_adaptive_parts = 2;
        assert!(upload.validate().is_err());

        let upload = UploadConfig {
            max_retries: 21,
            ..Default::default()
        };
        assert!(upload.validate().is_err());

        let upload = UploadConfig {
            part_size_mb: Some(500),
            ..Default::default()
        };
        assert_eq!(
            upload.validate(),
            Err(ValidationError::InvalidPartSize(500 * 1024 * 1024))
        );
    }

    #[test]
    fn test_scheduler_config_auto_concurrency() {
        let upload = UploadConfig::default();
        let throughput = ThroughputConfig::default();

        assert_eq!(
            upload.scheduler_config(10 * 1024 * 1024, &throughput).initial_concurrency,
            2
        );
        assert_eq!(
            upload
                .scheduler_config(5 * 1024 * 1024 * 1024, &throughput)
                .initial_concurrency,
            6
        );

        let fixed = UploadConfig {
            max_concurrent_parts: 3,
            max_adaptive_parts: 3,
            ..Default::default()
        };
        let scheduler = fixed.scheduler_config(5 * 1024 * 1024 * 1024, &throughput);
        assert_eq!(scheduler.initial_concurrency, 3);
        assert_eq!(scheduler.max_concurrency, 3);
        assert_eq!(scheduler.stall.stall_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.toml");

        let mut config = AppConfig::default();
        config.upload.max_retries = 7;
        config.api.api_key = Some("secret".to_string());
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");

        let config = AppConfig::load_or_default(&path).await;
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        tokio::fs::write(&path, "[upload]\nmax_retries = 99\n")
            .await
            .unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }
}
