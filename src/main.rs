use anyhow::{bail, Context, Result};
use media_uploader::{
    logging, uploader::ProgressCallback, AppConfig, UploadOrchestrator, UploadProgress,
    UploadRequest, UploadSource, VideoMetadata,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 配置文件路径环境变量
const CONFIG_ENV: &str = "MEDIA_UPLOADER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(file) = args.next().map(PathBuf::from) else {
        bail!("用法: media-uploader <视频文件> [标题]");
    };
    let title = args.next().unwrap_or_default();

    let config = AppConfig::load_or_default(config_path()).await;
    let _log_guard = logging::init_logging(&config.log);

    info!("Media Uploader 启动: 文件={:?}", file);

    let source = UploadSource::from_path(&file)
        .await
        .with_context(|| format!("无法打开文件: {:?}", file))?;
    let file_name = source
        .file_name()
        .context("文件路径缺少文件名")?;

    let orchestrator = UploadOrchestrator::from_config(&config)?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️ 收到中断信号，取消上传");
            ctrl_c_cancel.cancel();
        }
    });

    let progress: ProgressCallback = Arc::new(|p: UploadProgress| {
        info!(
            "进度: {:.1}% ({}), {}/{} 字节, 速度={}",
            p.percent,
            p.phase.as_str(),
            p.bytes_transferred,
            p.total_bytes,
            p.speed_mbps
                .map(|s| format!("{:.2} Mbps", s))
                .unwrap_or_else(|| "-".to_string())
        );
    });

    let request = UploadRequest::new(source, file_name).with_metadata(VideoMetadata::new(title));
    let result = orchestrator.upload(request, Some(progress), cancel).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
