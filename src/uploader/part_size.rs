// 分片大小策略
//
// 按文件大小分档选择基础分片大小（大文件用大分片，减少请求开销；小分片重试粒度更细），
// 再根据观测到的带宽放大或缩小，最后限制在平台允许的范围内。
//
// 纯函数：同样的 (文件大小, 速度) 永远得到同样的分片大小，保证会话内分片数量固定。

use crate::error::ValidationError;

const MB: u64 = 1024 * 1024;

/// 计算分片大小的下限: 1MB
pub const MIN_PART_SIZE: u64 = MB;

/// 分片大小上限: 100MB（避免单次请求超时）
pub const MAX_PART_SIZE: u64 = 100 * MB;

/// 手动指定分片大小时允许的下限: 1KB
pub const MIN_FORCED_PART_SIZE: u64 = 1024;

/// 单个会话允许的最大分片数量（对象存储分片上传上限）
pub const MAX_TOTAL_PARTS: u64 = 10_000;

/// 高速链路阈值（Mbps），达到后分片大小翻倍
pub const FAST_LINK_MBPS: f64 = 50.0;

/// 低速链路阈值（Mbps），低于此值分片大小减半
pub const SLOW_LINK_MBPS: f64 = 5.0;

/// 按文件大小分档的基础分片大小
pub fn base_part_size(file_size: u64) -> u64 {
    match file_size {
        0..=52_428_800 => 5 * MB,               // <=50MB
        52_428_801..=524_288_000 => 10 * MB,    // 50MB-500MB
        524_288_001..=2_147_483_648 => 25 * MB, // 500MB-2GB
        _ => 50 * MB,                           // >2GB
    }
}

/// 计算分片大小
///
/// # 参数
/// * `file_size` - 文件大小（字节）
/// * `observed_speed_mbps` - 可选的观测带宽（Mbps）
///
/// # 返回
/// 分片大小（字节）；0 字节文件返回 `ValidationError::EmptyFile`
pub fn compute_part_size(
    file_size: u64,
    observed_speed_mbps: Option<f64>,
) -> Result<u64, ValidationError> {
    if file_size == 0 {
        return Err(ValidationError::EmptyFile);
    }

    let base = base_part_size(file_size);
    let scaled = match observed_speed_mbps {
        Some(speed) if speed.is_finite() && speed >= FAST_LINK_MBPS => base.saturating_mul(2),
        Some(speed) if speed.is_finite() && speed > 0.0 && speed < SLOW_LINK_MBPS => base / 2,
        _ => base,
    };

    Ok(scaled.clamp(MIN_PART_SIZE, MAX_PART_SIZE))
}

/// 校验手动指定的分片大小
pub fn validate_forced_part_size(part_size: u64) -> Result<u64, ValidationError> {
    if (MIN_FORCED_PART_SIZE..=MAX_PART_SIZE).contains(&part_size) {
        Ok(part_size)
    } else {
        Err(ValidationError::InvalidPartSize(part_size))
    }
}

/// 校验服务端指定的分片大小
///
/// 分片大小必须在 `[MIN_FORCED_PART_SIZE, MAX_PART_SIZE]` 内，且分片数量不超过 `MAX_TOTAL_PARTS`
pub fn validate_server_part_size(file_size: u64, part_size: u64) -> Result<u64, ValidationError> {
    let part_size = validate_forced_part_size(part_size)?;
    if file_size.div_ceil(part_size) > MAX_TOTAL_PARTS {
        return Err(ValidationError::InvalidPartSize(part_size));
    }
    Ok(part_size)
}
