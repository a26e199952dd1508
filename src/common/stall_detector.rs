//! 分片停滞检测器
//!
//! 按固定间隔检查所有上传中的分片，最后一次进度早于停滞阈值的分片视为已丢失，
//! 交由调度器强制回收并重新排队

use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 停滞检测配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StallConfig {
    /// 停滞阈值 - 超过此时长没有进度视为停滞
    pub stall_timeout: Duration,
    /// 检查间隔
    pub check_interval: Duration,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(10),
        }
    }
}

/// 分片停滞检测器
#[derive(Debug, Clone)]
pub struct StallDetector {
    config: StallConfig,
}

impl StallDetector {
    pub fn new(config: StallConfig) -> Self {
        Self { config }
    }

    /// 检查间隔（至少 1ms，避免 interval 为 0 时 panic）
    pub fn check_interval(&self) -> Duration {
        self.config.check_interval.max(Duration::from_millis(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        self.config.stall_timeout
    }

    /// 找出停滞的分片
    ///
    /// # 参数
    /// * `now` - 当前时间
    /// * `in_flight` - 上传中的分片 `(index, 最后一次进度时间)`
    ///
    /// # 返回
    /// 停滞分片的索引列表
    pub fn find_stalled(&self, now: Instant, in_flight: &[(usize, Instant)]) -> Vec<usize> {
        let stalled: Vec<usize> = in_flight
            .iter()
            .filter(|(_, last_progress)| {
                now.saturating_duration_since(*last_progress) > self.config.stall_timeout
            })
            .map(|(index, _)| *index)
            .collect();

        if stalled.is_empty() {
            debug!("停滞检测: {} 个上传中分片均正常", in_flight.len());
        } else {
            info!(
                "⚠️ 检测到 {} 个分片停滞超过 {:?}: {:?}",
                stalled.len(),
                self.config.stall_timeout,
                stalled
            );
        }

        stalled
    }
}
