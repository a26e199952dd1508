// 吞吐量估算器
//
// 维护最近 N 个分片的速度样本（滑动窗口），按新旧加权平均得到带宽估计：
// 第 i 个样本（0 = 最旧）权重为 i+1，越新的样本影响越大。
//
// 同时给出并发调整建议：
// - 估计值高于阈值且样本足够 → 建议提高并发
// - 估计值或全局平均速度低于阈值且样本足够 → 建议降低并发

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// 吞吐量估算配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputConfig {
    /// 滑动窗口大小（样本数）
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// 建议提高并发的速度阈值（Mbps）
    #[serde(default = "default_increase_threshold_mbps")]
    pub increase_threshold_mbps: f64,

    /// 建议提高并发所需的最少样本数
    #[serde(default = "default_increase_min_samples")]
    pub increase_min_samples: usize,

    /// 建议降低并发的速度阈值（Mbps）
    #[serde(default = "default_reduce_threshold_mbps")]
    pub reduce_threshold_mbps: f64,

    /// 建议降低并发所需的最少样本数
    #[serde(default = "default_reduce_min_samples")]
    pub reduce_min_samples: usize,
}

fn default_window_size() -> usize {
    5
}

fn default_increase_threshold_mbps() -> f64 {
    20.0
}

fn default_increase_min_samples() -> usize {
    3
}

fn default_reduce_threshold_mbps() -> f64 {
    2.0
}

fn default_reduce_min_samples() -> usize {
    2
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            increase_threshold_mbps: default_increase_threshold_mbps(),
            increase_min_samples: default_increase_min_samples(),
            reduce_threshold_mbps: default_reduce_threshold_mbps(),
            reduce_min_samples: default_reduce_min_samples(),
        }
    }
}

/// 单个分片的速度样本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedSample {
    /// 传输字节数
    pub bytes: u64,
    /// 耗时（毫秒）
    pub elapsed_ms: u64,
}

impl SpeedSample {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self {
            bytes,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// 样本速度（Mbps）
    ///
    /// `bytes * 8 / (elapsed_ms * 1000)`，耗时不足 1ms 按 1ms 计
    pub fn mbps(&self) -> f64 {
        (self.bytes as f64 * 8.0) / (self.elapsed_ms.max(1) as f64 * 1000.0)
    }
}

/// 吞吐量估算器
#[derive(Debug, Clone, Default)]
pub struct ThroughputEstimator {
    config: ThroughputConfig,
    /// 滑动窗口（最旧在前）
    samples: VecDeque<SpeedSample>,
    /// 累计字节数（全局平均）
    total_bytes: u64,
    /// 累计耗时（毫秒）
    total_elapsed_ms: u64,
}

impl ThroughputEstimator {
    pub fn new(config: ThroughputConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            config,
            samples: VecDeque::with_capacity(capacity),
            total_bytes: 0,
            total_elapsed_ms: 0,
        }
    }

    /// 记录一个完成分片的速度样本，返回记录后的估计值
    pub fn record_sample(&mut self, bytes: u64, elapsed_ms: u64) -> Option<f64> {
        let window = self.config.window_size.max(1);
        while self.samples.len() >= window {
            self.samples.pop_front();
        }
        self.samples.push_back(SpeedSample { bytes, elapsed_ms });

        self.total_bytes = self.total_bytes.saturating_add(bytes);
        self.total_elapsed_ms = self.total_elapsed_ms.saturating_add(elapsed_ms.max(1));

        self.estimate()
    }

    /// 加权平均带宽估计（Mbps），没有样本时返回 None
    pub fn estimate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }

        let (weighted, weights) = self
            .samples
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(sum, weights), (i, sample)| {
                let weight = (i + 1) as f64;
                (sum + sample.mbps() * weight, weights + weight)
            });

        Some(weighted / weights)
    }

    /// 所有样本的全局平均速度（Mbps）
    pub fn aggregate_mbps(&self) -> Option<f64> {
        if self.total_elapsed_ms == 0 {
            return None;
        }
        Some((self.total_bytes as f64 * 8.0) / (self.total_elapsed_ms as f64 * 1000.0))
    }

    /// 是否建议提高并发
    pub fn should_increase_concurrency(&self) -> bool {
        if self.samples.len() < self.config.increase_min_samples {
            return false;
        }
        self.estimate()
            .map(|speed| speed > self.config.increase_threshold_mbps)
            .unwrap_or(false)
    }

    /// 是否建议降低并发
    pub fn should_reduce_concurrency(&self) -> bool {
        if self.samples.is_empty() || self.samples.len() < self.config.reduce_min_samples {
            return false;
        }
        let threshold = self.config.reduce_threshold_mbps;
        let estimate_low = self.estimate().map(|s| s < threshold).unwrap_or(false);
        let aggregate_low = self.aggregate_mbps().map(|s| s < threshold).unwrap_or(false);
        estimate_low || aggregate_low
    }

    /// 窗口内样本数
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn config(&self) -> &ThroughputConfig {
        &self.config
    }
}
