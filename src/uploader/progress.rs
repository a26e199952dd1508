// 上传进度
//
// 两级进度：
// - PartProgress：执行器在传输过程中上报单个分片已发送字节数（节流后发给调度器）
// - ProgressAggregator：编排器把调度器事件汇总成 0-100 的总体进度 + 阶段，节流后回调给调用方
//
// 总体进度 = 各分片进度百分比之和 / 分片总数（每个分片权重相同），上传阶段最高 99%。
// 同时附带精确字节数，供需要按字节计算的调用方使用。

use crate::common::ProgressThrottler;
use crate::uploader::scheduler::SchedulerEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// 上传阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    /// 分片上传中（0-99%）
    Uploading,
    /// 有分片停滞被回收（仅提示）
    Stalled,
    /// 所有分片完成，等待服务端合并
    Finalizing,
    /// 上传完成
    Completed,
    /// 上传失败
    Failed,
}

impl UploadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Stalled => "stalled",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// 进度快照（回调参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    /// 总体进度（0-100）
    pub percent: f64,
    /// 当前阶段
    pub phase: UploadPhase,
    /// 已传输字节数（所有分片当前尝试之和）
    pub bytes_transferred: u64,
    /// 文件总字节数
    pub total_bytes: u64,
    /// 当前带宽估计（Mbps）
    pub speed_mbps: Option<f64>,
}

/// 进度回调
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// 分片进度事件（执行器 → 调度器）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartProgressEvent {
    pub index: usize,
    /// 尝试编号，用于丢弃已被放弃的尝试的迟到进度
    pub attempt: u32,
    /// 当前尝试已发送字节数
    pub bytes: u64,
}

/// 单个分片的进度上报器
///
/// 每次上传尝试一个实例，执行器在传输过程中调用 `report`
#[derive(Debug, Clone)]
pub struct PartProgress {
    index: usize,
    attempt: u32,
    tx: mpsc::UnboundedSender<PartProgressEvent>,
    throttler: Arc<ProgressThrottler>,
}

impl PartProgress {
    pub fn new(
        index: usize,
        attempt: u32,
        tx: mpsc::UnboundedSender<PartProgressEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            index,
            attempt,
            tx,
            throttler: Arc::new(ProgressThrottler::new(interval)),
        }
    }

    /// 不上报任何进度（测试或独立调用执行器时使用）
    pub fn detached(index: usize) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(index, 0, tx, Duration::ZERO)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 上报已发送字节数（节流）
    pub fn report(&self, bytes: u64) {
        if self.throttler.should_emit() {
            self.send(bytes);
        }
    }

    /// 上报最终字节数（不节流）
    pub fn finish(&self, bytes: u64) {
        self.throttler.force_emit();
        self.send(bytes);
    }

    fn send(&self, bytes: u64) {
        // 调度器已退出时接收端关闭，忽略即可
        let _ = self.tx.send(PartProgressEvent {
            index: self.index,
            attempt: self.attempt,
            bytes,
        });
    }
}

/// 总体进度汇总器
pub struct ProgressAggregator {
    callback: Option<ProgressCallback>,
    throttler: ProgressThrottler,
    part_percent: Vec<f64>,
    part_bytes: Vec<u64>,
    total_bytes: u64,
    speed_mbps: Option<f64>,
    last_phase: Option<UploadPhase>,
}

impl ProgressAggregator {
    /// 创建汇总器
    ///
    /// # 参数
    /// * `total_parts` - 分片总数
    /// * `total_bytes` - 文件大小
    /// * `interval` - uploading 阶段的回调节流间隔
    /// * `callback` - 调用方回调
    pub fn new(
        total_parts: usize,
        total_bytes: u64,
        interval: Duration,
        callback: Option<ProgressCallback>,
    ) -> Self {
        Self {
            callback,
            throttler: ProgressThrottler::new(interval),
            part_percent: vec![0.0; total_parts],
            part_bytes: vec![0; total_parts],
            total_bytes,
            speed_mbps: None,
            last_phase: None,
        }
    }

    /// 总体进度（上传阶段，最高 99）
    pub fn percent(&self) -> f64 {
        if self.part_percent.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.part_percent.iter().sum();
        (sum / self.part_percent.len() as f64).clamp(0.0, 99.0)
    }

    /// 已传输字节数
    pub fn bytes_transferred(&self) -> u64 {
        self.part_bytes.iter().sum()
    }

    pub fn last_phase(&self) -> Option<UploadPhase> {
        self.last_phase
    }

    /// 应用调度器事件
    pub fn apply(&mut self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::Progress { index, bytes, size } => {
                self.set_part(*index, *bytes, *size);
                self.emit_uploading();
            }
            SchedulerEvent::Completed {
                index,
                size,
                estimate_mbps,
            } => {
                self.set_part(*index, *size, *size);
                if estimate_mbps.is_some() {
                    self.speed_mbps = *estimate_mbps;
                }
                self.emit_uploading();
            }
            SchedulerEvent::Retrying { index, .. } | SchedulerEvent::Failed { index, .. } => {
                self.set_part(*index, 0, 0);
                self.emit_uploading();
            }
            SchedulerEvent::Stalled { index, .. } => {
                self.set_part(*index, 0, 0);
                let percent = self.percent();
                self.emit_phase(UploadPhase::Stalled, percent);
            }
            SchedulerEvent::Dispatched { .. } | SchedulerEvent::ConcurrencyChanged { .. } => {}
        }
    }

    /// 强制发布阶段变化
    pub fn emit_phase(&mut self, phase: UploadPhase, percent: f64) {
        self.throttler.force_emit();
        let bytes_transferred = match phase {
            UploadPhase::Finalizing | UploadPhase::Completed => self.total_bytes,
            _ => self.bytes_transferred(),
        };
        self.deliver(UploadProgress {
            percent,
            phase,
            bytes_transferred,
            total_bytes: self.total_bytes,
            speed_mbps: self.speed_mbps,
        });
    }

    fn set_part(&mut self, index: usize, bytes: u64, size: u64) {
        let Some(slot) = self.part_percent.get_mut(index) else {
            return;
        };
        *slot = if size == 0 {
            0.0
        } else {
            (bytes as f64 / size as f64 * 100.0).min(100.0)
        };
        self.part_bytes[index] = bytes;
    }

    fn emit_uploading(&mut self) {
        if !self.throttler.should_emit() {
            return;
        }
        self.deliver(UploadProgress {
            percent: self.percent(),
            phase: UploadPhase::Uploading,
            bytes_transferred: self.bytes_transferred(),
            total_bytes: self.total_bytes,
            speed_mbps: self.speed_mbps,
        });
    }

    fn deliver(&mut self, progress: UploadProgress) {
        if self.last_phase != Some(progress.phase) {
            debug!("上传阶段: {} ({:.1}%)", progress.phase.as_str(), progress.percent);
        }
        self.last_phase = Some(progress.phase);
        if let Some(callback) = &self.callback {
            callback(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording() -> (ProgressCallback, Arc<Mutex<Vec<UploadProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().push(p));
        (callback, seen)
    }

    #[test]
    fn test_flat_average_across_parts() {
        let (callback, seen) = recording();
        let mut aggregator = ProgressAggregator::new(4, 400, Duration::ZERO, Some(callback));

        // 分片 0 完成（25% 权重），分片 1 一半（12.5%）
        aggregator.apply(&SchedulerEvent::Completed {
            index: 0,
            size: 100,
            estimate_mbps: Some(12.0),
        });
        aggregator.apply(&SchedulerEvent::Progress {
            index: 1,
            bytes: 50,
            size: 100,
        });

        let last = seen.lock().last().cloned().unwrap();
        assert!((last.percent - 37.5).abs() < 1e-9);
        assert_eq!(last.phase, UploadPhase::Uploading);
        assert_eq!(last.bytes_transferred, 150);
        assert_eq!(last.total_bytes, 400);
        assert_eq!(last.speed_mbps, Some(12.0));
    }

    #[test]
    fn test_uploading_clamped_to_99() {
        let (callback, seen) = recording();
        let mut aggregator = ProgressAggregator::new(1, 10, Duration::ZERO, Some(callback));
        aggregator.apply(&SchedulerEvent::Completed {
            index: 0,
            size: 10,
            estimate_mbps: None,
        });
        assert_eq!(seen.lock().last().unwrap().percent, 99.0);

        aggregator.emit_phase(UploadPhase::Finalizing, 100.0);
        let last = seen.lock().last().cloned().unwrap();
        assert_eq!(last.percent, 100.0);
        assert_eq!(last.phase, UploadPhase::Finalizing);
        assert_eq!(last.bytes_transferred, 10);
    }

    #[test]
    fn test_retry_resets_part_progress() {
        let mut aggregator = ProgressAggregator::new(2, 200, Duration::ZERO, None);
        aggregator.apply(&SchedulerEvent::Progress {
            index: 1,
            bytes: 80,
            size: 100,
        });
        assert_eq!(aggregator.percent(), 40.0);

        aggregator.apply(&SchedulerEvent::Retrying {
            index: 1,
            retries: 1,
            delay: Duration::ZERO,
            error: "timeout".to_string(),
        });
        assert_eq!(aggregator.percent(), 0.0);
        assert_eq!(aggregator.bytes_transferred(), 0);
    }

    #[test]
    fn test_throttled_uploading_but_phase_changes_forced() {
        let (callback, seen) = recording();
        let mut aggregator =
            ProgressAggregator::new(10, 1000, Duration::from_secs(60), Some(callback));

        for bytes in [10, 20, 30] {
            aggregator.apply(&SchedulerEvent::Progress {
                index: 0,
                bytes,
                size: 100,
            });
        }
        aggregator.apply(&SchedulerEvent::Stalled {
            index: 3,
            retries: 1,
        });
        aggregator.emit_phase(UploadPhase::Failed, aggregator.percent());

        let phases: Vec<UploadPhase> = seen.lock().iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                UploadPhase::Uploading,
                UploadPhase::Stalled,
                UploadPhase::Failed
            ]
        );
    }

    #[tokio::test]
    async fn test_part_progress_throttled_then_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = PartProgress::new(2, 1, tx, Duration::from_secs(60));

        progress.report(100);
        progress.report(200);
        progress.finish(300);
        drop(progress);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                PartProgressEvent {
                    index: 2,
                    attempt: 1,
                    bytes: 100
                },
                PartProgressEvent {
                    index: 2,
                    attempt: 1,
                    bytes: 300
                },
            ]
        );
    }
}
