//! 进度事件节流器
//!
//! 控制进度回调的发布频率，避免 UI 消费方被事件风暴淹没
//! 默认 100ms 间隔（约 10 次/秒）

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 100;

/// 尚未发布过事件的标记值
const NEVER_EMITTED: u64 = u64::MAX;

/// 进度事件节流器
///
/// 线程安全，使用原子操作避免锁竞争。
/// 典型用法：每次更新进度时调用 `should_emit()`，返回 true 时才发布事件
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    origin: Instant,
    /// 上次发布事件的时间（相对 origin 的纳秒数）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER_EMITTED),
            interval_nanos: interval.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 第一次调用总是返回 true；之后距离上次发布超过间隔才返回 true
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != NEVER_EMITTED && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // CAS 失败说明被其他线程抢先发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（阶段切换、最后一次更新）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(self.now_nanos(), Ordering::Relaxed);
        true
    }

    fn now_nanos(&self) -> u64 {
        // 保留 NEVER_EMITTED 作为哨兵值
        (self.origin.elapsed().as_nanos() as u64).min(NEVER_EMITTED - 1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
