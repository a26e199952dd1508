// 上传分片管理
//
// - PartLayout：文件大小 + 分片大小 → 分片数量与每个分片的字节范围（会话内固定）
// - PartTable：调度器独占的分片状态表，维护就绪队列、退避队列和每个分片的状态机
//
// 状态机：
//   Pending -[dispatch]-> InFlight -[success]-> Completed
//   InFlight -[失败, retries < max]-> Pending（退避后插回队首）
//   InFlight -[停滞, retries < max]-> Stalled（退避后变回 Pending，插回队首）
//   InFlight -[失败/停滞, retries >= max]-> Failed（终态）

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 首尾分片的优先级（携带元数据 / 便于提前合并）
pub const EDGE_PART_PRIORITY: i32 = 1;

/// 普通分片优先级
pub const NORMAL_PART_PRIORITY: i32 = 0;

/// 分片布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLayout {
    file_size: u64,
    part_size: u64,
    total_parts: usize,
}

impl PartLayout {
    /// 创建分片布局
    ///
    /// `total_parts = ceil(file_size / part_size)`
    pub fn new(file_size: u64, part_size: u64) -> Result<Self, ValidationError> {
        if file_size == 0 {
            return Err(ValidationError::EmptyFile);
        }
        if part_size == 0 {
            return Err(ValidationError::InvalidPartSize(0));
        }

        Ok(Self {
            file_size,
            part_size,
            total_parts: file_size.div_ceil(part_size) as usize,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn total_parts(&self) -> usize {
        self.total_parts
    }

    /// 分片字节范围 `[index*part_size, min((index+1)*part_size, file_size))`
    ///
    /// 越界索引返回空范围
    pub fn range(&self, index: usize) -> Range<u64> {
        let start = (index as u64)
            .saturating_mul(self.part_size)
            .min(self.file_size);
        let end = start.saturating_add(self.part_size).min(self.file_size);
        start..end
    }

    /// 分片大小（字节）
    pub fn part_len(&self, index: usize) -> u64 {
        let range = self.range(index);
        range.end - range.start
    }

    /// 是否为首/尾分片
    pub fn is_edge(&self, index: usize) -> bool {
        index == 0 || index + 1 == self.total_parts
    }

    /// 遍历所有分片范围
    pub fn ranges(&self) -> impl Iterator<Item = (usize, Range<u64>)> + '_ {
        (0..self.total_parts).map(move |index| (index, self.range(index)))
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartState {
    /// 等待调度（包括退避等待中的失败重试）
    Pending,
    /// 上传中
    InFlight,
    /// 已完成
    Completed,
    /// 重试次数耗尽（终态）
    Failed,
    /// 因停滞被回收，退避结束后变回 Pending
    Stalled,
}

/// 分片完成凭证
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartReceipt {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 完整性校验值（直传模式的 ETag）
    pub etag: Option<String>,
    /// 分片字节数
    pub bytes: u64,
}

impl PartReceipt {
    /// 对象存储使用的分片编号（从 1 开始）
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// 上传分片信息
#[derive(Debug, Clone)]
pub struct Part {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 当前状态
    pub state: PartState,
    /// 已重试次数
    pub retries: u32,
    /// 已发起的尝试次数
    pub attempts: u32,
    /// 调度优先级（越大越先调度）
    pub priority: i32,
    /// 当前尝试已传输的字节数
    pub bytes_transferred: u64,
    /// 最后一次进度时间（上传中才有值）
    pub last_progress: Option<Instant>,
    /// 完成凭证
    pub receipt: Option<PartReceipt>,
}

impl Part {
    pub fn new(index: usize, range: Range<u64>, priority: i32) -> Self {
        Self {
            index,
            range,
            state: PartState::Pending,
            retries: 0,
            attempts: 0,
            priority,
            bytes_transferred: 0,
            last_progress: None,
            receipt: None,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 当前尝试的进度百分比
    pub fn percent(&self) -> f64 {
        if self.state == PartState::Completed {
            return 100.0;
        }
        if self.size() == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.size() as f64 * 100.0).min(100.0)
    }
}

/// 分片失败后的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// 已重新排队，`delay` 后可再次调度
    Requeued { retries: u32, delay: Duration },
    /// 重试次数耗尽，分片进入 Failed
    Exhausted { retries: u32 },
}

/// 各状态分片计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub stalled: usize,
}

impl PartCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.completed + self.failed + self.stalled
    }
}

/// 分片状态表
///
/// 只由调度器的协调路径修改；执行器只返回结果，不直接改动这里的状态
#[derive(Debug)]
pub struct PartTable {
    /// 所有分片
    parts: Vec<Part>,
    /// 就绪队列（按优先级降序、索引升序）
    ready: VecDeque<usize>,
    /// 退避等待中的分片 `(可调度时间, index)`
    delayed: Vec<(Instant, usize)>,
    /// 上传中的分片数
    in_flight: usize,
}

impl PartTable {
    /// 根据分片布局创建状态表
    ///
    /// # 参数
    /// * `layout` - 分片布局
    /// * `prioritize_edges` - 是否提升首尾分片优先级
    pub fn new(layout: &PartLayout, prioritize_edges: bool) -> Self {
        let parts: Vec<Part> = layout
            .ranges()
            .map(|(index, range)| {
                let priority = if prioritize_edges && layout.is_edge(index) {
                    EDGE_PART_PRIORITY
                } else {
                    NORMAL_PART_PRIORITY
                };
                Part::new(index, range, priority)
            })
            .collect();

        // 稳定排序：同优先级保持索引升序
        let mut order: Vec<usize> = (0..parts.len()).collect();
        order.sort_by_key(|&index| Reverse(parts[index].priority));

        info!(
            "创建分片状态表: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            layout.file_size(),
            layout.part_size(),
            parts.len()
        );

        Self {
            parts,
            ready: order.into(),
            delayed: Vec::new(),
            in_flight: 0,
        }
    }

    /// 获取所有分片
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn get(&self, index: usize) -> Option<&Part> {
        self.parts.get(index)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    /// 就绪队列快照（调度顺序）
    pub fn ready_order(&self) -> Vec<usize> {
        self.ready.iter().copied().collect()
    }

    /// 取出下一个待调度分片
    pub fn next_ready(&mut self) -> Option<usize> {
        self.ready.pop_front()
    }

    /// 标记分片开始上传，返回本次尝试编号（从 1 开始）
    pub fn mark_in_flight(&mut self, index: usize, now: Instant) -> u32 {
        let Some(part) = self.parts.get_mut(index) else {
            return 0;
        };
        if part.state != PartState::InFlight {
            self.in_flight += 1;
        }
        part.state = PartState::InFlight;
        part.attempts += 1;
        part.bytes_transferred = 0;
        part.last_progress = Some(now);
        part.attempts
    }

    /// 是否为分片当前的上传尝试
    pub fn is_current_attempt(&self, index: usize, attempt: u32) -> bool {
        self.parts
            .get(index)
            .map(|p| p.state == PartState::InFlight && p.attempts == attempt)
            .unwrap_or(false)
    }

    /// 记录分片进度
    ///
    /// 同一次尝试内字节数单调不减；过期尝试的进度直接忽略
    pub fn record_progress(&mut self, index: usize, attempt: u32, bytes: u64, now: Instant) -> bool {
        if !self.is_current_attempt(index, attempt) {
            return false;
        }
        let part = &mut self.parts[index];
        let bytes = bytes.min(part.size());
        if bytes > part.bytes_transferred {
            part.bytes_transferred = bytes;
        }
        part.last_progress = Some(now);
        true
    }

    /// 标记分片完成
    pub fn mark_completed(&mut self, index: usize, receipt: PartReceipt) {
        if let Some(part) = self.parts.get_mut(index) {
            if part.state == PartState::InFlight {
                self.in_flight -= 1;
            }
            part.state = PartState::Completed;
            part.bytes_transferred = part.size();
            part.last_progress = None;
            part.receipt = Some(receipt);
        }
    }

    /// 处理一次失败（传输错误或停滞）
    ///
    /// # 参数
    /// * `index` - 分片索引
    /// * `max_retries` - 最大重试次数
    /// * `backoff` - 根据已重试次数计算退避时间
    /// * `now` - 当前时间
    /// * `stalled` - 是否因停滞回收
    pub fn mark_attempt_failed(
        &mut self,
        index: usize,
        max_retries: u32,
        backoff: impl Fn(u32) -> Duration,
        now: Instant,
        stalled: bool,
    ) -> FailureOutcome {
        let Some(part) = self.parts.get_mut(index) else {
            return FailureOutcome::Exhausted { retries: 0 };
        };
        if part.state == PartState::InFlight {
            self.in_flight -= 1;
        }
        part.bytes_transferred = 0;
        part.last_progress = None;

        if part.retries < max_retries {
            let delay = backoff(part.retries);
            part.retries += 1;
            part.state = if stalled {
                PartState::Stalled
            } else {
                PartState::Pending
            };
            self.delayed.push((now + delay, index));
            debug!(
                "分片 #{} 重新排队: 已重试 {}/{}, 退避 {:?}",
                index, part.retries, max_retries, delay
            );
            FailureOutcome::Requeued {
                retries: part.retries,
                delay,
            }
        } else {
            part.state = PartState::Failed;
            FailureOutcome::Exhausted {
                retries: part.retries,
            }
        }
    }

    /// 退避到期的分片插回就绪队列队首（优先恢复）
    ///
    /// 返回本次提升的分片数
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut due: Vec<usize> = Vec::new();
        self.delayed.retain(|(ready_at, index)| {
            if *ready_at <= now {
                due.push(*index);
                false
            } else {
                true
            }
        });

        // 同批到期的分片也保持优先级降序、索引升序
        due.sort_by_key(|&index| (Reverse(self.parts[index].priority), index));
        for &index in due.iter().rev() {
            self.parts[index].state = PartState::Pending;
            self.ready.push_front(index);
        }
        due.len()
    }

    /// 最早的退避到期时间
    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayed.iter().map(|(ready_at, _)| *ready_at).min()
    }

    /// 上传中分片的最后进度时间
    pub fn in_flight_progress(&self) -> Vec<(usize, Instant)> {
        self.parts
            .iter()
            .filter(|p| p.state == PartState::InFlight)
            .filter_map(|p| p.last_progress.map(|t| (p.index, t)))
            .collect()
    }

    /// 所有分片是否都到达终态（没有排队、退避或上传中的分片）
    pub fn is_settled(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_flight == 0
    }

    /// 各状态计数
    pub fn counts(&self) -> PartCounts {
        let mut counts = PartCounts::default();
        for part in &self.parts {
            match part.state {
                PartState::Pending => counts.pending += 1,
                PartState::InFlight => counts.in_flight += 1,
                PartState::Completed => counts.completed += 1,
                PartState::Failed => counts.failed += 1,
                PartState::Stalled => counts.stalled += 1,
            }
        }
        counts
    }

    /// 已完成分片的凭证（按索引顺序）
    pub fn receipts(&self) -> Vec<PartReceipt> {
        self.parts
            .iter()
            .filter_map(|p| p.receipt.clone())
            .collect()
    }

    /// 最终失败的分片索引
    pub fn failed_indices(&self) -> Vec<usize> {
        self.parts
            .iter()
            .filter(|p| p.state == PartState::Failed)
            .map(|p| p.index)
            .collect()
    }

    /// 每个分片的尝试次数
    pub fn attempts(&self) -> Vec<u32> {
        self.parts.iter().map(|p| p.attempts).collect()
    }

    /// 上传中分片放弃（取消时），状态回到 Pending
    pub fn abandon_in_flight(&mut self) {
        for part in &mut self.parts {
            if part.state == PartState::InFlight {
                part.state = PartState::Pending;
                part.bytes_transferred = 0;
                part.last_progress = None;
            }
        }
        self.in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    fn no_backoff(_: u32) -> Duration {
        Duration::ZERO
    }

    #[test]
    fn test_layout_ten_mb_in_four_mb_parts() {
        let layout = PartLayout::new(10 * MB, 4 * MB).unwrap();
        assert_eq!(layout.total_parts(), 3);
        assert_eq!(layout.range(0), 0..4 * MB);
        assert_eq!(layout.range(1), 4 * MB..8 * MB);
        assert_eq!(layout.range(2), 8 * MB..10 * MB);
        assert_eq!(layout.part_len(2), 2 * MB);
    }

    #[test]
    fn test_layout_rejects_empty_file() {
        assert_eq!(PartLayout::new(0, 4 * MB), Err(ValidationError::EmptyFile));
        assert_eq!(
            PartLayout::new(10, 0),
            Err(ValidationError::InvalidPartSize(0))
        );
    }

    #[test]
    fn test_out_of_range_index_is_empty() {
        let layout = PartLayout::new(10 * MB, 4 * MB).unwrap();
        assert!(layout.range(3).is_empty());
        assert!(layout.range(usize::MAX).is_empty());
    }

    proptest! {
        #[test]
        fn prop_ranges_cover_file_without_gaps(file_size in 1u64..50_000_000, part_size in 1024u64..20_000_000) {
            let layout = PartLayout::new(file_size, part_size).unwrap();
            prop_assert_eq!(layout.total_parts() as u64, file_size.div_ceil(part_size));

            let mut expected_start = 0u64;
            for (_, range) in layout.ranges() {
                prop_assert_eq!(range.start, expected_start);
                prop_assert!(range.end > range.start);
                prop_assert!(range.end - range.start <= part_size);
                expected_start = range.end;
            }
            prop_assert_eq!(expected_start, file_size);
        }
    }

    #[test]
    fn test_dispatch_order_prefers_edges() {
        let layout = PartLayout::new(5 * MB, MB).unwrap();
        let table = PartTable::new(&layout, true);
        assert_eq!(table.ready_order(), vec![0, 4, 1, 2, 3]);

        let table = PartTable::new(&layout, false);
        assert_eq!(table.ready_order(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_progress_monotonic_and_reset_on_retry() {
        let layout = PartLayout::new(4 * MB, 4 * MB).unwrap();
        let mut table = PartTable::new(&layout, true);
        let now = Instant::now();

        let index = table.next_ready().unwrap();
        let attempt = table.mark_in_flight(index, now);
        assert_eq!(attempt, 1);

        assert!(table.record_progress(index, attempt, MB, now));
        assert!(table.record_progress(index, attempt, 512 * 1024, now));
        assert_eq!(table.get(index).unwrap().bytes_transferred, MB);
        assert_eq!(table.get(index).unwrap().percent(), 25.0);

        table.mark_attempt_failed(index, 3, no_backoff, now, false);
        assert_eq!(table.get(index).unwrap().bytes_transferred, 0);

        // 过期尝试的进度被忽略
        assert!(!table.record_progress(index, attempt, 2 * MB, now));
    }

    #[test]
    fn test_retry_requeues_at_front_after_backoff() {
        let layout = PartLayout::new(3 * MB, MB).unwrap();
        let mut table = PartTable::new(&layout, false);
        let now = Instant::now();

        let first = table.next_ready().unwrap();
        table.mark_in_flight(first, now);
        let outcome =
            table.mark_attempt_failed(first, 3, |_| Duration::from_millis(100), now, false);
        assert_eq!(
            outcome,
            FailureOutcome::Requeued {
                retries: 1,
                delay: Duration::from_millis(100)
            }
        );

        // 退避未到期
        assert_eq!(table.promote_due(now), 0);
        assert_eq!(table.ready_order(), vec![1, 2]);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(100)));

        // 到期后插回队首
        assert_eq!(table.promote_due(now + Duration::from_millis(100)), 1);
        assert_eq!(table.ready_order(), vec![0, 1, 2]);
        assert_eq!(table.get(0).unwrap().state, PartState::Pending);
    }

    #[test]
    fn test_retries_exhausted_marks_failed() {
        let layout = PartLayout::new(MB, MB).unwrap();
        let mut table = PartTable::new(&layout, true);
        let now = Instant::now();

        for expected_retries in 1..=2 {
            table.promote_due(now);
            let index = table.next_ready().unwrap();
            table.mark_in_flight(index, now);
            assert_eq!(
                table.mark_attempt_failed(index, 2, no_backoff, now, false),
                FailureOutcome::Requeued {
                    retries: expected_retries,
                    delay: Duration::ZERO
                }
            );
        }

        table.promote_due(now);
        let index = table.next_ready().unwrap();
        table.mark_in_flight(index, now);
        assert_eq!(
            table.mark_attempt_failed(index, 2, no_backoff, now, false),
            FailureOutcome::Exhausted { retries: 2 }
        );
        assert_eq!(table.failed_indices(), vec![0]);
        assert_eq!(table.attempts(), vec![3]);
        assert!(table.is_settled());
    }

    #[test]
    fn test_stalled_state_until_backoff_expires() {
        let layout = PartLayout::new(2 * MB, MB).unwrap();
        let mut table = PartTable::new(&layout, true);
        let now = Instant::now();

        let index = table.next_ready().unwrap();
        table.mark_in_flight(index, now);
        table.mark_attempt_failed(index, 3, |_| Duration::from_secs(1), now, true);

        assert_eq!(table.get(index).unwrap().state, PartState::Stalled);
        assert_eq!(table.get(index).unwrap().retries, 1);

        table.promote_due(now + Duration::from_secs(1));
        assert_eq!(table.get(index).unwrap().state, PartState::Pending);
    }

    #[test]
    fn test_counts_partition_all_parts() {
        let layout = PartLayout::new(5 * MB, MB).unwrap();
        let mut table = PartTable::new(&layout, true);
        let now = Instant::now();

        let a = table.next_ready().unwrap();
        let b = table.next_ready().unwrap();
        let c = table.next_ready().unwrap();
        table.mark_in_flight(a, now);
        table.mark_in_flight(b, now);
        table.mark_in_flight(c, now);
        table.mark_completed(
            a,
            PartReceipt {
                index: a,
                etag: None,
                bytes: MB,
            },
        );
        table.mark_attempt_failed(b, 0, no_backoff, now, false);

        let counts = table.counts();
        assert_eq!(counts.total(), 5);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.pending, 2);
        assert_eq!(table.in_flight_count(), 1);
    }

    #[test]
    fn test_receipts_in_index_order() {
        let layout = PartLayout::new(3 * MB, MB).unwrap();
        let mut table = PartTable::new(&layout, true);
        let now = Instant::now();

        for index in [2, 0, 1] {
            table.mark_in_flight(index, now);
            table.mark_completed(
                index,
                PartReceipt {
                    index,
                    etag: Some(format!("etag-{}", index)),
                    bytes: MB,
                },
            );
        }

        let numbers: Vec<u32> = table.receipts().iter().map(|r| r.part_number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
