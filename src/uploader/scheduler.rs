// 上传分片调度器
//
// 功能：
// - 按优先级分发分片（首尾分片优先，同优先级按索引升序）
// - 并发上限 K 由 ConcurrencyHandle 统一管理，K 增大时立即补位，K 减小时不取消进行中的分片
// - 失败分片指数退避后插回队首重试，重试耗尽标记为 Failed
// - 定时停滞检测，强制回收长时间没有进度的分片
// - 根据吞吐量估算自适应调整并发
//
// 所有分片状态只在 run() 的协调路径中修改；上传任务只返回结果。
// 协调循环在一个 select! 上等待：任务完成、分片进度、停滞检测、并发变化、退避到期、取消。

use crate::common::{StallConfig, StallDetector};
use crate::error::TransferError;
use crate::uploader::part::{FailureOutcome, PartLayout, PartReceipt, PartTable};
use crate::uploader::progress::{PartProgress, PartProgressEvent};
use crate::uploader::throughput::{ThroughputConfig, ThroughputEstimator};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 退避倍数的最大指数（避免溢出）
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// 计算指数退避延迟：`base * 2^retries`，不超过 `max`
pub fn retry_backoff(retries: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << retries.min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(factor).min(max)
}

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 初始并发数 K
    pub initial_concurrency: usize,
    /// 自适应调整的下限
    pub min_concurrency: usize,
    /// 自适应调整的上限
    pub max_concurrency: usize,
    /// 是否根据吞吐量自适应调整并发
    pub adaptive_concurrency: bool,
    /// 单个分片最大重试次数
    pub max_retries: u32,
    /// 退避基础延迟
    pub retry_base_delay: Duration,
    /// 退避最大延迟
    pub max_retry_delay: Duration,
    /// 停滞检测
    pub stall: StallConfig,
    /// 分片进度上报节流间隔
    pub progress_interval: Duration,
    /// 首尾分片优先
    pub prioritize_edge_parts: bool,
    /// 吞吐量估算
    pub throughput: ThroughputConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: 3,
            min_concurrency: 1,
            max_concurrency: 6,
            adaptive_concurrency: true,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(30_000),
            stall: StallConfig::default(),
            progress_interval: Duration::from_millis(100),
            prioritize_edge_parts: true,
            throughput: ThroughputConfig::default(),
        }
    }
}

/// 并发上限句柄
///
/// 调度器和外部调用方都只能通过它修改 K；修改后唤醒调度器立即补位
#[derive(Debug, Clone)]
pub struct ConcurrencyHandle {
    bound: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl ConcurrencyHandle {
    pub fn new(initial: usize) -> Self {
        Self {
            bound: Arc::new(AtomicUsize::new(initial.max(1))),
            notify: Arc::new(Notify::new()),
        }
    }

    /// 当前并发上限
    pub fn get(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    /// 设置并发上限（至少为 1），返回旧值
    pub fn set(&self, k: usize) -> usize {
        let k = k.max(1);
        let old = self.bound.swap(k, Ordering::SeqCst);
        if old != k {
            self.notify.notify_one();
        }
        old
    }

    fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// 一次分片上传尝试（交给上传任务）
#[derive(Debug, Clone)]
pub struct PartAttempt {
    pub index: usize,
    /// 尝试编号（从 1 开始）
    pub attempt: u32,
    pub range: Range<u64>,
    pub total_parts: usize,
    pub progress: PartProgress,
}

/// 调度器事件
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// 分片开始上传
    Dispatched { index: usize, attempt: u32 },
    /// 分片进度（当前尝试已传输字节数）
    Progress { index: usize, bytes: u64, size: u64 },
    /// 分片完成
    Completed {
        index: usize,
        size: u64,
        estimate_mbps: Option<f64>,
    },
    /// 分片失败，退避后重试
    Retrying {
        index: usize,
        retries: u32,
        delay: Duration,
        error: String,
    },
    /// 分片停滞被回收
    Stalled { index: usize, retries: u32 },
    /// 分片重试耗尽
    Failed { index: usize, error: String },
    /// 并发上限变化
    ConcurrencyChanged { from: usize, to: usize },
}

/// 调度结果
#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    /// 完成凭证（按索引顺序）
    pub receipts: Vec<PartReceipt>,
    /// 最终失败的分片
    pub failed_parts: Vec<usize>,
    /// 每个分片的尝试次数
    pub attempts: Vec<u32>,
    /// 观测到的最大同时上传分片数
    pub peak_in_flight: usize,
    /// 是否被取消
    pub cancelled: bool,
    /// 最终带宽估计（Mbps）
    pub throughput_mbps: Option<f64>,
    /// 结束时的并发上限
    pub final_concurrency: usize,
    pub total_parts: usize,
}

impl SchedulerReport {
    /// 所有分片都完成
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed_parts.is_empty() && self.receipts.len() == self.total_parts
    }
}

/// 上传任务的返回
struct AttemptOutcome {
    index: usize,
    attempt: u32,
    elapsed: Duration,
    result: Result<PartReceipt, TransferError>,
}

/// 协调循环的唤醒原因
enum Wake {
    Cancelled,
    Joined(Option<Result<AttemptOutcome, JoinError>>),
    Progress(Option<PartProgressEvent>),
    StallTick,
    Rescheduled,
}

/// 分片调度器
pub struct PartScheduler {
    layout: PartLayout,
    config: SchedulerConfig,
    table: PartTable,
    estimator: ThroughputEstimator,
    stall_detector: StallDetector,
    concurrency: ConcurrencyHandle,
    cancel: CancellationToken,
    progress_tx: mpsc::UnboundedSender<PartProgressEvent>,
    progress_rx: Option<mpsc::UnboundedReceiver<PartProgressEvent>>,
    /// 进行中任务的中止句柄 `index -> (attempt, handle)`
    abort_handles: HashMap<usize, (u32, AbortHandle)>,
    /// 上次观测到的并发上限
    last_bound: usize,
    peak_in_flight: usize,
}

impl PartScheduler {
    pub fn new(layout: PartLayout, config: SchedulerConfig, cancel: CancellationToken) -> Self {
        let table = PartTable::new(&layout, config.prioritize_edge_parts);
        let concurrency = ConcurrencyHandle::new(config.initial_concurrency);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        Self {
            layout,
            estimator: ThroughputEstimator::new(config.throughput.clone()),
            stall_detector: StallDetector::new(config.stall.clone()),
            last_bound: concurrency.get(),
            concurrency,
            config,
            table,
            cancel,
            progress_tx,
            progress_rx: Some(progress_rx),
            abort_handles: HashMap::new(),
            peak_in_flight: 0,
        }
    }

    /// 并发上限句柄（可在 run 期间从外部调整）
    pub fn concurrency_handle(&self) -> ConcurrencyHandle {
        self.concurrency.clone()
    }

    pub fn table(&self) -> &PartTable {
        &self.table
    }

    /// 驱动所有分片到终态
    ///
    /// # 参数
    /// * `job` - 为一次分片尝试创建上传 future
    /// * `on_event` - 调度事件回调（在协调路径上同步调用）
    pub async fn run<J, Fut, E>(&mut self, job: J, mut on_event: E) -> SchedulerReport
    where
        J: Fn(PartAttempt) -> Fut,
        Fut: Future<Output = Result<PartReceipt, TransferError>> + Send + 'static,
        E: FnMut(SchedulerEvent) + Send,
    {
        let Some(mut progress_rx) = self.progress_rx.take() else {
            warn!("调度器已运行过，忽略重复调用");
            return self.report(false);
        };

        let cancel = self.cancel.clone();
        let notify = self.concurrency.notify();
        let mut join_set: JoinSet<AttemptOutcome> = JoinSet::new();

        let mut stall_ticker = tokio::time::interval(self.stall_detector.check_interval());
        stall_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回
        stall_ticker.tick().await;

        info!(
            "开始调度分片: 共 {} 个, 并发上限 {}, 最大重试 {} 次",
            self.layout.total_parts(),
            self.concurrency.get(),
            self.config.max_retries
        );

        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.sync_bound(&mut on_event);
            self.table.promote_due(Instant::now());
            self.fill_slots(&job, &mut join_set, &mut on_event);

            if self.table.is_settled() {
                break;
            }

            let deadline = self.table.next_deadline();
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                joined = join_set.join_next(), if !join_set.is_empty() => Wake::Joined(joined),
                event = progress_rx.recv() => Wake::Progress(event),
                _ = stall_ticker.tick() => Wake::StallTick,
                _ = notify.notified() => Wake::Rescheduled,
                _ = sleep_until(deadline), if deadline.is_some() => Wake::Rescheduled,
            };

            match wake {
                Wake::Cancelled => {
                    cancelled = true;
                    break;
                }
                Wake::Joined(Some(Ok(outcome))) => self.handle_outcome(outcome, &mut on_event),
                Wake::Joined(Some(Err(e))) => {
                    // 被中止的任务（停滞回收）已在回收时处理
                    if !e.is_cancelled() {
                        warn!("上传任务异常退出: {}", e);
                    }
                }
                Wake::Joined(None) => {}
                Wake::Progress(Some(event)) => self.handle_progress(event, &mut on_event),
                Wake::Progress(None) => {}
                Wake::StallTick => self.reclaim_stalled(&mut on_event),
                Wake::Rescheduled => {}
            }
        }

        if cancelled {
            warn!(
                "上传已取消，中止 {} 个进行中的分片",
                self.table.in_flight_count()
            );
            for (_, (_, handle)) in self.abort_handles.drain() {
                handle.abort();
            }
            self.table.abandon_in_flight();
        }

        // 等待所有任务退出，不留悬挂的传输
        join_set.shutdown().await;
        self.abort_handles.clear();

        let counts = self.table.counts();
        info!(
            "分片调度结束: 完成 {}/{}, 失败 {}, 未完成 {}, 最大并发 {}, 取消={}",
            counts.completed,
            counts.total(),
            counts.failed,
            counts.pending + counts.stalled,
            self.peak_in_flight,
            cancelled
        );
        self.report(cancelled)
    }

    /// 按当前并发上限补位
    fn fill_slots<J, Fut, E>(&mut self, job: &J, join_set: &mut JoinSet<AttemptOutcome>, on_event: &mut E)
    where
        J: Fn(PartAttempt) -> Fut,
        Fut: Future<Output = Result<PartReceipt, TransferError>> + Send + 'static,
        E: FnMut(SchedulerEvent),
    {
        while !self.cancel.is_cancelled() && self.table.in_flight_count() < self.concurrency.get() {
            let Some(index) = self.table.next_ready() else {
                break;
            };

            let attempt = self.table.mark_in_flight(index, Instant::now());
            let progress = PartProgress::new(
                index,
                attempt,
                self.progress_tx.clone(),
                self.config.progress_interval,
            );
            let transfer = job(PartAttempt {
                index,
                attempt,
                range: self.layout.range(index),
                total_parts: self.layout.total_parts(),
                progress,
            });

            let handle = join_set.spawn(async move {
                let started = Instant::now();
                let result = match AssertUnwindSafe(transfer).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(TransferError::Aborted(format!(
                        "分片 #{} 上传任务 panic",
                        index
                    ))),
                };
                AttemptOutcome {
                    index,
                    attempt,
                    elapsed: started.elapsed(),
                    result,
                }
            });
            self.abort_handles.insert(index, (attempt, handle));

            debug!("分发分片 #{} (第 {} 次尝试)", index, attempt);
            on_event(SchedulerEvent::Dispatched { index, attempt });

            self.peak_in_flight = self.peak_in_flight.max(self.table.in_flight_count());
        }
    }

    fn handle_outcome<E: FnMut(SchedulerEvent)>(&mut self, outcome: AttemptOutcome, on_event: &mut E) {
        let AttemptOutcome {
            index,
            attempt,
            elapsed,
            result,
        } = outcome;

        if !self.table.is_current_attempt(index, attempt) {
            debug!("忽略分片 #{} 已放弃的第 {} 次尝试结果", index, attempt);
            return;
        }
        if matches!(self.abort_handles.get(&index), Some((a, _)) if *a == attempt) {
            self.abort_handles.remove(&index);
        }

        match result {
            Ok(receipt) => {
                let size = self.layout.part_len(index);
                self.table.mark_completed(index, receipt);
                let estimate = self
                    .estimator
                    .record_sample(size, elapsed.as_millis() as u64);

                debug!(
                    "分片 #{} 上传成功: {} bytes, 耗时 {:?}, 估计带宽 {:.2} Mbps",
                    index,
                    size,
                    elapsed,
                    estimate.unwrap_or(0.0)
                );
                on_event(SchedulerEvent::Completed {
                    index,
                    size,
                    estimate_mbps: estimate,
                });

                self.adapt_concurrency();
            }
            Err(e) => self.fail_attempt(index, e.to_string(), false, on_event),
        }
    }

    fn handle_progress<E: FnMut(SchedulerEvent)>(&mut self, event: PartProgressEvent, on_event: &mut E) {
        if !self
            .table
            .record_progress(event.index, event.attempt, event.bytes, Instant::now())
        {
            return;
        }
        if let Some(part) = self.table.get(event.index) {
            on_event(SchedulerEvent::Progress {
                index: part.index,
                bytes: part.bytes_transferred,
                size: part.size(),
            });
        }
    }

    /// 回收停滞分片
    fn reclaim_stalled<E: FnMut(SchedulerEvent)>(&mut self, on_event: &mut E) {
        let stalled = self
            .stall_detector
            .find_stalled(Instant::now(), &self.table.in_flight_progress());

        for index in stalled {
            if let Some((_, handle)) = self.abort_handles.remove(&index) {
                handle.abort();
            }
            let timeout = self.stall_detector.stall_timeout();
            self.fail_attempt(
                index,
                format!("超过 {:?} 没有进度", timeout),
                true,
                on_event,
            );
        }
    }

    fn fail_attempt<E: FnMut(SchedulerEvent)>(
        &mut self,
        index: usize,
        error: String,
        stalled: bool,
        on_event: &mut E,
    ) {
        let base = self.config.retry_base_delay;
        let max = self.config.max_retry_delay;
        let outcome = self.table.mark_attempt_failed(
            index,
            self.config.max_retries,
            |retries| retry_backoff(retries, base, max),
            Instant::now(),
            stalled,
        );

        match outcome {
            FailureOutcome::Requeued { retries, delay } => {
                warn!(
                    "分片 #{} 上传失败，{:?} 后第 {}/{} 次重试: {}",
                    index, delay, retries, self.config.max_retries, error
                );
                if stalled {
                    on_event(SchedulerEvent::Stalled { index, retries });
                } else {
                    on_event(SchedulerEvent::Retrying {
                        index,
                        retries,
                        delay,
                        error,
                    });
                }
            }
            FailureOutcome::Exhausted { retries } => {
                error!(
                    "分片 #{} 重试 {} 次后仍失败，放弃: {}",
                    index, retries, error
                );
                if stalled {
                    on_event(SchedulerEvent::Stalled { index, retries });
                }
                on_event(SchedulerEvent::Failed { index, error });
            }
        }
    }

    /// 根据吞吐量建议调整并发（通过 ConcurrencyHandle）
    fn adapt_concurrency(&mut self) {
        if !self.config.adaptive_concurrency {
            return;
        }
        let current = self.concurrency.get();
        let min = self.config.min_concurrency.max(1);
        let max = self.config.max_concurrency.max(min);

        let target = if self.estimator.should_increase_concurrency() && current < max {
            current + 1
        } else if self.estimator.should_reduce_concurrency() && current > min {
            current - 1
        } else {
            return;
        };
        self.concurrency.set(target);
    }

    /// 检测并发上限变化
    fn sync_bound<E: FnMut(SchedulerEvent)>(&mut self, on_event: &mut E) {
        let bound = self.concurrency.get();
        if bound != self.last_bound {
            info!("🔧 调整分片并发上限: {} -> {}", self.last_bound, bound);
            on_event(SchedulerEvent::ConcurrencyChanged {
                from: self.last_bound,
                to: bound,
            });
            self.last_bound = bound;
        }
    }

    fn report(&self, cancelled: bool) -> SchedulerReport {
        SchedulerReport {
            receipts: self.table.receipts(),
            failed_parts: self.table.failed_indices(),
            attempts: self.table.attempts(),
            peak_in_flight: self.peak_in_flight,
            cancelled,
            throughput_mbps: self.estimator.estimate(),
            final_concurrency: self.concurrency.get(),
            total_parts: self.layout.total_parts(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
