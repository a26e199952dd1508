// 分片上传引擎
//
// 组件（从底层到顶层）：
// - part_size：按文件大小和带宽计算分片大小
// - throughput：滑动窗口加权带宽估计，给出并发调整建议
// - scheduler：分片队列、并发上限、退避重试、停滞检测
// - executor：单个分片的一次网络传输（中转 / 直传）
// - orchestrator：初始化 → 调度 → 汇总进度 → 合并

pub mod executor;
pub mod orchestrator;
pub mod part;
pub mod part_size;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod throughput;

pub use executor::{Destination, HttpTransferExecutor, PartUpload, TransferExecutor};
pub use orchestrator::{UploadOrchestrator, UploadRequest, UploadResult};
pub use part::{Part, PartLayout, PartReceipt, PartState, PartTable};
pub use part_size::{compute_part_size, MAX_PART_SIZE, MIN_PART_SIZE};
pub use progress::{PartProgress, ProgressCallback, UploadPhase, UploadProgress};
pub use scheduler::{
    retry_backoff, ConcurrencyHandle, PartScheduler, SchedulerConfig, SchedulerEvent,
    SchedulerReport,
};
pub use session::UploadSession;
pub use source::{guess_content_type, UploadSource};
pub use throughput::{ThroughputConfig, ThroughputEstimator};

/// 🔥 根据文件大小计算初始并发分片数
///
/// 小文件并发收益有限，大文件提高并发摊薄单请求开销
///
/// # 参数
/// * `file_size` - 文件大小（字节）
///
/// # 返回
/// 初始并发分片数
pub fn recommended_concurrency(file_size: u64) -> usize {
    match file_size {
        0..=20_971_520 => 2,              // <=20MB
        20_971_521..=209_715_200 => 3,    // 20MB-200MB
        209_715_201..=1_073_741_824 => 4, // 200MB-1GB
        _ => 6,                           // >1GB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_concurrency() {
        const MB: u64 = 1024 * 1024;
        assert_eq!(recommended_concurrency(5 * MB), 2);
        assert_eq!(recommended_concurrency(20 * MB), 2);
        assert_eq!(recommended_concurrency(100 * MB), 3);
        assert_eq!(recommended_concurrency(1024 * MB), 4);
        assert_eq!(recommended_concurrency(4096 * MB), 6);
    }
}
