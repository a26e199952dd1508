//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod stall_detector;
mod throttle;

pub use stall_detector::{StallConfig, StallDetector};
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
