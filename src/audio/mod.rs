//! 音频角色模块
//!
//! 包含：
//! - Producer: 发布活动状态，按块写入共享环形缓冲区
//! - Consumer: 实时回调侧的读取、重连、活性判定
//! - Format: 交织 f32 流格式
//! - Signal: 测试信号生成
//! - Timing: 单调时钟与固定节拍
//! - Stats: lock-free 传输统计

pub mod consumer;
pub mod format;
pub mod producer;
pub mod signal;
pub mod stats;
pub mod timing;

pub use consumer::{ConsumerConfig, ConsumerRole, CycleOutcome};
pub use format::StreamFormat;
pub use producer::{ProducerConfig, ProducerRole};
pub use signal::{SignalGenerator, SignalKind};
pub use stats::{ConsumerReport, ConsumerStats, ProducerReport, ProducerStats};
