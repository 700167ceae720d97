//! 共享内存传输层
//!
//! 包含：
//! - Layout: wire format 与布局校验
//! - Ring Buffer: 共享内存上的 lock-free SPSC 环形缓冲区视图
//! - Region: 承载缓冲区的内存区域（堆 / 共享内存）
//! - Segment: POSIX 共享内存段的创建、打开、映射、删除
//! - Connection: 消费者侧的连接管理与重连

pub mod connection;
pub mod layout;
pub mod region;
pub mod ring_buffer;
pub mod segment;

pub use connection::{ConnectionManager, ConnectionState, Connector};
pub use layout::{RingLayout, SegmentName, SharedHeader};
pub use region::{HeapRegion, SharedRegion};
pub use ring_buffer::{RingBuffer, RingError};
pub use segment::{SegmentError, SharedSegment};
