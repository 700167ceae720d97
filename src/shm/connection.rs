//! 消费者侧连接管理
//!
//! 状态机：Disconnected → Connected → Disconnected，没有终止的失败状态，
//! 失败总是在下一个周期从 Disconnected 重试。
//!
//! 消费者只打开已存在的段，从不创建：段的创建和大小由生产者负责，
//! 实时回调里不能有与生产者启动相互竞争的创建副作用。

use super::layout::{RingLayout, SegmentName};
use super::region::SharedRegion;
use super::segment::{SegmentError, SharedSegment};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// 消费者所需的连接能力
///
/// `try_reconnect` 会在每个实时周期被调用，实现必须开销有界、不阻塞
pub trait Connector {
    type Region: SharedRegion;

    /// 幂等：已连接直接返回 true，否则做一次有界的打开尝试
    fn try_reconnect(&mut self) -> bool;

    /// 当前映射的区域
    fn region(&self) -> Option<&Self::Region>;

    /// 释放当前映射（不 unlink）
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool {
        self.region().is_some()
    }
}

/// 共享内存连接管理器
pub struct ConnectionManager {
    name: SegmentName,
    layout: RingLayout,
    segment: Option<SharedSegment>,
    /// 最近一次失败原因（不分配内存）
    last_error: Option<SegmentError>,
    /// 实际发起的打开次数
    attempts: u64,
}

impl ConnectionManager {
    /// 创建管理器并立即尝试连接一次
    ///
    /// 失败时保持 Disconnected，由之后的 `try_reconnect` 重试
    pub fn new(name: SegmentName, layout: RingLayout) -> Self {
        let mut manager = Self {
            name,
            layout,
            segment: None,
            last_error: None,
            attempts: 0,
        };

        if manager.try_reconnect() {
            log::info!("Connected to shared memory segment {} ({})", manager.name, layout);
        } else if let Some(err) = &manager.last_error {
            log::info!(
                "Shared memory segment {} not available yet ({}), will retry",
                manager.name,
                err
            );
        }

        manager
    }

    pub fn state(&self) -> ConnectionState {
        if self.segment.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn last_error(&self) -> Option<&SegmentError> {
        self.last_error.as_ref()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }
}

impl Connector for ConnectionManager {
    type Region = SharedSegment;

    fn try_reconnect(&mut self) -> bool {
        if self.segment.is_some() {
            return true;
        }

        self.attempts += 1;
        match SharedSegment::open_existing(&self.name, self.layout) {
            Ok(segment) => {
                self.segment = Some(segment);
                self.last_error = None;
                true
            }
            Err(err) => {
                self.last_error = Some(err);
                false
            }
        }
    }

    fn region(&self) -> Option<&SharedSegment> {
        self.segment.as_ref()
    }

    fn disconnect(&mut self) {
        self.segment = None;
    }
}
