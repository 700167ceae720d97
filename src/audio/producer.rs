//! 生产者角色
//!
//! 负责发布 is_active 并按块写入样本。
//! 写满时整块丢弃并计数，不重试、不反压：生产者宁可丢最新数据，
//! 也不能阻塞自己的音频来源。

use crate::shm::{RingError, RingLayout, SegmentError, SegmentName, SharedRegion, SharedSegment};

use super::stats::ProducerStats;

/// 生产者配置
#[derive(Debug, Clone, Default)]
pub struct ProducerConfig {
    pub segment_name: SegmentName,
    pub layout: RingLayout,
    /// 对映射调用 mlock
    pub lock_memory: bool,
}

/// 生产者
pub struct ProducerRole<R: SharedRegion = SharedSegment> {
    region: R,
    started: bool,
    stats: ProducerStats,
}

impl ProducerRole<SharedSegment> {
    /// 创建（或复用）共享内存段并构造生产者
    ///
    /// 此时还没有发布 is_active，第一次 `push` 或显式 `start` 时才发布
    pub fn create(config: &ProducerConfig) -> Result<Self, SegmentError> {
        let mut segment = SharedSegment::create(&config.segment_name, config.layout)?;
        if config.lock_memory && !segment.lock_memory() {
            log::warn!("Continuing without locked memory for {}", config.segment_name);
        }
        Ok(Self::new(segment))
    }
}

impl<R: SharedRegion> ProducerRole<R> {
    pub fn new(region: R) -> Self {
        Self {
            region,
            started: false,
            stats: ProducerStats::new(),
        }
    }

    /// 发布 is_active = true（Release），先于第一次写入
    pub fn start(&mut self) {
        if !self.started {
            self.region.ring().set_active(true);
            self.started = true;
            log::info!("Producer started ({})", self.region.layout());
        }
    }

    /// 写入一块交织样本
    ///
    /// 每块只尝试一次。`CapacityExceeded` 时该块被丢弃并计入统计，
    /// 调用方可以忽略这个错误继续下一块。
    pub fn push(&mut self, samples: &[f32]) -> Result<(), RingError> {
        self.start();

        let ring = self.region.ring();
        match ring.write(samples) {
            Ok(()) => {
                self.stats
                    .record_written((samples.len() / ring.channels()) as u64);
                Ok(())
            }
            Err(err @ RingError::CapacityExceeded { requested, .. }) => {
                self.stats.record_dropped(requested);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// 清除 is_active
    pub fn stop(&mut self) {
        if self.started {
            self.region.ring().set_active(false);
            self.started = false;
            log::info!(
                "Producer stopped: {} frames written, {} frames dropped",
                self.stats.frames_written(),
                self.stats.frames_dropped()
            );
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn stats(&self) -> &ProducerStats {
        &self.stats
    }
}

impl<R: SharedRegion> Drop for ProducerRole<R> {
    fn drop(&mut self) {
        self.stop();
    }
}
