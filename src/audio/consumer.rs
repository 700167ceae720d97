//! 消费者角色
//!
//! 每次实时回调调用一次 `render`：
//! 1. 未连接时做一次有界的重连尝试
//! 2. 仍未连接，或生产者未活动，输出静音
//! 3. 否则读取一个周期的数据，不足时输出静音
//!
//! 另外跟踪 write_index：生产者声称活动，但连续若干周期既读不到数据、
//! 写指针也不动时，认为它已经失效（进程崩溃后没有机会清除 is_active），
//! 断开映射，下一周期重新打开，可以接上重建的段。
//! 缓冲区里还有数据时总是照常读取，不做失效判定。
//! 同一个写指针位置再次判定失效的间隔逐次加倍，
//! 生产者一直不回来时不会每隔几十个周期就 munmap/重开一次。
//!
//! **绝对禁止：** 锁、分配、阻塞 I/O、日志

use std::sync::Arc;

use crate::shm::{
    ConnectionManager, Connector, RingError, RingLayout, SegmentName, SharedRegion,
};

use super::stats::ConsumerStats;

/// 默认失效判定周期数
pub const DEFAULT_STALE_AFTER_CYCLES: u32 = 64;

/// 同一写指针位置重复判定失效时的最大间隔倍数
const MAX_STALE_BACKOFF: u32 = 64;

/// 消费者配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// 连续多少个欠载且写指针不动的活动周期后判定生产者失效，0 表示不检测
    pub stale_after_cycles: u32,
    /// 每次（重新）连接后丢弃积压的旧数据
    pub discard_backlog_on_connect: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stale_after_cycles: DEFAULT_STALE_AFTER_CYCLES,
            discard_backlog_on_connect: false,
        }
    }
}

/// 单个周期的结果
///
/// 除 `Delivered` 外，输出缓冲区都已被填满静音
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 读到完整的一个周期
    Delivered,
    /// 数据不足
    Underrun,
    /// 生产者未活动
    Inactive,
    /// 共享内存段不可用
    Disconnected,
    /// 生产者失效，已断开
    Stale,
    /// 回调重入，本次未访问缓冲区
    Busy,
}

impl CycleOutcome {
    #[inline]
    pub fn is_silent(&self) -> bool {
        !matches!(self, CycleOutcome::Delivered)
    }
}

/// 写指针活性跟踪
///
/// 只有欠载周期才计入“冻结”：读到数据说明生产者留下的缓冲还在消耗，
/// 与它是否还活着无关。
#[derive(Debug)]
struct LivenessTracker {
    last_write_index: Option<u64>,
    frozen_cycles: u32,
    /// 上一次判定失效时的写指针，跨重连保留
    stale_index: Option<u64>,
    /// 在该位置再次判定失效所需的阈值倍数
    backoff: u32,
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self {
            last_write_index: None,
            frozen_cycles: 0,
            stale_index: None,
            backoff: 1,
        }
    }
}

impl LivenessTracker {
    /// 重新建立基准（重连后），保留失效记录
    fn reset(&mut self) {
        self.last_write_index = None;
        self.frozen_cycles = 0;
    }

    /// 完全清空（生产者明确停止时）
    fn clear(&mut self) {
        *self = Self::default();
    }

    /// 本周期读到了数据
    #[inline]
    fn on_delivered(&mut self, write_index: u64) {
        self.track(write_index);
        self.frozen_cycles = 0;
    }

    /// 本周期欠载，返回是否判定失效
    #[inline]
    fn on_underrun(&mut self, write_index: u64, threshold: u32) -> bool {
        if self.track(write_index) {
            return false;
        }

        self.frozen_cycles = self.frozen_cycles.saturating_add(1);
        if threshold == 0 || self.frozen_cycles < threshold.saturating_mul(self.backoff) {
            return false;
        }

        self.stale_index = Some(write_index);
        self.backoff = (self.backoff * 2).min(MAX_STALE_BACKOFF);
        self.frozen_cycles = 0;
        true
    }

    /// 记录写指针，返回它是否移动过（或是第一次观察）
    #[inline]
    fn track(&mut self, write_index: u64) -> bool {
        if self.last_write_index == Some(write_index) {
            return false;
        }

        self.last_write_index = Some(write_index);
        self.frozen_cycles = 0;
        if self.stale_index.is_some_and(|stale| stale != write_index) {
            self.stale_index = None;
            self.backoff = 1;
        }
        true
    }
}

/// 消费者
pub struct ConsumerRole<C: Connector = ConnectionManager> {
    connector: C,
    config: ConsumerConfig,
    liveness: LivenessTracker,
    stats: Arc<ConsumerStats>,
}

impl ConsumerRole<ConnectionManager> {
    /// 打开命名段（不存在时保持未连接，回调中自动重试）
    pub fn connect(name: SegmentName, layout: RingLayout, config: ConsumerConfig) -> Self {
        Self::new(ConnectionManager::new(name, layout), config)
    }
}

impl<C: Connector> ConsumerRole<C> {
    pub fn new(connector: C, config: ConsumerConfig) -> Self {
        let mut consumer = Self {
            connector,
            config,
            liveness: LivenessTracker::default(),
            stats: Arc::new(ConsumerStats::new()),
        };
        if let Some(region) = consumer.connector.region() {
            on_connected(region, &consumer.config, &mut consumer.liveness);
        }
        consumer
    }

    /// 填满一个周期的输出
    ///
    /// `output` 是交织的 f32，长度应为声道数的整数倍。
    /// 不阻塞、不分配；任何情况下 `output` 都会被完整写入。
    pub fn render(&mut self, output: &mut [f32]) -> CycleOutcome {
        if !self.connector.is_connected() && self.connector.try_reconnect() {
            self.stats.record_reconnect();
            if let Some(region) = self.connector.region() {
                on_connected(region, &self.config, &mut self.liveness);
            }
        }

        let outcome = match self.connector.region() {
            None => {
                self.stats.on_callback(None);
                output.fill(0.0);
                CycleOutcome::Disconnected
            }
            Some(region) => {
                let ring = region.ring();
                self.stats.on_callback(Some(ring.available_to_read()));

                if !ring.is_active() {
                    // 停止期间写指针本来就不动
                    self.liveness.clear();
                    output.fill(0.0);
                    CycleOutcome::Inactive
                } else {
                    match ring.read(output) {
                        Ok(()) => {
                            self.liveness.on_delivered(ring.write_index());
                            self.stats
                                .record_delivered((output.len() / ring.channels()) as u64);
                            CycleOutcome::Delivered
                        }
                        // read 已经把 output 填成静音
                        Err(RingError::Underrun { .. }) => {
                            if self
                                .liveness
                                .on_underrun(ring.write_index(), self.config.stale_after_cycles)
                            {
                                CycleOutcome::Stale
                            } else {
                                CycleOutcome::Underrun
                            }
                        }
                        Err(RingError::PartialFrame { .. })
                        | Err(RingError::CapacityExceeded { .. }) => CycleOutcome::Underrun,
                    }
                }
            }
        };

        match outcome {
            CycleOutcome::Underrun => self.stats.record_underrun(),
            CycleOutcome::Inactive => self.stats.record_inactive(),
            CycleOutcome::Disconnected => self.stats.record_disconnected(),
            CycleOutcome::Stale => {
                self.stats.record_stale();
                self.connector.disconnect();
            }
            CycleOutcome::Delivered | CycleOutcome::Busy => {}
        }

        outcome
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    /// 统计（可交给监控线程）
    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }
}

/// 连接建立后的初始化
#[inline]
fn on_connected<R: SharedRegion>(region: &R, config: &ConsumerConfig, liveness: &mut LivenessTracker) {
    liveness.reset();
    if config.discard_backlog_on_connect {
        region.ring().discard_backlog();
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::audio::producer::{ProducerConfig, ProducerRole};
    use crate::shm::test_support::ScopedName;
    use crate::shm::HeapRegion;

    const LAYOUT: RingLayout = RingLayout {
        capacity_frames: 64,
        channels: 2,
        sample_rate: 48000,
    };

    /// 同一块堆区域的共享句柄
    struct SharedHeap(Arc<HeapRegion>);

    unsafe impl SharedRegion for SharedHeap {
        fn base(&self) -> NonNull<u8> {
            self.0.base()
        }

        fn layout(&self) -> RingLayout {
            self.0.layout()
        }
    }

    /// 测试用连接器：`source` 为 Some 时下一次重连成功
    #[derive(Default)]
    struct FakeConnector {
        source: Option<Arc<HeapRegion>>,
        current: Option<SharedHeap>,
        attempts: u32,
    }

    impl Connector for FakeConnector {
        type Region = SharedHeap;

        fn try_reconnect(&mut self) -> bool {
            if self.current.is_some() {
                return true;
            }
            self.attempts += 1;
            self.current = self.source.as_ref().map(|r| SharedHeap(r.clone()));
            self.current.is_some()
        }

        fn region(&self) -> Option<&SharedHeap> {
            self.current.as_ref()
        }

        fn disconnect(&mut self) {
            self.current = None;
        }
    }

    fn connected(config: ConsumerConfig) -> (Arc<HeapRegion>, ConsumerRole<FakeConnector>) {
        let region = Arc::new(HeapRegion::new(LAYOUT).unwrap());
        let connector = FakeConnector {
            source: Some(region.clone()),
            ..Default::default()
        };
        (region, ConsumerRole::new(connector, config))
    }

    fn frames(values: &[f32]) -> Vec<f32> {
        values.iter().flat_map(|&v| [v, v]).collect()
    }

    #[test]
    fn test_inactive_producer_yields_silence() {
        let (region, mut consumer) = connected(ConsumerConfig::default());
        region.ring().write(&frames(&[1.0; 8])).unwrap();

        let mut out = [9.0f32; 8];
        assert_eq!(consumer.render(&mut out), CycleOutcome::Inactive);
        assert_eq!(out, [0.0; 8]);
        // 数据原样保留
        assert_eq!(region.ring().available_to_read(), 8);
        assert_eq!(consumer.stats().inactive_cycles(), 1);
    }

    #[test]
    fn test_delivered_and_underrun() {
        let (region, mut consumer) = connected(ConsumerConfig::default());
        let ring = region.ring();
        ring.set_active(true);
        ring.write(&frames(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])).unwrap();

        let mut out = [0.0f32; 8];
        assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
        assert_eq!(out, [1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);

        let read_before = ring.read_index();
        let mut out = [9.0f32; 8];
        assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(ring.read_index(), read_before);

        assert_eq!(consumer.stats().frames_delivered(), 4);
        assert_eq!(consumer.stats().underrun_count(), 1);
        assert_eq!(consumer.stats().callback_count(), 2);
    }

    #[test]
    fn test_reconnects_when_region_appears() {
        let mut consumer = ConsumerRole::new(FakeConnector::default(), ConsumerConfig::default());
        assert!(!consumer.is_connected());

        let mut out = [9.0f32; 4];
        for _ in 0..3 {
            assert_eq!(consumer.render(&mut out), CycleOutcome::Disconnected);
            assert_eq!(out, [0.0; 4]);
        }
        assert_eq!(consumer.connector().attempts, 3);

        let region = Arc::new(HeapRegion::new(LAYOUT).unwrap());
        region.ring().set_active(true);
        region.ring().write(&frames(&[0.5, 0.5])).unwrap();
        consumer.connector_mut().source = Some(region.clone());

        assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
        assert_eq!(out, [0.5; 4]);
        assert_eq!(consumer.stats().reconnects(), 1);
        assert_eq!(consumer.stats().disconnected_cycles(), 3);

        // 已连接后不再尝试
        consumer.render(&mut out);
        assert_eq!(consumer.connector().attempts, 4);
    }

    #[test]
    fn test_stale_producer_is_dropped_and_recovers() {
        let config = ConsumerConfig {
            stale_after_cycles: 4,
            discard_backlog_on_connect: false,
        };
        let (region, mut consumer) = connected(config);
        let ring = region.ring();
        ring.set_active(true);
        ring.write(&frames(&[1.0; 32])).unwrap();

        // 缓冲中的数据照常读完
        let mut out = [0.0f32; 16];
        for _ in 0..4 {
            assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
        }

        // 之后写指针不动且欠载，第 4 个欠载周期判定失效
        for _ in 0..3 {
            assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        }
        let mut out = [9.0f32; 16];
        assert_eq!(consumer.render(&mut out), CycleOutcome::Stale);
        assert_eq!(out, [0.0; 16]);
        assert!(!consumer.is_connected());
        assert_eq!(consumer.stats().stale_events(), 1);

        // 下一周期重新连接，基准重置
        assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        assert!(consumer.is_connected());
        assert_eq!(consumer.stats().reconnects(), 2);

        // 生产者恢复写入
        for i in 0..10 {
            ring.write(&frames(&[i as f32; 8])).unwrap();
            assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
            assert_eq!(out[0], i as f32);
        }
        assert_eq!(consumer.stats().stale_events(), 1);
    }

    #[test]
    fn test_large_write_drained_by_small_callbacks() {
        let layout = RingLayout::new(4096, 2, 48000);
        let region = Arc::new(HeapRegion::new(layout).unwrap());
        let connector = FakeConnector {
            source: Some(region.clone()),
            ..Default::default()
        };
        let mut consumer = ConsumerRole::new(connector, ConsumerConfig::default());

        let ring = region.ring();
        ring.set_active(true);
        ring.write(&vec![0.5f32; 4096 * 2]).unwrap();

        // 一次写入供 128 个回调消耗，远超失效阈值，期间不能误判
        let mut out = [0.0f32; 32 * 2];
        for callback in 0..128 {
            assert_eq!(
                consumer.render(&mut out),
                CycleOutcome::Delivered,
                "callback {} with {} frames buffered",
                callback,
                ring.available_to_read()
            );
            assert_eq!(out, [0.5; 64]);
        }
        assert_eq!(ring.available_to_read(), 0);
        assert_eq!(consumer.stats().stale_events(), 0);

        // 数据耗尽后才开始计数
        for _ in 0..DEFAULT_STALE_AFTER_CYCLES - 1 {
            assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        }
        assert_eq!(consumer.render(&mut out), CycleOutcome::Stale);
    }

    #[test]
    fn test_dead_producer_reopened_with_backoff() {
        let config = ConsumerConfig {
            stale_after_cycles: 4,
            discard_backlog_on_connect: false,
        };
        let (region, mut consumer) = connected(config);
        let ring = region.ring();
        ring.set_active(true);
        ring.write(&frames(&[1.0; 4])).unwrap();

        let mut out = [0.0f32; 8];
        assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);

        // 每次判定失效前经历的欠载周期数：4、8、16
        for expected in [4u32, 8, 16] {
            let mut underruns = 0;
            loop {
                match consumer.render(&mut out) {
                    CycleOutcome::Underrun => underruns += 1,
                    CycleOutcome::Stale => break,
                    other => panic!("unexpected outcome {:?}", other),
                }
            }
            // 重连后的第一个周期只建立基准
            let baseline = if expected == 4 { 0 } else { 1 };
            assert_eq!(underruns, expected - 1 + baseline);
        }
        assert_eq!(consumer.stats().stale_events(), 3);

        // 写指针一旦移动，间隔恢复
        assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        ring.write(&frames(&[2.0; 4])).unwrap();
        assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
        for _ in 0..3 {
            assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        }
        assert_eq!(consumer.render(&mut out), CycleOutcome::Stale);
        assert_eq!(consumer.stats().stale_events(), 4);
    }

    #[test]
    fn test_stale_detection_disabled() {
        let config = ConsumerConfig {
            stale_after_cycles: 0,
            discard_backlog_on_connect: false,
        };
        let (region, mut consumer) = connected(config);
        region.ring().set_active(true);

        let mut out = [0.0f32; 4];
        for _ in 0..200 {
            assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        }
        assert!(consumer.is_connected());
        assert_eq!(consumer.stats().stale_events(), 0);
    }

    #[test]
    fn test_inactive_cycles_do_not_count_as_frozen() {
        let config = ConsumerConfig {
            stale_after_cycles: 2,
            discard_backlog_on_connect: false,
        };
        let (region, mut consumer) = connected(config);
        let ring = region.ring();

        let mut out = [0.0f32; 4];
        for _ in 0..10 {
            assert_eq!(consumer.render(&mut out), CycleOutcome::Inactive);
        }

        ring.set_active(true);
        ring.write(&frames(&[1.0; 4])).unwrap();
        assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
    }

    #[test]
    fn test_backlog_discarded_on_connect() {
        let config = ConsumerConfig {
            stale_after_cycles: 0,
            discard_backlog_on_connect: true,
        };
        let region = Arc::new(HeapRegion::new(LAYOUT).unwrap());
        let ring = region.ring();
        ring.set_active(true);
        ring.write(&frames(&[1.0; 48])).unwrap();

        let mut consumer = ConsumerRole::new(FakeConnector::default(), config);
        consumer.connector_mut().source = Some(region.clone());

        let mut out = [0.0f32; 8];
        assert_eq!(consumer.render(&mut out), CycleOutcome::Underrun);
        assert_eq!(ring.available_to_read(), 0);

        ring.write(&frames(&[2.0; 4])).unwrap();
        assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
        assert_eq!(out, [2.0; 8]);
    }

    #[test]
    fn test_consumer_over_shared_memory() {
        let name = ScopedName::new("cons");
        let mut consumer =
            ConsumerRole::connect((*name).clone(), LAYOUT, ConsumerConfig::default());

        let mut out = [9.0f32; 8];
        assert_eq!(consumer.render(&mut out), CycleOutcome::Disconnected);

        let mut producer = ProducerRole::create(&ProducerConfig {
            segment_name: (*name).clone(),
            layout: LAYOUT,
            lock_memory: false,
        })
        .unwrap();
        producer.push(&frames(&[0.25; 4])).unwrap();

        assert_eq!(consumer.render(&mut out), CycleOutcome::Delivered);
        assert_eq!(out, [0.25; 8]);

        producer.stop();
        assert_eq!(consumer.render(&mut out), CycleOutcome::Inactive);
        assert_eq!(out, [0.0; 8]);
    }
}
