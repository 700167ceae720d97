//! 传输统计
//!
//! 在实时回调中收集统计信息，全部是 lock-free 的原子计数，
//! 定时/水位采样采用降频策略减少开销

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::timing::{now_ticks, ticks_to_ns};

/// 统计采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 采样缓冲区大小
const HISTORY_SIZE: usize = 256;

/// 消费者统计收集器
///
/// 只有回调线程写入，监控线程随时读取
pub struct ConsumerStats {
    // 回调线程每周期都写，独占 cache line，避免与监控线程的读取 false sharing
    callback_count: CachePadded<AtomicU64>,
    frames_delivered: CachePadded<AtomicU64>,

    last_sampled_ticks: AtomicU64,

    // 回调间隔（单位：ticks，后处理时转换）
    interval_buffer: Box<[AtomicU64; HISTORY_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 可读帧数水位（也降频采样）
    water_level_buffer: Box<[AtomicU64; HISTORY_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_count: AtomicU64,
    inactive_cycles: AtomicU64,
    disconnected_cycles: AtomicU64,
    contended_cycles: AtomicU64,
    stale_events: AtomicU64,
    reconnects: AtomicU64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self {
            callback_count: CachePadded::new(AtomicU64::new(0)),
            frames_delivered: CachePadded::new(AtomicU64::new(0)),
            last_sampled_ticks: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            inactive_cycles: AtomicU64::new(0),
            disconnected_cycles: AtomicU64::new(0),
            contended_cycles: AtomicU64::new(0),
            stale_events: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// 每次回调开始时调用
    ///
    /// `water_level`: 当前可读帧数，未连接时为 None。
    /// 只在采样点才读时钟并记录水位
    #[inline]
    pub fn on_callback(&self, water_level: Option<u64>) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let now = now_ticks();
            let last = self.last_sampled_ticks.swap(now, Ordering::Relaxed);

            if last > 0 {
                let interval = now.saturating_sub(last);
                let idx =
                    self.interval_write_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
                self.interval_buffer[idx].store(interval, Ordering::Relaxed);
            }

            if let Some(level) = water_level {
                let idx =
                    self.water_level_write_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
                self.water_level_buffer[idx].store(level, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn record_delivered(&self, frames: u64) {
        self.frames_delivered.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inactive(&self) {
        self.inactive_cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disconnected(&self) {
        self.disconnected_cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_contended(&self) {
        self.contended_cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale(&self) {
        self.stale_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn inactive_cycles(&self) -> u64 {
        self.inactive_cycles.load(Ordering::Relaxed)
    }

    pub fn disconnected_cycles(&self) -> u64 {
        self.disconnected_cycles.load(Ordering::Relaxed)
    }

    pub fn contended_cycles(&self) -> u64 {
        self.contended_cycles.load(Ordering::Relaxed)
    }

    pub fn stale_events(&self) -> u64 {
        self.stale_events.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, frames_per_callback: u32, sample_rate: u32) -> ConsumerReport {
        let expected_interval_ns = if sample_rate > 0 {
            frames_per_callback as u64 * 1_000_000_000 / sample_rate as u64
        } else {
            0
        };

        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&ticks| ticks > 0)
            .map(ticks_to_ns)
            .collect();

        let samples_taken = self.water_level_write_idx.load(Ordering::Relaxed).min(HISTORY_SIZE);
        let water_levels: Vec<u64> = self.water_level_buffer[..samples_taken]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect();

        let interval_stats = IntervalStats {
            min_ns: intervals_ns.iter().min().copied().unwrap_or(0),
            max_ns: intervals_ns.iter().max().copied().unwrap_or(0),
            avg_ns: if intervals_ns.is_empty() {
                0
            } else {
                intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64
            },
        };

        let water_stats = WaterLevelStats {
            min: water_levels.iter().min().copied().unwrap_or(0),
            max: water_levels.iter().max().copied().unwrap_or(0),
        };

        ConsumerReport {
            callback_count: self.callback_count(),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns: expected_interval_ns * SAMPLE_INTERVAL,
            interval_stats,
            water_stats,
            frames_delivered: self.frames_delivered(),
            underrun_count: self.underrun_count(),
            inactive_cycles: self.inactive_cycles(),
            disconnected_cycles: self.disconnected_cycles(),
            contended_cycles: self.contended_cycles(),
            stale_events: self.stale_events(),
            reconnects: self.reconnects(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.frames_delivered.store(0, Ordering::Relaxed);
        self.last_sampled_ticks.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.inactive_cycles.store(0, Ordering::Relaxed);
        self.disconnected_cycles.store(0, Ordering::Relaxed);
        self.contended_cycles.store(0, Ordering::Relaxed);
        self.stale_events.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);

        for i in 0..HISTORY_SIZE {
            self.interval_buffer[i].store(0, Ordering::Relaxed);
            self.water_level_buffer[i].store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ConsumerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 消费者统计报告
#[derive(Debug)]
pub struct ConsumerReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub water_stats: WaterLevelStats,
    pub frames_delivered: u64,
    pub underrun_count: u64,
    pub inactive_cycles: u64,
    pub disconnected_cycles: u64,
    pub contended_cycles: u64,
    pub stale_events: u64,
    pub reconnects: u64,
}

#[derive(Debug)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

#[derive(Debug)]
pub struct WaterLevelStats {
    pub min: u64,
    pub max: u64,
}

impl fmt::Display for ConsumerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Consumer Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(f, "Frames delivered: {}", self.frames_delivered)?;
        writeln!(f)?;

        writeln!(f, "Callback Timing (per {} callbacks):", self.sample_interval)?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            self.expected_sampled_interval_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "  Measured: min {:.2} ms / max {:.2} ms / avg {:.2} ms",
            self.interval_stats.min_ns as f64 / 1_000_000.0,
            self.interval_stats.max_ns as f64 / 1_000_000.0,
            self.interval_stats.avg_ns as f64 / 1_000_000.0
        )?;
        writeln!(f)?;

        writeln!(f, "Ring Buffer Water Level:")?;
        writeln!(f, "  Min: {} frames", self.water_stats.min)?;
        writeln!(f, "  Max: {} frames", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Silent (producer inactive): {}", self.inactive_cycles)?;
        writeln!(f, "Silent (disconnected): {}", self.disconnected_cycles)?;
        writeln!(f, "Silent (contended): {}", self.contended_cycles)?;
        writeln!(f, "Stale producer events: {}", self.stale_events)?;
        writeln!(f, "Reconnects: {}", self.reconnects)?;

        Ok(())
    }
}

/// 生产者统计
#[derive(Default)]
pub struct ProducerStats {
    chunks_written: AtomicU64,
    frames_written: AtomicU64,
    chunks_dropped: AtomicU64,
    frames_dropped: AtomicU64,
}

impl ProducerStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_written(&self, frames: u64) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self, frames: u64) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
        self.frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> ProducerReport {
        ProducerReport {
            chunks_written: self.chunks_written(),
            frames_written: self.frames_written(),
            chunks_dropped: self.chunks_dropped(),
            frames_dropped: self.frames_dropped(),
        }
    }
}

/// 生产者统计报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerReport {
    pub chunks_written: u64,
    pub frames_written: u64,
    pub chunks_dropped: u64,
    pub frames_dropped: u64,
}

impl fmt::Display for ProducerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Producer Statistics")?;
        writeln!(f, "===================")?;
        writeln!(
            f,
            "Written: {} chunks / {} frames",
            self.chunks_written, self.frames_written
        )?;
        writeln!(
            f,
            "Dropped (ring full): {} chunks / {} frames",
            self.chunks_dropped, self.frames_dropped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_level_sampling() {
        let stats = ConsumerStats::new();
        for i in 0..(SAMPLE_INTERVAL * 3) {
            stats.on_callback(Some(100 + i));
        }

        let report = stats.report(512, 48000);
        assert_eq!(report.callback_count, SAMPLE_INTERVAL * 3);
        // 采样点是第 0、16、32 次回调
        assert_eq!(report.water_stats.min, 100);
        assert_eq!(report.water_stats.max, 100 + SAMPLE_INTERVAL * 2);
    }

    #[test]
    fn test_disconnected_callbacks_skip_water_level() {
        let stats = ConsumerStats::new();
        for _ in 0..SAMPLE_INTERVAL * 2 {
            stats.on_callback(None);
        }
        let report = stats.report(512, 48000);
        assert_eq!(report.water_stats.min, 0);
        assert_eq!(report.water_stats.max, 0);
    }

    #[test]
    fn test_counters_and_reset() {
        let stats = ConsumerStats::new();
        stats.record_delivered(512);
        stats.record_delivered(512);
        stats.record_underrun();
        stats.record_inactive();
        stats.record_stale();
        stats.record_reconnect();

        let report = stats.report(512, 48000);
        assert_eq!(report.frames_delivered, 1024);
        assert_eq!(report.underrun_count, 1);
        assert_eq!(report.inactive_cycles, 1);
        assert_eq!(report.stale_events, 1);
        assert_eq!(report.reconnects, 1);
        assert_eq!(report.expected_sampled_interval_ns, 512 * 1_000_000_000 / 48000 * 16);

        stats.reset();
        assert_eq!(stats.frames_delivered(), 0);
        assert_eq!(stats.underrun_count(), 0);
        assert_eq!(stats.reconnects(), 0);
    }

    #[test]
    fn test_producer_stats() {
        let stats = ProducerStats::new();
        stats.record_written(256);
        stats.record_written(256);
        stats.record_dropped(256);

        let report = stats.report();
        assert_eq!(
            report,
            ProducerReport {
                chunks_written: 2,
                frames_written: 512,
                chunks_dropped: 1,
                frames_dropped: 256,
            }
        );
    }
}
