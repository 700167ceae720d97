//! 宿主回调适配层
//!
//! 宿主（虚拟音频设备插件）每个 IO 周期给出一块 `(bytes, byte_count)` 输入缓冲区，
//! 这里把它换算成整帧，交给消费者填满。
//!
//! 生命周期：进程内唯一的 `Driver` 在第一次 `init` 时创建，之后一直存在，
//! 不做 teardown（插件被卸载时进程随之结束，映射由操作系统回收）。

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;

use crate::audio::{ConsumerConfig, ConsumerRole, ConsumerStats, CycleOutcome, StreamFormat};
use crate::shm::{RingLayout, SegmentError, SegmentName};

/// 驱动配置
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub segment_name: SegmentName,
    pub layout: RingLayout,
    pub consumer: ConsumerConfig,
}

/// 回调侧的消费者实例
///
/// 消费者状态放在 `UnsafeCell` 里，由 `busy` 标志保证同一时刻只有一个回调访问。
/// 标志只做一次 `compare_exchange`，不自旋：宿主若并发重入，
/// 后来者直接得到静音。
pub struct Driver {
    consumer: UnsafeCell<ConsumerRole>,
    busy: CachePadded<AtomicBool>,
    format: StreamFormat,
    stats: Arc<ConsumerStats>,
}

// consumer 只在持有 busy 标志时被访问
unsafe impl Sync for Driver {}

impl Driver {
    pub fn new(config: &DriverConfig) -> Result<Self, SegmentError> {
        if !config.layout.is_valid() {
            return Err(SegmentError::InvalidLayout(config.layout));
        }

        let consumer =
            ConsumerRole::connect(config.segment_name.clone(), config.layout, config.consumer);
        let stats = consumer.stats().clone();

        Ok(Self {
            consumer: UnsafeCell::new(consumer),
            busy: CachePadded::new(AtomicBool::new(false)),
            format: StreamFormat::from(config.layout),
            stats,
        })
    }

    /// 填满宿主的输入缓冲区
    ///
    /// **绝对禁止：** 锁、分配、阻塞 I/O
    #[inline]
    pub fn read_client_input(&self, output: &mut [f32]) -> CycleOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            output.fill(0.0);
            self.stats.record_contended();
            return CycleOutcome::Busy;
        }

        let consumer = unsafe { &mut *self.consumer.get() };
        let outcome = consumer.render(output);

        self.busy.store(false, Ordering::Release);
        outcome
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }
}

static DRIVER: OnceLock<Driver> = OnceLock::new();

/// 初始化进程内唯一的驱动实例
///
/// 重复调用返回已有实例，配置以第一次成功的调用为准
pub fn init(config: DriverConfig) -> Result<&'static Driver, SegmentError> {
    if let Some(driver) = DRIVER.get() {
        return Ok(driver);
    }

    let driver = Driver::new(&config)?;
    let driver = DRIVER.get_or_init(|| driver);
    log::info!(
        "Driver initialised for {} ({})",
        config.segment_name,
        config.layout
    );
    Ok(driver)
}

/// 已初始化的驱动实例
#[inline]
pub fn instance() -> Option<&'static Driver> {
    DRIVER.get()
}

/// 用默认配置初始化驱动（宿主加载插件时调用）
#[no_mangle]
pub extern "C" fn shm_audio_bridge_init() -> bool {
    match init(DriverConfig::default()) {
        Ok(_) => true,
        Err(e) => {
            log::error!("Failed to initialise driver: {}", e);
            false
        }
    }
}

/// 宿主 IO 回调入口
///
/// 每次调用都会写满整个缓冲区；驱动未初始化时写静音
///
/// # Safety
///
/// `bytes` 为空，或指向 `byte_count` 字节的可写内存
#[no_mangle]
pub unsafe extern "C" fn shm_audio_bridge_read_input(bytes: *mut c_void, byte_count: u32) {
    unsafe { fill_client_buffer(instance(), bytes, byte_count as usize) };
}

/// 把原始字节缓冲区换算为整帧交给驱动
///
/// 不足一帧的尾部字节、未对齐或无驱动时一律置零
unsafe fn fill_client_buffer(
    driver: Option<&Driver>,
    bytes: *mut c_void,
    byte_count: usize,
) -> Option<CycleOutcome> {
    if bytes.is_null() || byte_count == 0 {
        return None;
    }

    let aligned = bytes as usize % std::mem::align_of::<f32>() == 0;
    let driver = match driver {
        Some(driver) if aligned => driver,
        _ => {
            unsafe { std::ptr::write_bytes(bytes as *mut u8, 0, byte_count) };
            return None;
        }
    };

    let format = driver.format();
    let samples = format.samples_for_frames(format.frames_for_bytes(byte_count));
    let output = unsafe { std::slice::from_raw_parts_mut(bytes as *mut f32, samples) };
    let outcome = driver.read_client_input(output);

    let used = samples * std::mem::size_of::<f32>();
    if used < byte_count {
        unsafe { std::ptr::write_bytes((bytes as *mut u8).add(used), 0, byte_count - used) };
    }
    Some(outcome)
}
