//! 共享内存布局（wire format）
//!
//! 生产者和消费者必须逐字节一致，否则协议未定义：
//!
//! ```text
//! offset  size  field
//! 0       8     write_index    (AtomicU64)
//! 8       8     read_index     (AtomicU64)
//! 16      1     is_active      (AtomicBool)
//! 17      3     对齐填充
//! 20      4     sample_rate    (u32)
//! 24      4     channels       (u32)
//! 28      4     buffer_frames  (u32)
//! 32      32    保留填充
//! 64      ...   交织 f32 样本：buffer_frames * channels
//! ```
//!
//! 头部恰好 64 字节（一个 cache line），样本区从 64 字节边界开始。

use std::ffi::{CStr, CString};
use std::fmt;
use std::mem::{align_of, offset_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::segment::SegmentError;

/// 默认共享内存名称
pub const DEFAULT_SEGMENT_NAME: &str = "/micnoisegate_audio";
/// 默认环形缓冲区容量（帧）
pub const DEFAULT_CAPACITY_FRAMES: u32 = 4096;
/// 默认声道数（立体声）
pub const DEFAULT_CHANNELS: u32 = 2;
/// 默认采样率
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// 头部大小（字节）
pub const HEADER_SIZE: usize = 64;

/// macOS 的 PSHMNAMLEN 限制，其他平台也按此约束以保证可移植
pub const MAX_NAME_LEN: usize = 31;

/// 共享内存头部
///
/// 所有跨进程读写的字段都是原子类型。元数据用 `AtomicU32` 存储，
/// 与 `u32` 大小、对齐完全相同，不影响 wire format，
/// 但让消费者在生产者初始化期间映射时也不会发生数据竞争。
#[repr(C)]
pub struct SharedHeader {
    pub(crate) write_index: AtomicU64,
    pub(crate) read_index: AtomicU64,
    pub(crate) is_active: AtomicBool,
    _align: [u8; 3],
    sample_rate: AtomicU32,
    channels: AtomicU32,
    buffer_frames: AtomicU32,
    _reserved: [u8; 32],
}

const _: () = {
    assert!(size_of::<SharedHeader>() == HEADER_SIZE);
    assert!(align_of::<SharedHeader>() == 8);
    assert!(offset_of!(SharedHeader, write_index) == 0);
    assert!(offset_of!(SharedHeader, read_index) == 8);
    assert!(offset_of!(SharedHeader, is_active) == 16);
    assert!(offset_of!(SharedHeader, sample_rate) == 20);
    assert!(offset_of!(SharedHeader, channels) == 24);
    assert!(offset_of!(SharedHeader, buffer_frames) == 28);
    assert!(size_of::<AtomicU32>() == size_of::<u32>());
    assert!(size_of::<AtomicBool>() == 1);
};

impl SharedHeader {
    /// 写入元数据（创建者调用）
    ///
    /// buffer_frames 最后以 Release 写入，读取方先 Acquire 读 buffer_frames，
    /// 读到非零即可看到完整元数据。
    pub(crate) fn publish_layout(&self, layout: &RingLayout) {
        self.sample_rate.store(layout.sample_rate, Ordering::Relaxed);
        self.channels.store(layout.channels, Ordering::Relaxed);
        self.buffer_frames
            .store(layout.capacity_frames, Ordering::Release);
    }

    /// 读取头部记录的布局
    ///
    /// 返回 None 表示创建者尚未完成初始化（buffer_frames 仍为 0）
    pub fn layout(&self) -> Option<RingLayout> {
        let capacity_frames = self.buffer_frames.load(Ordering::Acquire);
        if capacity_frames == 0 {
            return None;
        }
        Some(RingLayout {
            capacity_frames,
            channels: self.channels.load(Ordering::Relaxed),
            sample_rate: self.sample_rate.load(Ordering::Relaxed),
        })
    }

    /// 生产者是否处于活动状态
    #[inline]
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// 发布活动状态（仅生产者调用）
    #[inline]
    pub(crate) fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::Release);
    }
}

/// 环形缓冲区布局
///
/// 两端在编译期/配置期约定，映射后与头部元数据逐项比对
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    /// 容量（帧）
    pub capacity_frames: u32,
    /// 声道数
    pub channels: u32,
    /// 采样率（仅描述用途，两端用于兼容性校验）
    pub sample_rate: u32,
}

impl Default for RingLayout {
    fn default() -> Self {
        Self {
            capacity_frames: DEFAULT_CAPACITY_FRAMES,
            channels: DEFAULT_CHANNELS,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl RingLayout {
    pub fn new(capacity_frames: u32, channels: u32, sample_rate: u32) -> Self {
        Self {
            capacity_frames,
            channels,
            sample_rate,
        }
    }

    /// 样本区的 f32 个数
    #[inline]
    pub fn storage_samples(&self) -> usize {
        self.capacity_frames as usize * self.channels as usize
    }

    /// 样本区字节数
    #[inline]
    pub fn storage_bytes(&self) -> usize {
        self.storage_samples() * size_of::<f32>()
    }

    /// 整个共享段的字节数
    #[inline]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.storage_bytes()
    }

    /// 容量、声道、采样率都必须非零，且总大小不溢出
    pub fn is_valid(&self) -> bool {
        self.capacity_frames > 0
            && self.channels > 0
            && self.sample_rate > 0
            && (self.capacity_frames as usize)
                .checked_mul(self.channels as usize)
                .and_then(|n| n.checked_mul(size_of::<f32>()))
                .and_then(|n| n.checked_add(HEADER_SIZE))
                .is_some()
    }
}

impl fmt::Display for RingLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames x {}ch @ {}Hz",
            self.capacity_frames, self.channels, self.sample_rate
        )
    }
}

/// 已校验的共享内存名称
///
/// 构造时完成校验并转换为 C 字符串，之后的重连路径不再分配内存
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentName(CString);

impl SegmentName {
    /// 名称必须以 '/' 开头、不含其他 '/'、不含 NUL，长度不超过 31
    pub fn new(name: &str) -> Result<Self, SegmentError> {
        let valid = name.len() > 1
            && name.len() <= MAX_NAME_LEN
            && name.starts_with('/')
            && !name[1..].contains('/');
        if !valid {
            return Err(SegmentError::InvalidName);
        }
        CString::new(name)
            .map(Self)
            .map_err(|_| SegmentError::InvalidName)
    }

    pub fn as_c_str(&self) -> &CStr {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // 构造时来自 &str，必然是合法 UTF-8
        self.0.to_str().unwrap_or_default()
    }
}

impl Default for SegmentName {
    fn default() -> Self {
        Self(CString::new(DEFAULT_SEGMENT_NAME).unwrap_or_default())
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
