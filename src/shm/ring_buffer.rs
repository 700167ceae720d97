//! Lock-free Single-Producer Single-Consumer Ring Buffer（共享内存视图）
//!
//! 设计目标：
//! - 零锁：生产者和消费者只通过 write_index / read_index 两个原子计数器同步
//! - 零分配：读写只在已映射的区域内拷贝
//! - 全有或全无：写满则拒绝整块，读不够则输出整块静音
//!
//! 计数器单调递增、永不回绕，槽位 = index % capacity。
//! 每个计数器只有一个写入方，因此不需要 CAS。
//!
//! `RingBuffer` 只是一个不拥有内存的视图：它不会释放映射，
//! 也不会在共享状态上运行析构。

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use super::layout::{RingLayout, SharedHeader, HEADER_SIZE};

/// 环形缓冲区操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// 剩余空间不足，整块丢弃（生产者侧）
    #[error("ring full: {requested} frames requested, {available} frames free")]
    CapacityExceeded { requested: u64, available: u64 },
    /// 可读数据不足，输出静音（消费者侧）
    #[error("underrun: {requested} frames requested, {available} frames available")]
    Underrun { requested: u64, available: u64 },
    /// 样本数不是整数帧
    #[error("{samples} samples is not a whole number of {channels}-channel frames")]
    PartialFrame { samples: usize, channels: usize },
}

/// 共享内存上的 SPSC 环形缓冲区视图
///
/// 容量和声道数取自本地已校验的 `RingLayout`，而不是每次从共享头部读取，
/// 对端进程改写元数据也不会导致越界访问。
pub struct RingBuffer<'a> {
    header: &'a SharedHeader,
    storage: NonNull<f32>,
    capacity: u64,
    channels: usize,
    layout: RingLayout,
    _region: PhantomData<&'a [UnsafeCell<f32>]>,
}

impl<'a> RingBuffer<'a> {
    /// 在一块原始内存上构造视图
    ///
    /// # Safety
    ///
    /// - `base` 指向至少 `layout.total_size()` 字节的可读写内存，8 字节对齐
    /// - 该内存在 `'a` 内保持映射，头部已初始化（全零也合法）
    /// - `layout` 已通过 `is_valid()` 校验
    pub unsafe fn from_raw(base: NonNull<u8>, layout: RingLayout) -> Self {
        debug_assert!(layout.is_valid());
        debug_assert_eq!(base.as_ptr() as usize % 8, 0);

        let header = unsafe { &*(base.as_ptr() as *const SharedHeader) };
        let storage = unsafe { NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE) as *mut f32) };

        Self {
            header,
            storage,
            capacity: layout.capacity_frames as u64,
            channels: layout.channels as usize,
            layout,
            _region: PhantomData,
        }
    }

    /// 当前可读帧数
    ///
    /// write_index 用 Acquire（看到生产者拷贝的样本），
    /// read_index 用 Relaxed（只有调用方自己会推进它）
    #[inline]
    pub fn available_to_read(&self) -> u64 {
        let write = self.header.write_index.load(Ordering::Acquire);
        let read = self.header.read_index.load(Ordering::Relaxed);
        self.used(write, read)
    }

    /// 当前可写帧数
    #[inline]
    pub fn available_to_write(&self) -> u64 {
        let write = self.header.write_index.load(Ordering::Relaxed);
        let read = self.header.read_index.load(Ordering::Acquire);
        self.capacity - self.used(write, read)
    }

    /// 已占用帧数
    ///
    /// 协议保证 0 <= write - read <= capacity。
    /// 头部来自另一个进程，这里仍然钳制一次，保证后续拷贝不越界。
    #[inline]
    fn used(&self, write: u64, read: u64) -> u64 {
        write.saturating_sub(read).min(self.capacity)
    }

    /// 写入交织样本（仅生产者调用）
    ///
    /// 空间不足时整块拒绝，不做任何修改：丢掉最新数据，保留未读历史
    #[inline]
    pub fn write(&self, samples: &[f32]) -> Result<(), RingError> {
        let frames = self.frames_in(samples.len())?;
        let available = self.available_to_write();
        if available < frames {
            return Err(RingError::CapacityExceeded {
                requested: frames,
                available,
            });
        }

        let write_pos = self.header.write_index.load(Ordering::Relaxed);
        unsafe { self.copy_in(write_pos, samples) };

        // Release：拷贝的样本先于新的 write_index 对消费者可见
        self.header
            .write_index
            .store(write_pos + frames, Ordering::Release);
        Ok(())
    }

    /// 读取交织样本（仅消费者调用）
    ///
    /// 数据不足时整个输出填零并返回 Underrun，read_index 不推进。
    /// 无论成功与否，`output` 都会被完整填满。
    #[inline]
    pub fn read(&self, output: &mut [f32]) -> Result<(), RingError> {
        let frames = match self.frames_in(output.len()) {
            Ok(frames) => frames,
            Err(e) => {
                output.fill(0.0);
                return Err(e);
            }
        };

        let available = self.available_to_read();
        if available < frames {
            output.fill(0.0);
            return Err(RingError::Underrun {
                requested: frames,
                available,
            });
        }

        let read_pos = self.header.read_index.load(Ordering::Relaxed);
        unsafe { self.copy_out(read_pos, output) };

        // Release：拷贝完成后才让生产者看到空出的槽位
        self.header
            .read_index
            .store(read_pos + frames, Ordering::Release);
        Ok(())
    }

    /// 丢弃全部未读数据（仅消费者调用）
    ///
    /// 消费者重新连上一个早已写满的缓冲区时，用它跳过积压的旧音频。
    /// 返回丢弃的帧数。
    pub fn discard_backlog(&self) -> u64 {
        let write = self.header.write_index.load(Ordering::Acquire);
        let read = self.header.read_index.load(Ordering::Relaxed);
        if write <= read {
            return 0;
        }
        self.header.read_index.store(write, Ordering::Release);
        write - read
    }

    /// 将样本数换算为帧数
    #[inline]
    fn frames_in(&self, samples: usize) -> Result<u64, RingError> {
        if samples % self.channels != 0 {
            return Err(RingError::PartialFrame {
                samples,
                channels: self.channels,
            });
        }
        Ok((samples / self.channels) as u64)
    }

    /// 拷入样本，最多分两段（环绕点前后）
    ///
    /// # Safety
    ///
    /// 调用方已确认 `samples` 的帧数不超过可写空间
    #[inline]
    unsafe fn copy_in(&self, index: u64, samples: &[f32]) {
        let frames = samples.len() / self.channels;
        let (slot, first) = self.split(index, frames);
        let dst = self.storage.as_ptr();
        let src = samples.as_ptr();

        unsafe {
            ptr::copy_nonoverlapping(src, dst.add(slot * self.channels), first * self.channels);
            if first < frames {
                ptr::copy_nonoverlapping(
                    src.add(first * self.channels),
                    dst,
                    (frames - first) * self.channels,
                );
            }
        }
    }

    /// 拷出样本，最多分两段
    ///
    /// # Safety
    ///
    /// 调用方已确认 `output` 的帧数不超过可读数据
    #[inline]
    unsafe fn copy_out(&self, index: u64, output: &mut [f32]) {
        let frames = output.len() / self.channels;
        let (slot, first) = self.split(index, frames);
        let src = self.storage.as_ptr() as *const f32;
        let dst = output.as_mut_ptr();

        unsafe {
            ptr::copy_nonoverlapping(src.add(slot * self.channels), dst, first * self.channels);
            if first < frames {
                ptr::copy_nonoverlapping(
                    src,
                    dst.add(first * self.channels),
                    (frames - first) * self.channels,
                );
            }
        }
    }

    /// 返回 (起始槽位, 环绕前的帧数)
    #[inline]
    fn split(&self, index: u64, frames: usize) -> (usize, usize) {
        let slot = (index % self.capacity) as usize;
        let until_wrap = self.capacity as usize - slot;
        (slot, frames.min(until_wrap))
    }

    /// 生产者是否活动（Acquire）
    #[inline]
    pub fn is_active(&self) -> bool {
        self.header.is_active()
    }

    /// 发布活动状态（仅生产者调用）
    #[inline]
    pub(crate) fn set_active(&self, active: bool) {
        self.header.set_active(active);
    }

    /// 当前写计数（监控用）
    #[inline]
    pub fn write_index(&self) -> u64 {
        self.header.write_index.load(Ordering::Acquire)
    }

    /// 当前读计数（监控用）
    #[inline]
    pub fn read_index(&self) -> u64 {
        self.header.read_index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity_frames(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.layout.sample_rate
    }

    #[inline]
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    /// 填充比例（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.available_to_read() as f64 / self.capacity as f64
    }
}
