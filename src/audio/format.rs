//! 流格式
//!
//! 共享环形缓冲区只传输交织的 32-bit float 样本，
//! 格式不做协商：两端按同一个 `RingLayout` 约定采样率和声道数。

use std::time::Duration;

use crate::shm::RingLayout;

/// 交织 f32 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * std::mem::size_of::<f32>()
    }

    /// 主机回调给出的字节数对应的整帧数
    ///
    /// 不足一帧的尾部字节不计入
    #[inline]
    pub fn frames_for_bytes(&self, bytes: usize) -> usize {
        if self.channels == 0 {
            return 0;
        }
        bytes / self.bytes_per_frame()
    }

    /// 给定帧数需要的样本数
    #[inline]
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * self.samples_per_frame()
    }

    /// 一个缓冲周期的时长
    pub fn period(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(frames as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

impl From<RingLayout> for StreamFormat {
    fn from(layout: RingLayout) -> Self {
        Self {
            sample_rate: layout.sample_rate,
            channels: layout.channels.min(u16::MAX as u32) as u16,
        }
    }
}
