//! 承载环形缓冲区的内存区域
//!
//! - `SharedSegment`：跨进程的 POSIX 共享内存映射
//! - `HeapRegion`：进程内的堆分配区域，布局完全相同，用于同进程传输和测试

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use super::layout::{RingLayout, SharedHeader};
use super::ring_buffer::RingBuffer;
use super::segment::SegmentError;

/// 可以在其上构造 `RingBuffer` 视图的内存区域
///
/// # Safety
///
/// 实现者保证 `base()` 指向至少 `layout().total_size()` 字节、
/// 至少 8 字节对齐的可读写内存，头部已初始化，并且在 `&self` 存活期间保持有效。
/// `layout()` 必须是已校验的布局。
pub unsafe trait SharedRegion {
    fn base(&self) -> NonNull<u8>;

    fn layout(&self) -> RingLayout;

    /// 共享头部
    fn header(&self) -> &SharedHeader {
        unsafe { &*(self.base().as_ptr() as *const SharedHeader) }
    }

    /// 构造环形缓冲区视图（开销只是几次字段拷贝）
    fn ring(&self) -> RingBuffer<'_> {
        unsafe { RingBuffer::from_raw(self.base(), self.layout()) }
    }
}

/// 进程内区域的对齐（一个 cache line）
const REGION_ALIGN: usize = 64;

/// 堆分配的环形缓冲区区域
///
/// 与共享内存段布局一致，元数据在创建时写入
pub struct HeapRegion {
    base: NonNull<u8>,
    layout: RingLayout,
    alloc_layout: Layout,
}

// 所有跨线程访问都经过头部原子计数器的 SPSC 协议
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(layout: RingLayout) -> Result<Self, SegmentError> {
        if !layout.is_valid() {
            return Err(SegmentError::InvalidLayout(layout));
        }

        let alloc_layout = Layout::from_size_align(layout.total_size(), REGION_ALIGN)
            .map_err(|_| SegmentError::InvalidLayout(layout))?;

        // 全零即合法的初始头部：计数器为 0，is_active = false
        let ptr = unsafe { alloc::alloc_zeroed(alloc_layout) };
        let base = match NonNull::new(ptr) {
            Some(base) => base,
            None => alloc::handle_alloc_error(alloc_layout),
        };

        let region = Self {
            base,
            layout,
            alloc_layout,
        };
        region.header().publish_layout(&layout);
        Ok(region)
    }
}

unsafe impl SharedRegion for HeapRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn layout(&self) -> RingLayout {
        self.layout
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.alloc_layout) };
    }
}
