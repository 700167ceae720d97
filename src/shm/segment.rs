//! POSIX 共享内存段
//!
//! 只封装核心需要的生命周期操作：
//! - 生产者：create（不存在则创建并设定大小）
//! - 消费者：open_existing（绝不创建）
//! - 显式清理：unlink
//!
//! 映射和描述符在 Drop 时释放，但段本身不会被 unlink，
//! 段的生命周期属于操作系统，不属于任何一个进程。
//!
//! open_existing 会在实时回调中被调用，因此这条路径不打日志、不分配内存。

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use super::layout::{RingLayout, SegmentName};
use super::region::SharedRegion;

/// 共享内存段错误
///
/// 不携带段名，构造时不分配内存；需要上下文时由调用方补充
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid segment name (must start with '/', contain no other '/', and be at most 31 bytes)")]
    InvalidName,
    #[error("invalid ring layout: {0}")]
    InvalidLayout(RingLayout),
    #[error("shared memory segment does not exist")]
    NotFound,
    #[error("shm_open failed: {0}")]
    Open(#[source] io::Error),
    #[error("fstat failed: {0}")]
    Stat(#[source] io::Error),
    #[error("ftruncate to {size} bytes failed: {source}")]
    Resize {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("mmap failed: {0}")]
    Map(#[source] io::Error),
    #[error("segment is {found} bytes, expected {expected}")]
    SizeMismatch { expected: usize, found: u64 },
    #[error("segment layout is {found}, expected {expected}")]
    LayoutMismatch {
        expected: RingLayout,
        found: RingLayout,
    },
    #[error("segment header has not been initialised yet")]
    Uninitialized,
    #[error("shm_unlink failed: {0}")]
    Unlink(#[source] io::Error),
}

/// 已映射的共享内存段
pub struct SharedSegment {
    base: NonNull<u8>,
    len: usize,
    layout: RingLayout,
    /// 本次调用是否新建了段
    created: bool,
    memory_locked: bool,
    // 最后 drop：先 munmap 再 close
    fd: OwnedFd,
}

// 映射可以在线程间移交；并发访问由 SPSC 协议约束
unsafe impl Send for SharedSegment {}

/// shm_open 在 macOS 上是 variadic，mode 需要按 c_uint 传递
unsafe fn shm_open(name: &CStr, oflag: libc::c_int, mode: libc::mode_t) -> libc::c_int {
    #[cfg(target_os = "macos")]
    {
        unsafe { libc::shm_open(name.as_ptr(), oflag, mode as libc::c_uint) }
    }
    #[cfg(not(target_os = "macos"))]
    {
        unsafe { libc::shm_open(name.as_ptr(), oflag, mode) }
    }
}

/// 段的当前大小
fn segment_size(fd: &OwnedFd) -> Result<u64, SegmentError> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(SegmentError::Stat(io::Error::last_os_error()));
    }
    Ok(u64::try_from(stat.st_size).unwrap_or(0))
}

/// 读写映射整个段
fn map_segment(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>, SegmentError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(SegmentError::Map(io::Error::last_os_error()));
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| SegmentError::Map(io::Error::from(io::ErrorKind::Other)))
}

impl SharedSegment {
    /// 创建（或打开已存在的）段并设定大小（生产者调用）
    ///
    /// - 新段：ftruncate 到布局大小，写入元数据
    /// - 已存在且布局一致：沿用现有计数器，write_index 保持单调，
    ///   仍连着的消费者不会看到 write < read
    /// - 已存在但布局不同：返回 SizeMismatch / LayoutMismatch，需要显式 unlink
    pub fn create(name: &SegmentName, layout: RingLayout) -> Result<Self, SegmentError> {
        if !layout.is_valid() {
            return Err(SegmentError::InvalidLayout(layout));
        }

        let raw = unsafe { shm_open(name.as_c_str(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if raw < 0 {
            return Err(SegmentError::Open(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let total = layout.total_size();
        let size = segment_size(&fd)?;
        let created = size == 0;

        if created {
            // 消费者可能运行在另一个用户下（例如系统音频服务），绕过 umask
            if unsafe { libc::fchmod(fd.as_raw_fd(), 0o666) } != 0 {
                log::warn!(
                    "Failed to chmod shared memory segment {}: {}",
                    name,
                    io::Error::last_os_error()
                );
            }
            if unsafe { libc::ftruncate(fd.as_raw_fd(), total as libc::off_t) } != 0 {
                return Err(SegmentError::Resize {
                    size: total,
                    source: io::Error::last_os_error(),
                });
            }
        } else if size != total as u64 {
            return Err(SegmentError::SizeMismatch {
                expected: total,
                found: size,
            });
        }

        let base = map_segment(&fd, total)?;
        let segment = Self {
            base,
            len: total,
            layout,
            created,
            memory_locked: false,
            fd,
        };

        match segment.header().layout() {
            None => segment.header().publish_layout(&layout),
            Some(found) if found == layout => {
                log::info!(
                    "Reusing shared memory segment {} (write={}, read={})",
                    name,
                    segment.ring().write_index(),
                    segment.ring().read_index()
                );
            }
            Some(found) => {
                return Err(SegmentError::LayoutMismatch {
                    expected: layout,
                    found,
                });
            }
        }

        if created {
            log::info!("Created shared memory segment {} ({}, {} bytes)", name, layout, total);
        }
        Ok(segment)
    }

    /// 打开已存在的段（消费者调用，绝不创建）
    ///
    /// 映射前用 fstat 检查大小，映射后校验头部元数据。
    /// 每次调用最多一次 shm_open + fstat + mmap，开销有界。
    pub fn open_existing(name: &SegmentName, layout: RingLayout) -> Result<Self, SegmentError> {
        if !layout.is_valid() {
            return Err(SegmentError::InvalidLayout(layout));
        }

        let raw = unsafe { shm_open(name.as_c_str(), libc::O_RDWR, 0) };
        if raw < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOENT) {
                SegmentError::NotFound
            } else {
                SegmentError::Open(err)
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // 生产者可能还在 ftruncate 之前：大小为 0 时绝不能映射（访问会 SIGBUS）
        let total = layout.total_size();
        let size = segment_size(&fd)?;
        if size != total as u64 {
            return Err(SegmentError::SizeMismatch {
                expected: total,
                found: size,
            });
        }

        let base = map_segment(&fd, total)?;
        let segment = Self {
            base,
            len: total,
            layout,
            created: false,
            memory_locked: false,
            fd,
        };

        match segment.header().layout() {
            Some(found) if found == layout => Ok(segment),
            Some(found) => Err(SegmentError::LayoutMismatch {
                expected: layout,
                found,
            }),
            None => Err(SegmentError::Uninitialized),
        }
    }

    /// 删除命名段（显式生命周期操作）
    ///
    /// 已映射的进程仍可继续使用旧映射，直到各自 unmap
    pub fn unlink(name: &SegmentName) -> Result<(), SegmentError> {
        if unsafe { libc::shm_unlink(name.as_c_str().as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOENT) {
                SegmentError::NotFound
            } else {
                SegmentError::Unlink(err)
            });
        }
        log::info!("Unlinked shared memory segment {}", name);
        Ok(())
    }

    /// 本次打开是否新建了段
    pub fn created(&self) -> bool {
        self.created
    }

    /// 映射长度（字节）
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 锁定映射内存，防止被换页
    ///
    /// 在实时音频场景下，page fault 会导致严重的时序抖动。
    /// 返回是否成功锁定
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let result = unsafe { libc::mlock(self.base.as_ptr() as *const libc::c_void, self.len) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Shared segment memory locked: {} bytes", self.len);
            true
        } else {
            log::warn!(
                "Failed to lock shared segment memory: {}",
                io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁映射内存
    pub fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        unsafe {
            libc::munlock(self.base.as_ptr() as *const libc::c_void, self.len);
        }

        self.memory_locked = false;
        log::debug!("Shared segment memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked
    }
}

unsafe impl SharedRegion for SharedSegment {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn layout(&self) -> RingLayout {
        self.layout
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.memory_locked {
            unsafe { libc::munlock(self.base.as_ptr() as *const libc::c_void, self.len) };
        }
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        // fd 随字段一起关闭
    }
}
