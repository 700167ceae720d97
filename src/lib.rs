//! Shared-memory audio bridge
//!
//! 生产者进程通过 POSIX 共享内存中的 lock-free SPSC 环形缓冲区，
//! 把交织的 f32 音频交给另一个进程里的实时回调（消费者）。

pub mod audio;
pub mod driver;
pub mod shm;
