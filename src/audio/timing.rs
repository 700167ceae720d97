//! 单调时钟与固定节拍
//!
//! macOS 上用 mach ticks，其他平台用 CLOCK_MONOTONIC（ticks 即纳秒）

use std::sync::OnceLock;
use std::time::Duration;

#[cfg(target_os = "macos")]
mod mach {
    #[repr(C)]
    pub struct mach_timebase_info_t {
        pub numer: u32,
        pub denom: u32,
    }

    extern "C" {
        pub fn mach_absolute_time() -> u64;
        pub fn mach_timebase_info(info: *mut mach_timebase_info_t) -> i32;
    }
}

/// Mach timebase 信息（全局缓存，只初始化一次）
static TIMEBASE: OnceLock<TimebaseInfo> = OnceLock::new();

#[derive(Clone, Copy)]
struct TimebaseInfo {
    numer: u32,
    denom: u32,
}

impl TimebaseInfo {
    #[cfg(target_os = "macos")]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| {
            let mut info = mach::mach_timebase_info_t { numer: 0, denom: 0 };
            unsafe { mach::mach_timebase_info(&mut info) };
            TimebaseInfo {
                numer: info.numer.max(1),
                denom: info.denom.max(1),
            }
        })
    }

    #[cfg(not(target_os = "macos"))]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| TimebaseInfo { numer: 1, denom: 1 })
    }
}

/// 将 ticks 转换为纳秒
///
/// Apple Silicon 上 timebase 通常是 125/3，其他平台是 1/1
#[inline]
pub fn ticks_to_ns(ticks: u64) -> u64 {
    let info = TimebaseInfo::get();
    ticks * info.numer as u64 / info.denom as u64
}

/// 获取当前时间（ticks）
#[cfg(target_os = "macos")]
#[inline]
pub fn now_ticks() -> u64 {
    unsafe { mach::mach_absolute_time() }
}

/// 获取当前时间（ticks）
///
/// clock_gettime 在 vDSO 中实现，不陷入内核，可以在回调里调用
#[cfg(not(target_os = "macos"))]
#[inline]
pub fn now_ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// 获取当前时间（纳秒）
#[inline]
pub fn now_ns() -> u64 {
    ticks_to_ns(now_ticks())
}

/// 固定节拍器
///
/// 按绝对截止时间推进，睡眠误差不会累积；
/// 落后超过一个周期时直接对齐到当前时间，不补跑。
pub struct Pacer {
    period_ns: u64,
    next_deadline_ns: u64,
}

impl Pacer {
    pub fn new(period: Duration) -> Self {
        let period_ns = period.as_nanos().max(1) as u64;
        Self {
            period_ns,
            next_deadline_ns: now_ns() + period_ns,
        }
    }

    /// 等到下一个截止时间，返回本次是否落后（没有睡眠）
    pub fn wait(&mut self) -> bool {
        let now = now_ns();
        let late = now >= self.next_deadline_ns;

        if !late {
            std::thread::sleep(Duration::from_nanos(self.next_deadline_ns - now));
        }

        if now > self.next_deadline_ns + self.period_ns {
            self.next_deadline_ns = now + self.period_ns;
        } else {
            self.next_deadline_ns += self.period_ns;
        }
        late
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now() {
        let t1 = now_ticks();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = now_ticks();
        assert!(t2 > t1, "time should advance");

        let ns1 = now_ns();
        std::thread::sleep(Duration::from_millis(10));
        let ns2 = now_ns();

        let diff = ns2 - ns1;
        assert!(diff >= 8_000_000, "expected at least 8ms, got {}ns", diff);
    }

    #[test]
    fn test_pacer_cadence() {
        let mut pacer = Pacer::new(Duration::from_millis(5));
        let start = now_ns();
        for _ in 0..4 {
            pacer.wait();
        }
        let elapsed = now_ns() - start;
        // 4 个周期至少 ~20ms
        assert!(elapsed >= 18_000_000, "pacer too fast: {}ns", elapsed);
    }

    #[test]
    fn test_pacer_does_not_catch_up() {
        let mut pacer = Pacer::new(Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(100));
        assert!(pacer.wait());
        // 对齐到当前时间后，下一次应当重新睡眠
        assert!(!pacer.wait());
    }
}
