//! Shared time base.
//!
//! Every timestamp in the hub (`logged_time`, `hub_time`, scheduler ticks) is
//! read from [`now`], which reads the machine-wide monotonic clock on every
//! call: `CLOCK_MONOTONIC` on Unix, the performance counter on Windows. No
//! process keeps an anchor or offset of its own, so the Hub and Experiment
//! processes read the same value at the same instant and a wall-clock step
//! changes neither.
//!
//! The value is seconds since an unspecified machine-wide origin (boot on most
//! systems); only differences and cross-process comparisons are meaningful.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bit pattern of the largest reading handed out so far.
static LAST: AtomicU64 = AtomicU64::new(0);

/// Handle to the machine-wide clock. Every instance reads the same source.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    pub fn new() -> Self {
        Clock
    }

    /// Current time in seconds.
    #[inline]
    pub fn now(&self) -> f64 {
        let t = raw_seconds();
        // Non-negative f64 bit patterns order like the values they encode.
        let prev = LAST.fetch_max(t.to_bits(), Ordering::AcqRel);
        f64::from_bits(prev).max(t)
    }
}

/// Current hub time in seconds.
#[inline]
pub fn now() -> f64 {
    Clock.now()
}

/// One reading of the OS monotonic source, in seconds.
#[cfg(unix)]
pub fn raw_seconds() -> f64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `clock_gettime` only writes through the valid pointer it is given.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
    } else {
        0.0
    }
}

/// One reading of the OS monotonic source, in seconds.
#[cfg(windows)]
pub fn raw_seconds() -> f64 {
    use windows_sys::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};
    let mut count: i64 = 0;
    let mut freq: i64 = 0;
    // SAFETY: both calls only write through the valid pointers they are given.
    let ok = unsafe { QueryPerformanceCounter(&mut count) != 0 && QueryPerformanceFrequency(&mut freq) != 0 };
    if ok && freq > 0 {
        count as f64 / freq as f64
    } else {
        0.0
    }
}

/// One reading of the OS monotonic source, in seconds.
#[cfg(not(any(unix, windows)))]
pub fn raw_seconds() -> f64 {
    use once_cell::sync::Lazy;
    use std::time::Instant;
    // No machine-wide source here; readings are only comparable within a process.
    static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);
    ORIGIN.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_goes_backwards() {
        let mut last = now();
        for _ in 0..10_000 {
            let t = now();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn independent_clocks_read_the_os_source() {
        let before = raw_seconds();
        let a = Clock::new().now();
        let b = Clock::new().now();
        let after = raw_seconds();
        // No per-instance offset: both readings sit inside the raw bracket.
        assert!(before <= a && a <= b && b <= after, "{} {} {} {}", before, a, b, after);
        assert!(after - before < 0.05);
    }
}
