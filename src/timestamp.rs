use std::mem;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

/// A nanosecond timestamp. Values produced by `now()` are on the monotonic
/// clock; `now_realtime()` is only for interfacing with realtime-based OS
/// primitives (e.g. `sem_timedwait`). The two must not be mixed in
/// arithmetic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp {
    value_ns: u64,
}

impl TimeStamp {
    pub fn now() -> Self {
        Self::clock_gettime(libc::CLOCK_MONOTONIC)
    }

    pub fn now_realtime() -> Self {
        Self::clock_gettime(libc::CLOCK_REALTIME)
    }

    fn clock_gettime(clock: libc::clockid_t) -> Self {
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        unsafe {
            libc::clock_gettime(clock, &mut ts);
        }
        TimeStamp {
            value_ns: ts.tv_sec as u64 * NANOSECONDS_PER_SECOND + ts.tv_nsec as u64,
        }
    }

    pub const fn zero() -> Self {
        TimeStamp { value_ns: 0 }
    }

    pub const fn from_seconds(s: u64) -> Self {
        Self::from_nanoseconds(s * NANOSECONDS_PER_SECOND)
    }

    pub const fn from_milliseconds(ms: u64) -> Self {
        Self::from_nanoseconds(ms * 1_000_000)
    }

    pub const fn from_microseconds(us: u64) -> Self {
        Self::from_nanoseconds(us * 1_000)
    }

    pub const fn from_nanoseconds(ns: u64) -> Self {
        TimeStamp { value_ns: ns }
    }

    pub fn nanoseconds(self) -> u64 {
        self.value_ns
    }

    pub fn microseconds(self) -> u64 {
        self.value_ns / 1_000
    }

    pub fn is_zero(self) -> bool {
        self.value_ns == 0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.value_ns)
    }

    pub fn timespec(self) -> libc::timespec {
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        ts.tv_sec = (self.value_ns / NANOSECONDS_PER_SECOND) as libc::time_t;
        ts.tv_nsec = (self.value_ns % NANOSECONDS_PER_SECOND) as libc::c_long;
        ts
    }

    /// Sleep until `target` on the monotonic clock. Returns immediately if
    /// the target is already in the past.
    pub fn sleep_until(target: TimeStamp) {
        #[cfg(target_os = "linux")]
        {
            let ts = target.timespec();
            loop {
                let ret = unsafe {
                    libc::clock_nanosleep(
                        libc::CLOCK_MONOTONIC,
                        libc::TIMER_ABSTIME,
                        &ts,
                        std::ptr::null_mut(),
                    )
                };
                if ret != libc::EINTR {
                    break;
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            loop {
                let now = TimeStamp::now();
                if now >= target {
                    break;
                }
                let ts = (target - now).timespec();
                let mut remaining: libc::timespec = unsafe { mem::zeroed() };
                let ret = unsafe { libc::nanosleep(&ts, &mut remaining) };
                if ret == 0 {
                    break;
                }
            }
        }
    }
}

impl Sub for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, other: TimeStamp) -> TimeStamp {
        // Saturate on underflow
        TimeStamp {
            value_ns: self.value_ns.saturating_sub(other.value_ns),
        }
    }
}

impl SubAssign for TimeStamp {
    fn sub_assign(&mut self, other: TimeStamp) {
        *self = *self - other;
    }
}

impl Add for TimeStamp {
    type Output = TimeStamp;

    fn add(self, other: TimeStamp) -> TimeStamp {
        TimeStamp {
            value_ns: self.value_ns + other.value_ns,
        }
    }
}

impl AddAssign for TimeStamp {
    fn add_assign(&mut self, other: TimeStamp) {
        *self = *self + other;
    }
}

impl From<Duration> for TimeStamp {
    fn from(duration: Duration) -> Self {
        TimeStamp {
            value_ns: duration.as_nanos() as u64,
        }
    }
}
