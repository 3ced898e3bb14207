use std::time::Duration;

use crate::timestamp::TimeStamp;

/// A counting semaphore built on `sem_wait`/`sem_post`.
/// `post()` is guaranteed to be async-signal-safe, which is what makes it
/// usable as the completion signal of the sampling rendezvous. A mutex would
/// not be (non-reentrant in signal context).
#[cfg(not(target_os = "macos"))]
pub struct Semaphore {
    inner: std::cell::UnsafeCell<libc::sem_t>,
}

#[cfg(not(target_os = "macos"))]
unsafe impl Send for Semaphore {}
#[cfg(not(target_os = "macos"))]
unsafe impl Sync for Semaphore {}

#[cfg(not(target_os = "macos"))]
impl Semaphore {
    pub fn new(value: u32) -> Self {
        let mut sem = std::mem::MaybeUninit::<libc::sem_t>::uninit();
        let err = unsafe { libc::sem_init(sem.as_mut_ptr(), 0, value) };
        if err != 0 {
            panic!("stackscope: sem_init failed: {}", std::io::Error::last_os_error());
        }
        Semaphore {
            inner: std::cell::UnsafeCell::new(unsafe { sem.assume_init() }),
        }
    }

    pub fn wait(&self) {
        loop {
            let ret = unsafe { libc::sem_wait(self.inner.get()) };
            if ret == 0 {
                return;
            }
            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                panic!("stackscope: sem_wait failed: {}", std::io::Error::last_os_error());
            }
        }
    }

    /// Wait with a deadline. Returns false if the timeout elapsed without the
    /// semaphore being posted. `sem_timedwait` deadlines are on the realtime
    /// clock.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = (TimeStamp::now_realtime() + TimeStamp::from(timeout)).timespec();
        loop {
            let ret = unsafe { libc::sem_timedwait(self.inner.get(), &deadline) };
            if ret == 0 {
                return true;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return false,
                _ => panic!(
                    "stackscope: sem_timedwait failed: {}",
                    std::io::Error::last_os_error()
                ),
            }
        }
    }

    // async-signal-safe
    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.inner.get());
        }
    }
}

#[cfg(not(target_os = "macos"))]
impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.inner.get());
        }
    }
}

// macOS has no working unnamed POSIX semaphores; wrap a dispatch semaphore,
// whose signal function is async-signal-safe.
#[cfg(target_os = "macos")]
pub struct Semaphore {
    sem: dispatch::dispatch_semaphore_t,
}

#[cfg(target_os = "macos")]
unsafe impl Send for Semaphore {}
#[cfg(target_os = "macos")]
unsafe impl Sync for Semaphore {}

#[cfg(target_os = "macos")]
mod dispatch {
    use std::ffi::c_void;

    pub type dispatch_semaphore_t = *mut c_void;
    pub type dispatch_time_t = u64;

    pub const DISPATCH_TIME_NOW: dispatch_time_t = 0;
    pub const DISPATCH_TIME_FOREVER: dispatch_time_t = !0;

    extern "C" {
        pub fn dispatch_semaphore_create(value: isize) -> dispatch_semaphore_t;
        pub fn dispatch_semaphore_wait(sem: dispatch_semaphore_t, timeout: dispatch_time_t) -> isize;
        pub fn dispatch_semaphore_signal(sem: dispatch_semaphore_t) -> isize;
        pub fn dispatch_time(when: dispatch_time_t, delta: i64) -> dispatch_time_t;
        pub fn dispatch_release(object: *mut c_void);
    }
}

#[cfg(target_os = "macos")]
impl Semaphore {
    pub fn new(value: u32) -> Self {
        let sem = unsafe { dispatch::dispatch_semaphore_create(value as isize) };
        if sem.is_null() {
            panic!("stackscope: dispatch_semaphore_create failed");
        }
        Semaphore { sem }
    }

    pub fn wait(&self) {
        unsafe {
            dispatch::dispatch_semaphore_wait(self.sem, dispatch::DISPATCH_TIME_FOREVER);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = unsafe {
            dispatch::dispatch_time(dispatch::DISPATCH_TIME_NOW, timeout.as_nanos() as i64)
        };
        unsafe { dispatch::dispatch_semaphore_wait(self.sem, deadline) == 0 }
    }

    // async-signal-safe
    pub fn post(&self) {
        unsafe {
            dispatch::dispatch_semaphore_signal(self.sem);
        }
    }
}

#[cfg(target_os = "macos")]
impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            dispatch::dispatch_release(self.sem);
        }
    }
}
