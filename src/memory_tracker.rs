//! Process RSS sampling on a periodic worker.

use std::sync::{Arc, Mutex};

use crate::periodic_thread::{PeriodicJob, PeriodicThread};
use crate::timestamp::TimeStamp;

/// Resident set size in bytes, or 0 when it cannot be determined.
/// Not signal-safe.
#[cfg(target_os = "linux")]
pub fn rss_bytes() -> u64 {
    // statm reports pages: size resident shared text lib data dt
    let statm = match std::fs::read_to_string("/proc/self/statm") {
        Ok(statm) => statm,
        Err(e) => {
            log::warn!("failed to read /proc/self/statm: {}", e);
            return 0;
        }
    };
    let resident_pages: u64 = match statm.split_whitespace().nth(1).and_then(|f| f.parse().ok()) {
        Some(pages) => pages,
        None => return 0,
    };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    resident_pages * page_size
}

#[cfg(target_os = "macos")]
pub fn rss_bytes() -> u64 {
    let mut info: libc::proc_taskinfo = unsafe { std::mem::zeroed() };
    let size = std::mem::size_of::<libc::proc_taskinfo>() as libc::c_int;
    let ret = unsafe {
        libc::proc_pidinfo(
            libc::getpid(),
            libc::PROC_PIDTASKINFO,
            0,
            &mut info as *mut _ as *mut libc::c_void,
            size,
        )
    };
    if ret != size {
        log::warn!("proc_pidinfo failed");
        return 0;
    }
    info.pti_resident_size
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn rss_bytes() -> u64 {
    0
}

#[derive(Default)]
pub struct MemorySamples {
    pub timestamps: Vec<TimeStamp>,
    pub rss: Vec<u64>,
}

struct MemoryTrackerJob {
    samples: Arc<Mutex<MemorySamples>>,
}

impl PeriodicJob for MemoryTrackerJob {
    fn run_iteration(&self) {
        let rss = rss_bytes();
        let mut samples = self.samples.lock().unwrap();
        samples.timestamps.push(TimeStamp::now());
        samples.rss.push(rss);
    }

    fn name(&self) -> &'static str {
        "stackscope memory"
    }
}

/// Samples process RSS at a configurable cadence.
pub struct MemoryTracker {
    samples: Arc<Mutex<MemorySamples>>,
    thread: Mutex<Option<PeriodicThread>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        MemoryTracker {
            samples: Arc::new(Mutex::new(MemorySamples::default())),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self, interval: TimeStamp) {
        let job = MemoryTrackerJob {
            samples: Arc::clone(&self.samples),
        };
        *self.thread.lock().unwrap() = Some(PeriodicThread::start(job, interval));
    }

    pub fn stop(&self) {
        if let Some(mut thread) = self.thread.lock().unwrap().take() {
            thread.stop();
        }
    }

    pub fn take_samples(&self) -> MemorySamples {
        std::mem::take(&mut *self.samples.lock().unwrap())
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}
