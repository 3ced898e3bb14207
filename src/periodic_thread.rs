use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::timestamp::TimeStamp;

/// Work executed on a fixed wall-clock cadence by a `PeriodicThread`.
pub trait PeriodicJob: Send + 'static {
    fn run_iteration(&self);

    fn name(&self) -> &'static str {
        "stackscope worker"
    }
}

struct Shared {
    running: Mutex<bool>,
    cv: Condvar,
}

/// Worker thread that wakes on an absolute schedule. Scheduling is
/// drift-resistant: each iteration advances the schedule by exactly one
/// interval; when an iteration overruns the schedule, the schedule resets to
/// now + interval instead of attempting catch-up bursts. The condition
/// variable doubles as the shutdown signal.
pub struct PeriodicThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicThread {
    pub fn start<J: PeriodicJob>(job: J, interval: TimeStamp) -> PeriodicThread {
        let shared = Arc::new(Shared {
            running: Mutex::new(true),
            cv: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);

        let handle = std::thread::Builder::new()
            .name(job.name().to_string())
            .spawn(move || Self::run(job, interval, thread_shared))
            .unwrap_or_else(|e| panic!("stackscope: failed to spawn worker thread: {}", e));

        PeriodicThread {
            shared,
            handle: Some(handle),
        }
    }

    fn run<J: PeriodicJob>(job: J, interval: TimeStamp, shared: Arc<Shared>) {
        upgrade_thread_priority();

        let mut next_schedule = TimeStamp::now();
        loop {
            job.run_iteration();

            let iteration_complete = TimeStamp::now();
            next_schedule += interval;
            if next_schedule < iteration_complete {
                log::trace!(
                    "sampler fell behind by {}us, resetting schedule",
                    (iteration_complete - next_schedule).microseconds()
                );
                next_schedule = iteration_complete + interval;
            }

            let mut running = shared.running.lock().unwrap();
            loop {
                if !*running {
                    return;
                }
                let now = TimeStamp::now();
                if now >= next_schedule {
                    break;
                }
                let (guard, _) = shared
                    .cv
                    .wait_timeout(running, (next_schedule - now).as_duration())
                    .unwrap();
                running = guard;
            }
            if !*running {
                return;
            }
        }
    }

    /// Request shutdown and join. The worker always completes its current
    /// iteration first. Idempotent.
    pub fn stop(&mut self) {
        {
            let mut running = self.shared.running.lock().unwrap();
            if !*running {
                return;
            }
            *running = false;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Raise the sampler thread's scheduling priority where the OS permits.
/// Running at normal priority risks the sampler being starved by the very
/// threads it measures. EPERM is expected for unprivileged processes.
#[cfg(target_os = "linux")]
fn upgrade_thread_priority() {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    let err = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, -10) };
    if err != 0 {
        log::trace!(
            "setpriority failed (continuing at normal priority): {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn upgrade_thread_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct CountingJob {
        count: Arc<AtomicUsize>,
    }

    impl PeriodicJob for CountingJob {
        fn run_iteration(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_runs_on_cadence_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut thread = PeriodicThread::start(
            CountingJob {
                count: Arc::clone(&count),
            },
            TimeStamp::from_milliseconds(5),
        );

        std::thread::sleep(Duration::from_millis(60));
        thread.stop();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected several iterations, got {}", after_stop);

        // No further iterations after stop
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut thread = PeriodicThread::start(
            CountingJob {
                count: Arc::clone(&count),
            },
            TimeStamp::from_milliseconds(5),
        );
        thread.stop();
        thread.stop();
    }

    struct StallingJob {
        timestamps: Arc<Mutex<Vec<TimeStamp>>>,
        stalled: AtomicUsize,
    }

    impl PeriodicJob for StallingJob {
        fn run_iteration(&self) {
            self.timestamps.lock().unwrap().push(TimeStamp::now());
            if self.stalled.fetch_add(1, Ordering::SeqCst) == 0 {
                // Overrun the schedule by 3x the interval
                std::thread::sleep(Duration::from_millis(30));
            }
        }
    }

    #[test]
    fn test_drop_behind_resets_schedule_without_bursts() {
        let timestamps = Arc::new(Mutex::new(Vec::new()));
        let mut thread = PeriodicThread::start(
            StallingJob {
                timestamps: Arc::clone(&timestamps),
                stalled: AtomicUsize::new(0),
            },
            TimeStamp::from_milliseconds(10),
        );

        std::thread::sleep(Duration::from_millis(100));
        thread.stop();

        let timestamps = timestamps.lock().unwrap();
        assert!(timestamps.len() >= 3);
        // Missed ticks are dropped: no two iterations closer than roughly an
        // interval, even right after the stall.
        for pair in timestamps.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= TimeStamp::from_milliseconds(8),
                "iterations {}us apart, catch-up burst suspected",
                gap.microseconds()
            );
        }
    }
}
