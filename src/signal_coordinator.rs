#![deny(unsafe_op_in_unsafe_fn)]

//! The rendezvous between the sampler thread and a target thread's signal
//! handler, loosely modeled on Gecko's SigHandlerCoordinator: the sampler
//! publishes a `LiveSample`, kicks the target with SIGPROF, and waits on a
//! semaphore the handler posts once it has filled the sample buffer.

use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::raw_sample::RawSample;
use crate::runtime::SignalSafeRuntime;
use crate::semaphore::Semaphore;

const SAMPLE_SIGNAL: c_int = libc::SIGPROF;

/// Exceeding this means the handler never ran (blocked signal, dead lock in
/// the host's stack walker). Crashing beats an invisible deadlock.
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(5);

/// No interpreted profiler frames are on the sampled stack when capture
/// happens via signal delivery.
const SIGNAL_CAPTURE_OFFSET: usize = 0;

/// The sample buffer shared between the sampler thread and the signal
/// handler. The handler writes `raw` through the `UnsafeCell` between
/// `pthread_kill` and the semaphore post; the sampler only reads it after
/// the wait completes, so the two sides never access it concurrently.
pub struct LiveSample {
    raw: UnsafeCell<RawSample>,
    sem_complete: Semaphore,
}

unsafe impl Send for LiveSample {}
unsafe impl Sync for LiveSample {}

impl LiveSample {
    pub fn new() -> Box<LiveSample> {
        Box::new(LiveSample {
            raw: UnsafeCell::new(RawSample::new()),
            sem_complete: Semaphore::new(0),
        })
    }

    /// The captured sample. Only meaningful after `record_sample` returned
    /// true; never call while a rendezvous is in flight (the coordinator's
    /// blocking API makes that impossible for external callers).
    pub fn raw(&self) -> &RawSample {
        unsafe { &*self.raw.get() }
    }
}

struct SampleRequest {
    live: *const LiveSample,
    scanner: *const dyn SignalSafeRuntime,
}

// Signals cannot be given closures; the in-flight request is published
// through a process global. Guarded by RENDEZVOUS; the Release/Acquire pair
// orders the request contents before the handler reads them.
static CURRENT_REQUEST: AtomicPtr<SampleRequest> = AtomicPtr::new(ptr::null_mut());

// Serializes all sampling in the process.
static RENDEZVOUS: Mutex<()> = Mutex::new(());

// Ref-count for handler installation, so nested collectors do not clobber
// each other's handler.
static INSTALL_COUNT: Mutex<u32> = Mutex::new(0);

/// Process-singleton owner of the SIGPROF handler.
pub struct SignalCoordinator;

impl SignalCoordinator {
    pub fn install() {
        let mut count = INSTALL_COUNT.lock().unwrap();
        *count += 1;
        if *count == 1 {
            setup_signal_handler();
            log::debug!("signal handler installed");
        }
    }

    pub fn uninstall() {
        let mut count = INSTALL_COUNT.lock().unwrap();
        assert!(*count > 0, "stackscope BUG: uninstall without install");
        *count -= 1;
        if *count == 0 {
            clear_signal_handler();
            log::debug!("signal handler cleared");
        }
    }

    /// Kick `target` with the profiling signal and wait for its handler to
    /// fill `live`. Returns false when the target thread no longer exists
    /// (ESRCH); the caller transitions it to STOPPED.
    pub fn record_sample(
        live: &LiveSample,
        scanner: &dyn SignalSafeRuntime,
        target: libc::pthread_t,
    ) -> bool {
        let _guard = RENDEZVOUS.lock().unwrap();

        unsafe {
            (*live.raw.get()).clear();
        }

        let mut request = SampleRequest {
            live,
            scanner: unsafe {
                mem::transmute::<&dyn SignalSafeRuntime, &'static dyn SignalSafeRuntime>(scanner)
            } as *const dyn SignalSafeRuntime,
        };
        CURRENT_REQUEST.store(&mut request, Ordering::Release);

        let err = unsafe { libc::pthread_kill(target, SAMPLE_SIGNAL) };
        if err != 0 {
            CURRENT_REQUEST.store(ptr::null_mut(), Ordering::Release);
            if err == libc::ESRCH {
                log::debug!("target thread died before signal delivery");
                return false;
            }
            panic!("stackscope: pthread_kill failed: {}", err);
        }

        if !live.sem_complete.wait_timeout(RENDEZVOUS_TIMEOUT) {
            panic!(
                "stackscope: signal handler did not complete within {:?}",
                RENDEZVOUS_TIMEOUT
            );
        }

        CURRENT_REQUEST.store(ptr::null_mut(), Ordering::Release);
        true
    }
}

// Runs on the target thread. Reads the published request, fills the sample
// buffer, posts the semaphore. Nothing else: every call made here must be
// async-signal-safe.
extern "C" fn signal_handler(_sig: c_int, _info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    let request = CURRENT_REQUEST.load(Ordering::Acquire);
    if request.is_null() {
        // Stray signal after the rendezvous was torn down
        return;
    }

    unsafe {
        let request = &*request;
        let live = &*request.live;
        (*live.raw.get()).sample(&*request.scanner, SIGNAL_CAPTURE_OFFSET);
        live.sem_complete.post();
    }
}

fn setup_signal_handler() {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = signal_handler as usize;
    sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
    let err = unsafe { libc::sigaction(SAMPLE_SIGNAL, &sa, ptr::null_mut()) };
    if err != 0 {
        panic!(
            "stackscope: sigaction failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn clear_signal_handler() {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = libc::SIG_IGN;
    sa.sa_flags = libc::SA_RESTART;
    let err = unsafe { libc::sigaction(SAMPLE_SIGNAL, &sa, ptr::null_mut()) };
    if err != 0 {
        panic!(
            "stackscope: sigaction failed: {}",
            std::io::Error::last_os_error()
        );
    }
}
