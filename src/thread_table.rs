use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::marker::{MarkerExtra, MarkerTable, MarkerType};
use crate::raw_sample::RawSample;
use crate::runtime::{ObjectHandle, SignalSafeRuntime, ThreadHandle};
use crate::stack_table::{SampleTranslator, StackId, StackTable};
use crate::timestamp::TimeStamp;

use std::sync::Arc;

/// Capture offset for stacks taken inside hook callbacks: the callback runs
/// at C level, so no interpreted profiler frames are on the stack.
const HOOK_CAPTURE_OFFSET: usize = 0;

/// Colour of a wall-clock sample: on-CPU, blocked, or ready-but-waiting on
/// the GIL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    Normal = 0,
    Idle = 1,
    Stalled = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Initial,
    Started,
    Running,
    Ready,
    Suspended,
    Stopped,
}

/// Parallel vectors of time samples. Consecutive samples with identical
/// (stack, category) collapse into one entry whose weight counts the
/// occurrences; timestamps beyond the first of a run are discarded.
#[derive(Default)]
pub struct SampleList {
    pub stacks: Vec<StackId>,
    pub timestamps: Vec<TimeStamp>,
    pub categories: Vec<Category>,
    pub weights: Vec<u32>,
}

impl SampleList {
    pub fn record_sample(&mut self, stack: StackId, time: TimeStamp, category: Category) {
        if !self.is_empty()
            && *self.stacks.last().unwrap() == stack
            && *self.categories.last().unwrap() == category
        {
            // We don't compare timestamps for de-duplication
            *self.weights.last_mut().unwrap() += 1;
        } else {
            self.stacks.push(stack);
            self.timestamps.push(time);
            self.categories.push(category);
            self.weights.push(1);
        }
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

/// Allocation samples are never collapsed.
#[derive(Default)]
pub struct AllocationList {
    pub stacks: Vec<StackId>,
    pub timestamps: Vec<TimeStamp>,
    pub weights: Vec<u32>,
}

impl AllocationList {
    pub fn record(&mut self, stack: StackId, time: TimeStamp, weight: u32) {
        self.stacks.push(stack);
        self.timestamps.push(time);
        self.weights.push(weight);
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }
}

pub struct Thread {
    pub handle: ThreadHandle,
    /// OS identity, recorded only inside GVL callbacks running on the thread
    /// itself; the sampler consumes the recorded value and never derives it.
    pub pthread_id: Option<libc::pthread_t>,
    pub native_tid: Option<u64>,
    pub state: ThreadState,
    pub state_changed_at: TimeStamp,
    pub started_at: TimeStamp,
    pub stopped_at: Option<TimeStamp>,
    pub name: Option<String>,
    pub is_main: bool,
    pub is_start: bool,
    /// Last stack observed when the thread left the RUNNING state; reused
    /// for IDLE/STALLED sample attribution while the thread is off-CPU.
    pub stack_on_suspend: Option<StackId>,
    pub translator: SampleTranslator,
    pub samples: SampleList,
    pub allocations: AllocationList,
    pub markers: MarkerTable,
}

impl Thread {
    fn new(handle: ThreadHandle, state: ThreadState) -> Thread {
        let now = TimeStamp::now();
        Thread {
            handle,
            pthread_id: None,
            native_tid: None,
            state,
            state_changed_at: now,
            started_at: now,
            stopped_at: None,
            name: None,
            is_main: false,
            is_start: false,
            stack_on_suspend: None,
            translator: SampleTranslator::new(),
            samples: SampleList::default(),
            allocations: AllocationList::default(),
            markers: MarkerTable::new(),
        }
    }

    /// Apply a state transition and emit its marker side effects. STOPPED is
    /// terminal; anything after it is ignored. Duplicate SUSPENDED
    /// transitions (emitted by some runtime versions) are coalesced.
    pub(crate) fn set_state(&mut self, new_state: ThreadState) {
        if self.state == ThreadState::Stopped {
            return;
        }
        if new_state == ThreadState::Suspended && self.state == ThreadState::Suspended {
            return;
        }

        let from = self.state_changed_at;
        let now = TimeStamp::now();

        match new_state {
            ThreadState::Initial | ThreadState::Started => {}
            ThreadState::Running => {
                // If the GVL was immediately available no time was spent
                // stalled; skip the empty interval.
                if self.state == ThreadState::Ready && from != now {
                    self.markers
                        .record_interval(MarkerType::ThreadStalled, from, now);
                }
            }
            ThreadState::Ready => match self.state {
                ThreadState::Suspended => {
                    self.markers
                        .record_interval(MarkerType::ThreadSuspended, from, now);
                }
                ThreadState::Running => {
                    self.markers
                        .record_interval(MarkerType::ThreadRunning, from, now);
                }
                _ => {}
            },
            ThreadState::Suspended => {
                if matches!(self.state, ThreadState::Running | ThreadState::Started) {
                    self.markers
                        .record_interval(MarkerType::ThreadRunning, from, now);
                }
            }
            ThreadState::Stopped => {
                if matches!(self.state, ThreadState::Running | ThreadState::Started) {
                    self.markers
                        .record_interval(MarkerType::ThreadRunning, from, now);
                }
                self.markers.record(MarkerType::GvlThreadExited);
                self.stopped_at = Some(now);
                self.capture_name();
            }
        }

        self.state = new_state;
        self.state_changed_at = now;
    }

    pub(crate) fn capture_name(&mut self) {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if let Some(pthread_id) = self.pthread_id {
                let mut buf = [0 as libc::c_char; 128];
                let rc =
                    unsafe { libc::pthread_getname_np(pthread_id, buf.as_mut_ptr(), buf.len()) };
                if rc == 0 {
                    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
                    self.name = Some(name.to_string_lossy().into_owned());
                }
            }
        }
    }

    fn record_os_identity(&mut self) {
        self.pthread_id = Some(unsafe { libc::pthread_self() });
        self.native_tid = Some(native_thread_id());
    }
}

/// Map of known interpreter threads, keyed by the host's thread object.
/// Entries are created on first observation and never removed; a STOPPED
/// thread retains all its samples. One mutex covers the map and every
/// per-thread state transition; the sampler thread holds it across an entire
/// iteration so no state change can interleave mid-iteration.
pub struct ThreadTable {
    threads: Mutex<FxHashMap<ThreadHandle, Thread>>,
    stack_table: Arc<StackTable>,
}

impl ThreadTable {
    pub fn new(stack_table: Arc<StackTable>) -> ThreadTable {
        ThreadTable {
            threads: Mutex::new(FxHashMap::default()),
            stack_table,
        }
    }

    pub fn stack_table(&self) -> &Arc<StackTable> {
        &self.stack_table
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FxHashMap<ThreadHandle, Thread>> {
        self.threads.lock().unwrap()
    }

    fn entry<'a>(
        threads: &'a mut FxHashMap<ThreadHandle, Thread>,
        handle: ThreadHandle,
    ) -> &'a mut Thread {
        threads
            .entry(handle)
            .or_insert_with(|| Thread::new(handle, ThreadState::Initial))
    }

    /// Register a thread that existed before the collector started.
    pub fn seed(&self, handle: ThreadHandle) {
        let mut threads = self.lock();
        Self::entry(&mut threads, handle);
    }

    /// Thread-start hook. Idempotent with respect to already-live threads.
    pub fn started(&self, handle: ThreadHandle) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);
        thread.markers.record(MarkerType::GvlThreadStarted);
        if thread.state == ThreadState::Initial {
            thread.set_state(ThreadState::Started);
        }
    }

    /// GVL RESUMED, delivered on the transitioning thread while it holds the
    /// GVL: the one place the OS thread identity can be soundly recorded.
    pub fn resumed(&self, handle: ThreadHandle) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);
        thread.record_os_identity();
        thread.set_state(ThreadState::Running);
    }

    /// GVL READY: the thread wants the GVL back. Sample its stack here,
    /// synchronously (it is the current thread, no signal round-trip
    /// needed), so off-GVL time keeps correct attribution.
    pub fn ready(&self, handle: ThreadHandle, scanner: &dyn SignalSafeRuntime) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);
        self.capture_suspend_stack(thread, scanner);
        thread.set_state(ThreadState::Ready);
    }

    pub fn suspended(&self, handle: ThreadHandle, scanner: &dyn SignalSafeRuntime) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);
        self.capture_suspend_stack(thread, scanner);
        thread.set_state(ThreadState::Suspended);
    }

    pub fn stopped(&self, handle: ThreadHandle) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);
        thread.set_state(ThreadState::Stopped);
    }

    /// Mark the thread that started the collector.
    pub fn mark_start_thread(&self, handle: ThreadHandle) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);
        thread.is_start = true;
    }

    /// Mark the host's main interpreter thread, as reported by the host.
    pub fn mark_main_thread(&self, handle: ThreadHandle) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);
        thread.is_main = true;
    }

    pub fn fiber_switch(
        &self,
        handle: ThreadHandle,
        fiber: ObjectHandle,
        scanner: &dyn SignalSafeRuntime,
    ) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);

        let mut raw = RawSample::new();
        raw.sample(scanner, HOOK_CAPTURE_OFFSET);
        let stack = self.stack_table.stack_index(&raw).ok();
        thread.markers.record_instant(
            MarkerType::FiberSwitch,
            stack,
            Some(MarkerExtra::Fiber { fiber_id: fiber }),
        );
    }

    /// Record an allocation sample (weight = the sampling interval, so one
    /// sample stands for that many allocations).
    pub fn allocation_sample(
        &self,
        handle: ThreadHandle,
        scanner: &dyn SignalSafeRuntime,
        weight: u32,
    ) {
        let mut threads = self.lock();
        let thread = Self::entry(&mut threads, handle);

        let mut raw = RawSample::new();
        raw.sample(scanner, HOOK_CAPTURE_OFFSET);
        if raw.is_empty() {
            return;
        }
        if let Ok(stack) = self.stack_table.stack_index(&raw) {
            thread.allocations.record(stack, TimeStamp::now(), weight);
        }
    }

    /// Capture thread names while the threads are still alive (stop-time
    /// pass; exited threads captured theirs on exit).
    pub fn capture_names(&self) {
        let mut threads = self.lock();
        for thread in threads.values_mut() {
            if thread.state != ThreadState::Stopped {
                thread.capture_name();
            }
        }
    }

    // The suspend stack is interned immediately rather than through the
    // thread's translator: the prefix cache belongs to the sampler thread.
    fn capture_suspend_stack(&self, thread: &mut Thread, scanner: &dyn SignalSafeRuntime) {
        if thread.state == ThreadState::Stopped {
            return;
        }
        let mut raw = RawSample::new();
        raw.sample(scanner, HOOK_CAPTURE_OFFSET);
        if raw.is_empty() {
            return;
        }
        if let Ok(stack) = self.stack_table.stack_index(&raw) {
            thread.stack_on_suspend = Some(stack);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn native_thread_id() -> u64 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

#[cfg(target_os = "macos")]
pub fn native_thread_id() -> u64 {
    let mut tid: u64 = 0;
    unsafe {
        libc::pthread_threadid_np(libc::pthread_self(), &mut tid);
    }
    tid
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
pub fn native_thread_id() -> u64 {
    0
}
