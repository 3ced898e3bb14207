use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::allocation_collector::AllocationCollector;
use crate::collector::Collector;
use crate::error::ProfileError;
use crate::marker::GcMarkerTable;
use crate::memory_tracker::MemoryTracker;
use crate::periodic_thread::{PeriodicJob, PeriodicThread};
use crate::runtime::{AllocEvent, FrameHandle, GvlEvent, HookHandle, HostRuntime, RuntimeEvent};
use crate::serialization::profile::ProfileData;
use crate::serialization::serializer;
use crate::session::configuration::Configuration;
use crate::signal_coordinator::{LiveSample, SignalCoordinator};
use crate::stack_table::StackTable;
use crate::thread_table::{Category, ThreadState, ThreadTable};
use crate::timestamp::TimeStamp;

/// The wall-clock profiler: a periodic sampler thread over every known
/// interpreter thread, plus hook-driven thread state tracking, GC markers,
/// and optional allocation sampling and RSS tracking.
pub struct TimeCollector {
    runtime: Arc<dyn HostRuntime>,
    configuration: Configuration,
    stack_table: Arc<StackTable>,
    threads: Arc<ThreadTable>,
    gc_markers: Arc<GcMarkerTable>,
    allocations: Option<Arc<AllocationCollector>>,
    memory: Option<MemoryTracker>,
    running: AtomicBool,
    started_at: Mutex<Option<TimeStamp>>,
    sampler: Mutex<Option<PeriodicThread>>,
    hooks: Mutex<Vec<HookHandle>>,
}

impl TimeCollector {
    pub fn new(
        runtime: Arc<dyn HostRuntime>,
        configuration: Configuration,
        stack_table: Arc<StackTable>,
    ) -> TimeCollector {
        let threads = Arc::new(ThreadTable::new(Arc::clone(&stack_table)));
        let allocations = if configuration.allocation_interval > 0 {
            Some(Arc::new(AllocationCollector::new(
                configuration.allocation_interval,
                Arc::clone(&threads),
                Arc::clone(&runtime),
            )))
        } else {
            None
        };
        let memory = configuration.memory_interval.map(|_| MemoryTracker::new());

        TimeCollector {
            runtime,
            configuration,
            stack_table,
            threads,
            gc_markers: Arc::new(GcMarkerTable::new()),
            allocations,
            memory,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            sampler: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn threads(&self) -> &Arc<ThreadTable> {
        &self.threads
    }

    pub fn gc_markers(&self) -> &Arc<GcMarkerTable> {
        &self.gc_markers
    }
}

impl Collector for TimeCollector {
    fn start(&self) -> Result<(), ProfileError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProfileError::AlreadyRunning);
        }
        *self.started_at.lock().unwrap() = Some(TimeStamp::now());

        for thread in self.runtime.live_threads() {
            self.threads.seed(thread);
        }
        self.threads.mark_main_thread(self.runtime.main_thread());

        let mut hooks = self.hooks.lock().unwrap();

        if let Some(allocations) = &self.allocations {
            let allocations = Arc::clone(allocations);
            hooks.push(self.runtime.install_alloc_hook(Arc::new(move |event| {
                if let AllocEvent::NewObj(_) = event {
                    allocations.on_newobj();
                }
            })));
        }

        SignalCoordinator::install();

        let job = TimeSamplerJob {
            threads: Arc::clone(&self.threads),
            runtime: Arc::clone(&self.runtime),
            live: LiveSample::new(),
        };
        *self.sampler.lock().unwrap() = Some(PeriodicThread::start(
            job,
            TimeStamp::from(self.configuration.interval),
        ));

        // The calling thread holds the GVL, so we know it is RUNNING. Having
        // at least one running thread also covers programs that never cause
        // a single GVL transition.
        let current = self.runtime.current_thread();
        self.threads.resumed(current);
        self.threads.mark_start_thread(current);

        let threads = Arc::clone(&self.threads);
        let runtime = Arc::clone(&self.runtime);
        hooks.push(
            self.runtime
                .install_gvl_hook(Arc::new(move |event, thread| match event {
                    GvlEvent::Started => threads.started(thread),
                    GvlEvent::Ready => threads.ready(thread, runtime.signal_safe()),
                    GvlEvent::Resumed => threads.resumed(thread),
                    GvlEvent::Suspended => threads.suspended(thread, runtime.signal_safe()),
                    GvlEvent::Exited => threads.stopped(thread),
                })),
        );

        let threads = Arc::clone(&self.threads);
        let gc_markers = Arc::clone(&self.gc_markers);
        let runtime = Arc::clone(&self.runtime);
        hooks.push(
            self.runtime
                .install_event_hook(Arc::new(move |event| match event {
                    RuntimeEvent::ThreadBegin { thread } => threads.started(*thread),
                    RuntimeEvent::ThreadEnd { thread } => threads.stopped(*thread),
                    RuntimeEvent::FiberSwitch { fiber } => threads.fiber_switch(
                        runtime.current_thread(),
                        *fiber,
                        runtime.signal_safe(),
                    ),
                    RuntimeEvent::GcStart => gc_markers.record_gc_start(),
                    RuntimeEvent::GcEndMark => gc_markers.record_gc_end_mark(),
                    RuntimeEvent::GcEndSweep => gc_markers.record_gc_end_sweep(),
                    RuntimeEvent::GcEnter => gc_markers.record_gc_entered(),
                    RuntimeEvent::GcExit => gc_markers.record_gc_leave(runtime.gc_details()),
                })),
        );

        if let Some(memory) = &self.memory {
            let interval = self
                .configuration
                .memory_interval
                .expect("memory tracker exists only with an interval");
            memory.start(TimeStamp::from(interval));
        }

        log::debug!(
            "time collector started (interval: {:?})",
            self.configuration.interval
        );
        Ok(())
    }

    fn stop(&self) -> Result<ProfileData, ProfileError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ProfileError::NotRunning);
        }

        if let Some(mut sampler) = self.sampler.lock().unwrap().take() {
            sampler.stop();
        }
        SignalCoordinator::uninstall();
        for hook in self.hooks.lock().unwrap().drain(..) {
            self.runtime.remove_hook(hook);
        }
        if let Some(memory) = &self.memory {
            memory.stop();
        }

        self.threads.capture_names();
        self.stack_table.finalize(self.runtime.as_ref());

        let started_at = self
            .started_at
            .lock()
            .unwrap()
            .expect("stackscope BUG: stopped a collector that never started");
        let memory_samples = self.memory.as_ref().map(|memory| memory.take_samples());

        Ok(serializer::build_wall_profile(
            started_at,
            self.configuration.interval.as_micros() as u64,
            self.configuration.allocation_interval,
            &self.stack_table,
            &self.threads,
            &self.gc_markers.snapshot(),
            memory_samples.as_ref(),
        ))
    }

    fn mark_reachable_frames(&self, visitor: &mut dyn FnMut(FrameHandle)) {
        self.stack_table.mark_reachable_frames(visitor);
    }
}

/// One iteration = sample every known thread now. Holds the thread table
/// mutex for the whole pass so no state transition can interleave.
struct TimeSamplerJob {
    threads: Arc<ThreadTable>,
    runtime: Arc<dyn HostRuntime>,
    live: Box<LiveSample>,
}

impl PeriodicJob for TimeSamplerJob {
    fn run_iteration(&self) {
        let sample_start = TimeStamp::now();

        let mut threads = self.threads.lock();
        for thread in threads.values_mut() {
            match thread.state {
                ThreadState::Running => {
                    // Threads never observed holding the GVL have no
                    // recorded OS identity and cannot be signalled
                    let pthread_id = match thread.pthread_id {
                        Some(pthread_id) => pthread_id,
                        None => continue,
                    };
                    if !SignalCoordinator::record_sample(
                        &self.live,
                        self.runtime.signal_safe(),
                        pthread_id,
                    ) {
                        thread.set_state(ThreadState::Stopped);
                        continue;
                    }

                    let raw = self.live.raw();
                    if raw.in_gc() {
                        // GC markers describe this time
                    } else if !raw.is_empty() {
                        if let Ok(stack) =
                            thread.translator.translate(self.threads.stack_table(), raw)
                        {
                            thread
                                .samples
                                .record_sample(stack, sample_start, Category::Normal);
                        }
                    }
                }
                ThreadState::Suspended => {
                    if let Some(stack) = thread.stack_on_suspend {
                        thread
                            .samples
                            .record_sample(stack, sample_start, Category::Idle);
                    }
                }
                ThreadState::Ready => {
                    if let Some(stack) = thread.stack_on_suspend {
                        thread
                            .samples
                            .record_sample(stack, sample_start, Category::Stalled);
                    }
                }
                ThreadState::Initial | ThreadState::Started | ThreadState::Stopped => {}
            }
        }
    }

    fn name(&self) -> &'static str {
        "stackscope sampler"
    }
}
