use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::collector::Collector;
use crate::error::ProfileError;
use crate::raw_sample::RawSample;
use crate::runtime::{AllocEvent, FrameHandle, HookHandle, HostRuntime, ObjectHandle};
use crate::serialization::profile::ProfileData;
use crate::serialization::serializer;
use crate::stack_table::{StackId, StackTable};
use crate::timestamp::TimeStamp;

#[derive(Default)]
struct RetainedState {
    /// Allocation order; `None` marks a freed slot (tombstone).
    object_list: Vec<Option<ObjectHandle>>,
    stack_list: Vec<StackId>,
    object_index: FxHashMap<ObjectHandle, usize>,
    objects_allocated: u64,
    objects_freed: u64,
}

struct RetainedInner {
    runtime: Arc<dyn HostRuntime>,
    stack_table: Arc<StackTable>,
    state: Mutex<RetainedState>,
    accept_allocs: AtomicBool,
    accept_frees: AtomicBool,
}

impl RetainedInner {
    fn record_newobj(&self, object: ObjectHandle) {
        if !self.accept_allocs.load(Ordering::Relaxed) {
            return;
        }

        let mut raw = RawSample::new();
        raw.sample(self.runtime.signal_safe(), 0);

        let mut state = self.state.lock().unwrap();
        state.objects_allocated += 1;

        if raw.is_empty() {
            // Some allocations happen without a frame (e.g. during thread
            // construction); nothing to attribute them to
            return;
        }
        let stack = match self.stack_table.stack_index(&raw) {
            Ok(stack) => stack,
            Err(_) => return,
        };

        let idx = state.object_list.len();
        state.object_list.push(Some(object));
        state.stack_list.push(stack);
        state.object_index.insert(object, idx);
    }

    fn record_freeobj(&self, object: ObjectHandle) {
        if !self.accept_frees.load(Ordering::Relaxed) {
            return;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.object_index.remove(&object) {
            state.object_list[idx] = None;
            state.objects_freed += 1;
        }
    }
}

/// Pairs every allocation with its stack and keeps the pair until the object
/// is freed; at stop, reports the surviving objects with their sizes.
pub struct RetainedCollector {
    inner: Arc<RetainedInner>,
    running: AtomicBool,
    started_at: Mutex<Option<TimeStamp>>,
    hook: Mutex<Option<HookHandle>>,
    gc_runs_at_stop: u32,
}

impl RetainedCollector {
    pub fn new(
        runtime: Arc<dyn HostRuntime>,
        stack_table: Arc<StackTable>,
        gc_runs_at_stop: u32,
    ) -> RetainedCollector {
        RetainedCollector {
            inner: Arc::new(RetainedInner {
                runtime,
                stack_table,
                state: Mutex::new(RetainedState::default()),
                accept_allocs: AtomicBool::new(false),
                accept_frees: AtomicBool::new(false),
            }),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            hook: Mutex::new(None),
            gc_runs_at_stop,
        }
    }

    pub fn allocated_objects(&self) -> u64 {
        self.inner.state.lock().unwrap().objects_allocated
    }

    pub fn freed_objects(&self) -> u64 {
        self.inner.state.lock().unwrap().objects_freed
    }

    pub fn live_object_count(&self) -> usize {
        self.inner.state.lock().unwrap().object_index.len()
    }

    /// The allocation stack currently tracked for an object, if it is still
    /// live.
    pub fn stack_index_of(&self, object: ObjectHandle) -> Option<StackId> {
        let state = self.inner.state.lock().unwrap();
        state
            .object_index
            .get(&object)
            .map(|&idx| state.stack_list[idx])
    }

    /// Visit every live tracked object, for the embedder's movable marking.
    pub fn mark_reachable_objects(&self, visitor: &mut dyn FnMut(ObjectHandle)) {
        let state = self.inner.state.lock().unwrap();
        for object in state.object_list.iter().flatten() {
            visitor(*object);
        }
    }
}

impl Collector for RetainedCollector {
    fn start(&self) -> Result<(), ProfileError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProfileError::AlreadyRunning);
        }
        *self.started_at.lock().unwrap() = Some(TimeStamp::now());

        self.inner.accept_allocs.store(true, Ordering::Relaxed);
        self.inner.accept_frees.store(true, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let hook = self
            .inner
            .runtime
            .install_alloc_hook(Arc::new(move |event| match event {
                AllocEvent::NewObj(object) => inner.record_newobj(*object),
                AllocEvent::FreeObj(object) => inner.record_freeobj(*object),
            }));
        *self.hook.lock().unwrap() = Some(hook);

        log::debug!("retained collector started");
        Ok(())
    }

    fn stop(&self) -> Result<ProfileData, ProfileError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ProfileError::NotRunning);
        }
        let runtime = &self.inner.runtime;

        // GC before we start turning stacks into strings, so objects kept
        // alive only by dead references get freed out of the result
        runtime.run_gc();

        // Stop tracking new objects, but keep honoring frees: symbolication
        // below may release references and let more objects die
        self.inner.accept_allocs.store(false, Ordering::Relaxed);

        self.inner.stack_table.finalize(runtime.as_ref());

        for _ in 1..self.gc_runs_at_stop {
            runtime.run_gc();
        }

        self.inner.accept_frees.store(false, Ordering::Relaxed);
        if let Some(hook) = self.hook.lock().unwrap().take() {
            runtime.remove_hook(hook);
        }

        let started_at = self
            .started_at
            .lock()
            .unwrap()
            .expect("stackscope BUG: stopped a collector that never started");

        let state = self.inner.state.lock().unwrap();
        let mut samples: Vec<StackId> = Vec::new();
        let mut weights: Vec<u32> = Vec::new();
        for (idx, object) in state.object_list.iter().enumerate() {
            if let Some(object) = object {
                samples.push(state.stack_list[idx]);
                weights.push(runtime.object_size(*object) as u32);
            }
        }
        log::debug!(
            "retained collector stopped ({} surviving of {} allocated)",
            samples.len(),
            state.objects_allocated
        );

        Ok(serializer::build_object_profile(
            "retained",
            started_at,
            &self.inner.stack_table,
            samples,
            weights,
        ))
    }

    fn mark_reachable_frames(&self, visitor: &mut dyn FnMut(FrameHandle)) {
        self.inner.stack_table.mark_reachable_frames(visitor);
    }

    /// The host moved objects: rewrite the tracked identifiers and rebuild
    /// the reverse index.
    fn on_compact(&self) {
        let runtime = Arc::clone(&self.inner.runtime);
        let mut state = self.inner.state.lock().unwrap();
        state.object_index.clear();
        for idx in 0..state.object_list.len() {
            if let Some(object) = state.object_list[idx] {
                let moved = runtime.object_location(object);
                state.object_list[idx] = Some(moved);
                state.object_index.insert(moved, idx);
            }
        }
    }
}
