//! A scriptable host runtime for exercising the collectors end-to-end.
//!
//! The signal-safe surface reads only thread-local state, so a signal
//! handler interrupting a registered thread never touches a lock: each test
//! thread registers itself (handle + the stack it pretends to be running)
//! and the handler reads that thread's own registration.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stackscope::raw_sample::Frame;
use stackscope::runtime::{
    AllocEvent, AllocHook, EventHook, FrameHandle, FuncSymbol, GcDetails, GvlEvent, GvlHook,
    HookHandle, HostRuntime, ObjectHandle, RuntimeEvent, SignalSafeRuntime, ThreadHandle,
};
use stackscope::serialization::profile::ProfileData;

thread_local! {
    static CURRENT: RefCell<Option<(ThreadHandle, Vec<Frame>)>> = RefCell::new(None);
}

#[derive(Default)]
struct Hooks {
    gvl: Vec<(HookHandle, GvlHook)>,
    event: Vec<(HookHandle, EventHook)>,
    alloc: Vec<(HookHandle, AllocHook)>,
}

pub struct MockRuntime {
    hooks: Mutex<Hooks>,
    next_hook: AtomicU64,
    in_gc: AtomicBool,
    live_threads: Mutex<Vec<ThreadHandle>>,
    object_sizes: Mutex<HashMap<ObjectHandle, usize>>,
    object_locations: Mutex<HashMap<ObjectHandle, ObjectHandle>>,
    free_on_gc: Mutex<Vec<ObjectHandle>>,
    gc_details: Mutex<GcDetails>,
    gc_count: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Arc<MockRuntime> {
        Arc::new(MockRuntime {
            hooks: Mutex::new(Hooks::default()),
            next_hook: AtomicU64::new(1),
            in_gc: AtomicBool::new(false),
            live_threads: Mutex::new(Vec::new()),
            object_sizes: Mutex::new(HashMap::new()),
            object_locations: Mutex::new(HashMap::new()),
            free_on_gc: Mutex::new(Vec::new()),
            gc_details: Mutex::new(GcDetails::default()),
            gc_count: AtomicU64::new(0),
        })
    }

    /// Declare the calling OS thread to be managed thread `handle`,
    /// currently executing `stack` (innermost frame first, as the runtime
    /// reports stacks).
    pub fn register_current_thread(&self, handle: ThreadHandle, stack: Vec<Frame>) {
        CURRENT.with(|current| *current.borrow_mut() = Some((handle, stack)));
        let mut live = self.live_threads.lock().unwrap();
        if !live.contains(&handle) {
            live.push(handle);
        }
    }

    pub fn set_current_stack(&self, stack: Vec<Frame>) {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            let handle = current.as_ref().expect("thread not registered").0;
            *current = Some((handle, stack));
        });
    }

    pub fn set_in_gc(&self, in_gc: bool) {
        self.in_gc.store(in_gc, Ordering::SeqCst);
    }

    pub fn set_object_size(&self, object: ObjectHandle, size: usize) {
        self.object_sizes.lock().unwrap().insert(object, size);
    }

    pub fn set_object_location(&self, object: ObjectHandle, moved_to: ObjectHandle) {
        self.object_locations
            .lock()
            .unwrap()
            .insert(object, moved_to);
    }

    /// Objects that the next `run_gc` will report as freed.
    pub fn queue_free_on_gc(&self, object: ObjectHandle) {
        self.free_on_gc.lock().unwrap().push(object);
    }

    pub fn set_gc_details(&self, details: GcDetails) {
        *self.gc_details.lock().unwrap() = details;
    }

    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::SeqCst)
    }

    pub fn fire_gvl(&self, event: GvlEvent, thread: ThreadHandle) {
        let hooks: Vec<GvlHook> = {
            let hooks = self.hooks.lock().unwrap();
            hooks.gvl.iter().map(|(_, hook)| Arc::clone(hook)).collect()
        };
        for hook in hooks {
            hook(event, thread);
        }
    }

    pub fn fire_event(&self, event: RuntimeEvent) {
        let hooks: Vec<EventHook> = {
            let hooks = self.hooks.lock().unwrap();
            hooks
                .event
                .iter()
                .map(|(_, hook)| Arc::clone(hook))
                .collect()
        };
        for hook in hooks {
            hook(&event);
        }
    }

    pub fn fire_alloc(&self, event: AllocEvent) {
        let hooks: Vec<AllocHook> = {
            let hooks = self.hooks.lock().unwrap();
            hooks
                .alloc
                .iter()
                .map(|(_, hook)| Arc::clone(hook))
                .collect()
        };
        for hook in hooks {
            hook(&event);
        }
    }
}

impl SignalSafeRuntime for MockRuntime {
    fn is_managed_thread(&self) -> bool {
        CURRENT.with(|current| current.borrow().is_some())
    }

    fn in_gc(&self) -> bool {
        self.in_gc.load(Ordering::SeqCst)
    }

    fn current_stack(&self, frames: &mut [FrameHandle], lines: &mut [i32]) -> usize {
        CURRENT.with(|current| {
            let current = current.borrow();
            let (_, stack) = match current.as_ref() {
                Some(current) => current,
                None => return 0,
            };
            let n = stack.len().min(frames.len());
            for i in 0..n {
                frames[i] = stack[i].handle;
                lines[i] = stack[i].line;
            }
            n
        })
    }
}

impl HostRuntime for MockRuntime {
    fn signal_safe(&self) -> &dyn SignalSafeRuntime {
        self
    }

    fn install_gvl_hook(&self, hook: GvlHook) -> HookHandle {
        let handle = self.next_hook.fetch_add(1, Ordering::SeqCst);
        self.hooks.lock().unwrap().gvl.push((handle, hook));
        handle
    }

    fn install_event_hook(&self, hook: EventHook) -> HookHandle {
        let handle = self.next_hook.fetch_add(1, Ordering::SeqCst);
        self.hooks.lock().unwrap().event.push((handle, hook));
        handle
    }

    fn install_alloc_hook(&self, hook: AllocHook) -> HookHandle {
        let handle = self.next_hook.fetch_add(1, Ordering::SeqCst);
        self.hooks.lock().unwrap().alloc.push((handle, hook));
        handle
    }

    fn remove_hook(&self, hook: HookHandle) {
        let mut hooks = self.hooks.lock().unwrap();
        hooks.gvl.retain(|(handle, _)| *handle != hook);
        hooks.event.retain(|(handle, _)| *handle != hook);
        hooks.alloc.retain(|(handle, _)| *handle != hook);
    }

    fn live_threads(&self) -> Vec<ThreadHandle> {
        self.live_threads.lock().unwrap().clone()
    }

    fn current_thread(&self) -> ThreadHandle {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .expect("current thread not registered")
                .0
        })
    }

    // The first thread registered plays the role of the interpreter's main
    // thread.
    fn main_thread(&self) -> ThreadHandle {
        self.live_threads.lock().unwrap().first().copied().unwrap_or(0)
    }

    fn symbolicate(&self, frame: FrameHandle) -> FuncSymbol {
        FuncSymbol {
            label: Some(format!("mock_method_{}", frame)),
            file: Some(format!("mock_{}.rb", frame)),
            absolute_path: Some(format!("/mock/mock_{}.rb", frame)),
            first_lineno: Some((frame % 1000) as i32),
            ..FuncSymbol::default()
        }
    }

    fn object_size(&self, object: ObjectHandle) -> usize {
        self.object_sizes
            .lock()
            .unwrap()
            .get(&object)
            .copied()
            .unwrap_or(40)
    }

    fn object_location(&self, object: ObjectHandle) -> ObjectHandle {
        self.object_locations
            .lock()
            .unwrap()
            .get(&object)
            .copied()
            .unwrap_or(object)
    }

    fn gc_details(&self) -> GcDetails {
        self.gc_details.lock().unwrap().clone()
    }

    fn run_gc(&self) {
        self.gc_count.fetch_add(1, Ordering::SeqCst);
        let freed: Vec<ObjectHandle> = self.free_on_gc.lock().unwrap().drain(..).collect();
        for object in freed {
            self.fire_alloc(AllocEvent::FreeObj(object));
        }
    }
}

/// Frames innermost-first, as the runtime reports them.
pub fn leaf_first(frames: &[(FrameHandle, i32)]) -> Vec<Frame> {
    frames
        .iter()
        .map(|&(handle, line)| Frame { handle, line })
        .collect()
}

pub fn spin_for(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Resolve the function name of a stack's leaf frame through the emitted
/// columnar tables.
pub fn leaf_func_name(data: &ProfileData, stack: u32) -> String {
    let frame = data.stack_table.frame[stack as usize] as usize;
    let func = data.frame_table.func[frame] as usize;
    data.func_table.name[func].clone()
}
