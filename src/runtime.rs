//! The seam between the profiler engine and the embedding managed runtime.
//!
//! The engine never talks to the host VM directly; the embedder supplies an
//! implementation of these traits. Hook callbacks are invoked by the host on
//! a thread holding the GIL (except GVL scheduling callbacks, which run on
//! the transitioning thread) and are allowed to allocate.

use std::sync::Arc;

/// Opaque identifier of an interpreter method/iseq, stable while the host
/// keeps it alive (see `StackTable::mark_reachable_frames`).
pub type FrameHandle = u64;

/// Opaque identifier of a managed object. May change across a compaction;
/// `HostRuntime::object_location` forwards to the new identity.
pub type ObjectHandle = u64;

/// Identity of a managed thread. This is the host's thread *object*, not an
/// OS handle: OS handles may be reused after exit, the host object is stable
/// for the lifetime we care about.
pub type ThreadHandle = u64;

/// Token for an installed hook, passed back to `remove_hook`.
pub type HookHandle = u64;

/// GIL scheduling transitions. Delivered on the transitioning thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GvlEvent {
    Started,
    Ready,
    Resumed,
    Suspended,
    Exited,
}

/// GC phase transitions and thread/fiber lifecycle events. Delivered on a
/// thread holding the GIL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeEvent {
    ThreadBegin { thread: ThreadHandle },
    ThreadEnd { thread: ThreadHandle },
    FiberSwitch { fiber: ObjectHandle },
    GcStart,
    GcEndMark,
    GcEndSweep,
    GcEnter,
    GcExit,
}

/// Synchronous allocation notifications, delivered with the GIL held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocEvent {
    NewObj(ObjectHandle),
    FreeObj(ObjectHandle),
}

/// Why and where the GC currently is, as reported by the host. Used to
/// annotate GC_PAUSE markers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcDetails {
    pub cause: Option<String>,
    pub state: Option<String>,
}

/// The symbolicated form of a frame handle. Resolution may allocate in the
/// host and must only happen outside the profiler's locks.
#[derive(Clone, Debug, Default)]
pub struct FuncSymbol {
    pub label: Option<String>,
    pub classpath: Option<String>,
    pub method_name: Option<String>,
    pub file: Option<String>,
    pub absolute_path: Option<String>,
    pub first_lineno: Option<i32>,
    pub singleton: bool,
}

impl FuncSymbol {
    /// The display label: the host-provided one if present, otherwise
    /// composed from classpath and method name ("Klass#method", or
    /// "Klass.method" for singleton methods).
    pub fn full_label(&self) -> Option<String> {
        if self.label.is_some() {
            return self.label.clone();
        }
        match (&self.classpath, &self.method_name) {
            (Some(classpath), Some(method)) => {
                let sep = if self.singleton { "." } else { "#" };
                Some(format!("{}{}{}", classpath, sep, method))
            }
            (None, Some(method)) => Some(method.clone()),
            _ => None,
        }
    }

    /// The display filename, preferring the absolute path.
    pub fn display_file(&self) -> Option<String> {
        self.absolute_path.clone().or_else(|| self.file.clone())
    }
}

pub type GvlHook = Arc<dyn Fn(GvlEvent, ThreadHandle) + Send + Sync>;
pub type EventHook = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;
pub type AllocHook = Arc<dyn Fn(&AllocEvent) + Send + Sync>;

/// The subset of the host interface that is callable from a signal handler.
/// Implementations must not allocate, must not take locks, and must tolerate
/// running on a thread that is inside arbitrary runtime internals.
pub trait SignalSafeRuntime: Send + Sync {
    /// Is the calling OS thread a managed-runtime thread?
    fn is_managed_thread(&self) -> bool;

    /// Is the runtime currently inside a GC phase?
    fn in_gc(&self) -> bool;

    /// Fill `frames`/`lines` with the calling thread's interpreter stack,
    /// innermost frame first. Returns the number of entries filled.
    fn current_stack(&self, frames: &mut [FrameHandle], lines: &mut [i32]) -> usize;
}

/// Full host interface. All methods besides the `SignalSafeRuntime` subset
/// are only invoked from threads holding the GIL or after the sampler thread
/// has been joined.
pub trait HostRuntime: SignalSafeRuntime {
    /// The signal-handler-legal view of this runtime. Implementers return
    /// `self`.
    fn signal_safe(&self) -> &dyn SignalSafeRuntime;

    /// Subscribe to GVL scheduling transitions. The callback may run on any
    /// OS thread.
    fn install_gvl_hook(&self, hook: GvlHook) -> HookHandle;

    /// Subscribe to GC phase transitions and thread/fiber begin/end.
    fn install_event_hook(&self, hook: EventHook) -> HookHandle;

    /// Subscribe to NEWOBJ/FREEOBJ.
    fn install_alloc_hook(&self, hook: AllocHook) -> HookHandle;

    /// Remove a previously installed hook. Synchronous: no further callbacks
    /// fire once this returns.
    fn remove_hook(&self, hook: HookHandle);

    /// All currently-live managed threads.
    fn live_threads(&self) -> Vec<ThreadHandle>;

    /// The managed thread running on the calling OS thread.
    fn current_thread(&self) -> ThreadHandle;

    /// The host's main interpreter thread. This is interpreter-level
    /// knowledge; OS thread/process ids are no substitute (their
    /// relationship to the main thread is platform-specific).
    fn main_thread(&self) -> ThreadHandle;

    /// Resolve a frame handle. May allocate, trigger GC, or re-enter
    /// profiler hooks; never called under the profiler's locks.
    fn symbolicate(&self, frame: FrameHandle) -> FuncSymbol;

    /// Size in bytes of a managed object.
    fn object_size(&self, object: ObjectHandle) -> usize;

    /// The current identity of a possibly-moved object.
    fn object_location(&self, object: ObjectHandle) -> ObjectHandle;

    /// Cause/state of the GC run that just finished.
    fn gc_details(&self) -> GcDetails;

    /// Trigger a full garbage collection synchronously.
    fn run_gc(&self);
}
