use std::sync::Mutex;

use crate::runtime::GcDetails;
use crate::stack_table::StackId;
use crate::timestamp::TimeStamp;

/// Stable marker type values; downstream consumers index name tables by
/// these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkerType {
    GvlThreadStarted = 0,
    GvlThreadExited = 1,

    GcStart = 2,
    GcEndMark = 3,
    GcEndSweep = 4,
    GcEnter = 5,
    GcExit = 6,
    GcPause = 7,

    ThreadRunning = 8,
    ThreadStalled = 9,
    ThreadSuspended = 10,

    FiberSwitch = 11,
}

/// Must match the phase values the downstream visualizer expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkerPhase {
    Instant = 0,
    Interval = 1,
    IntervalStart = 2,
    IntervalEnd = 3,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerExtra {
    Gc {
        cause: Option<String>,
        state: Option<String>,
    },
    Fiber {
        fiber_id: u64,
    },
}

#[derive(Clone, Debug)]
pub struct Marker {
    pub marker_type: MarkerType,
    pub phase: MarkerPhase,
    pub start: TimeStamp,
    pub end: Option<TimeStamp>,
    pub stack: Option<StackId>,
    pub extra: Option<MarkerExtra>,
}

/// Append-only event log. Entries are never mutated after append; the mutex
/// is held only for the duration of an append.
pub struct MarkerTable {
    list: Mutex<Vec<Marker>>,
}

impl MarkerTable {
    pub fn new() -> Self {
        MarkerTable {
            list: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, marker_type: MarkerType) {
        self.record_instant(marker_type, None, None);
    }

    pub fn record_instant(
        &self,
        marker_type: MarkerType,
        stack: Option<StackId>,
        extra: Option<MarkerExtra>,
    ) {
        self.list.lock().unwrap().push(Marker {
            marker_type,
            phase: MarkerPhase::Instant,
            start: TimeStamp::now(),
            end: None,
            stack,
            extra,
        });
    }

    pub fn record_interval(&self, marker_type: MarkerType, from: TimeStamp, to: TimeStamp) {
        self.record_interval_with(marker_type, from, to, None);
    }

    pub fn record_interval_with(
        &self,
        marker_type: MarkerType,
        from: TimeStamp,
        to: TimeStamp,
        extra: Option<MarkerExtra>,
    ) {
        self.list.lock().unwrap().push(Marker {
            marker_type,
            phase: MarkerPhase::Interval,
            start: from,
            end: Some(to),
            stack: None,
            extra,
        });
    }

    pub fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Marker> {
        self.list.lock().unwrap().clone()
    }
}

impl Default for MarkerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared GC log. GC_ENTER stashes the entry time; GC_EXIT emits a
/// GC_PAUSE interval covering it, annotated with the runtime's reported
/// cause and state.
pub struct GcMarkerTable {
    markers: MarkerTable,
    last_gc_entry: Mutex<Option<TimeStamp>>,
}

impl GcMarkerTable {
    pub fn new() -> Self {
        GcMarkerTable {
            markers: MarkerTable::new(),
            last_gc_entry: Mutex::new(None),
        }
    }

    pub fn record_gc_start(&self) {
        self.markers.record(MarkerType::GcStart);
    }

    pub fn record_gc_end_mark(&self) {
        self.markers.record(MarkerType::GcEndMark);
    }

    pub fn record_gc_end_sweep(&self) {
        self.markers.record(MarkerType::GcEndSweep);
    }

    pub fn record_gc_entered(&self) {
        *self.last_gc_entry.lock().unwrap() = Some(TimeStamp::now());
    }

    pub fn record_gc_leave(&self, details: GcDetails) {
        let entered = self.last_gc_entry.lock().unwrap().take();
        if let Some(from) = entered {
            self.markers.record_interval_with(
                MarkerType::GcPause,
                from,
                TimeStamp::now(),
                Some(MarkerExtra::Gc {
                    cause: details.cause,
                    state: details.state,
                }),
            );
        }
    }

    pub fn snapshot(&self) -> Vec<Marker> {
        self.markers.snapshot()
    }
}

impl Default for GcMarkerTable {
    fn default() -> Self {
        Self::new()
    }
}
