use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::runtime::HostRuntime;
use crate::thread_table::ThreadTable;

/// Samples one allocation out of every `interval` NEWOBJ events, attributing
/// it to the allocating thread with weight `interval` (each recorded sample
/// stands for that many allocations).
pub struct AllocationCollector {
    interval: u64,
    counter: AtomicU64,
    threads: Arc<ThreadTable>,
    runtime: Arc<dyn HostRuntime>,
}

impl AllocationCollector {
    pub fn new(
        interval: u64,
        threads: Arc<ThreadTable>,
        runtime: Arc<dyn HostRuntime>,
    ) -> AllocationCollector {
        assert!(interval > 0, "stackscope BUG: zero allocation interval");
        AllocationCollector {
            interval,
            counter: AtomicU64::new(0),
            threads,
            runtime,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// NEWOBJ hook body; runs with the GIL held.
    pub fn on_newobj(&self) {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.interval != 0 {
            return;
        }
        self.threads.allocation_sample(
            self.runtime.current_thread(),
            self.runtime.signal_safe(),
            self.interval as u32,
        );
    }
}
