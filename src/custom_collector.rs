use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::collector::Collector;
use crate::error::ProfileError;
use crate::raw_sample::RawSample;
use crate::runtime::{FrameHandle, HostRuntime};
use crate::serialization::profile::ProfileData;
use crate::serialization::serializer;
use crate::stack_table::StackTable;
use crate::thread_table::{Category, SampleList};
use crate::timestamp::TimeStamp;

/// A collector with no machinery of its own: the embedder decides when to
/// sample, by calling `sample()` from a thread holding the GIL.
pub struct CustomCollector {
    runtime: Arc<dyn HostRuntime>,
    stack_table: Arc<StackTable>,
    samples: Mutex<SampleList>,
    running: AtomicBool,
    started_at: Mutex<Option<TimeStamp>>,
}

impl CustomCollector {
    pub fn new(runtime: Arc<dyn HostRuntime>, stack_table: Arc<StackTable>) -> CustomCollector {
        CustomCollector {
            runtime,
            stack_table,
            samples: Mutex::new(SampleList::default()),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        }
    }
}

impl Collector for CustomCollector {
    fn start(&self) -> Result<(), ProfileError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProfileError::AlreadyRunning);
        }
        *self.started_at.lock().unwrap() = Some(TimeStamp::now());
        Ok(())
    }

    fn stop(&self) -> Result<ProfileData, ProfileError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ProfileError::NotRunning);
        }

        self.stack_table.finalize(self.runtime.as_ref());

        let started_at = self
            .started_at
            .lock()
            .unwrap()
            .expect("stackscope BUG: stopped a collector that never started");
        let samples = self.samples.lock().unwrap();
        Ok(serializer::build_manual_profile(
            started_at,
            &self.stack_table,
            &samples,
        ))
    }

    fn sample(&self) -> Result<(), ProfileError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ProfileError::NotRunning);
        }

        let mut raw = RawSample::new();
        raw.sample(self.runtime.signal_safe(), 0);
        let stack = self.stack_table.stack_index(&raw)?;
        self.samples
            .lock()
            .unwrap()
            .record_sample(stack, TimeStamp::now(), Category::Normal);
        Ok(())
    }

    fn mark_reachable_frames(&self, visitor: &mut dyn FnMut(FrameHandle)) {
        self.stack_table.mark_reachable_frames(visitor);
    }
}
