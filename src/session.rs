pub mod configuration;

use std::sync::Arc;

use crate::collector::Collector;
use crate::custom_collector::CustomCollector;
use crate::error::ProfileError;
use crate::retained_collector::RetainedCollector;
use crate::runtime::{FrameHandle, HostRuntime};
use crate::serialization::profile::ProfileData;
use crate::stack_table::StackTable;
use crate::time_collector::TimeCollector;

use self::configuration::{Configuration, Mode};

/// One profiling run: a collector built from a validated configuration
/// around a session-owned `StackTable`.
pub struct Session {
    collector: Box<dyn Collector>,
    stack_table: Arc<StackTable>,
}

impl Session {
    pub fn new(
        runtime: Arc<dyn HostRuntime>,
        configuration: Configuration,
    ) -> Result<Session, ProfileError> {
        configuration.validate()?;

        let stack_table = Arc::new(StackTable::new());
        let collector: Box<dyn Collector> = match configuration.mode {
            Mode::Wall => Box::new(TimeCollector::new(
                runtime,
                configuration,
                Arc::clone(&stack_table),
            )),
            Mode::Retained => Box::new(RetainedCollector::new(
                runtime,
                Arc::clone(&stack_table),
                configuration.gc_runs_at_stop,
            )),
            Mode::Custom => Box::new(CustomCollector::new(runtime, Arc::clone(&stack_table))),
        };

        Ok(Session {
            collector,
            stack_table,
        })
    }

    pub fn start(&self) -> Result<(), ProfileError> {
        self.collector.start()
    }

    pub fn stop(&self) -> Result<ProfileData, ProfileError> {
        self.collector.stop()
    }

    /// Manual sampling; supported by `Mode::Custom`.
    pub fn sample(&self) -> Result<(), ProfileError> {
        self.collector.sample()
    }

    /// The session's stack table, shared by every collector created from it.
    pub fn stack_table(&self) -> &Arc<StackTable> {
        &self.stack_table
    }

    /// For the embedder's GC mark phase: visit every frame handle the
    /// profiler still needs alive.
    pub fn mark_reachable_frames(&self, visitor: &mut dyn FnMut(FrameHandle)) {
        self.collector.mark_reachable_frames(visitor);
    }

    /// For the embedder's compaction callback.
    pub fn on_compact(&self) {
        self.collector.on_compact();
    }
}
