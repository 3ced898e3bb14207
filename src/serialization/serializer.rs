//! Folds collector state into the output model.

use std::collections::BTreeMap;

use crate::marker::{Marker, MarkerExtra};
use crate::memory_tracker::MemorySamples;
use crate::serialization::profile::{
    AllocationData, MarkerData, MarkerExtraData, MemoryData, Meta, ProfileData, SampleData,
    ThreadData,
};
use crate::stack_table::{StackId, StackTable};
use crate::thread_table::{SampleList, Thread, ThreadTable};
use crate::timestamp::TimeStamp;

pub fn build_wall_profile(
    started_at: TimeStamp,
    interval_us: u64,
    allocation_interval: u64,
    stack_table: &StackTable,
    threads: &ThreadTable,
    gc_markers: &[Marker],
    memory: Option<&MemorySamples>,
) -> ProfileData {
    let (stacks, frames, funcs) = stack_table.export();

    let mut thread_map: BTreeMap<u64, ThreadData> = BTreeMap::new();
    for (handle, thread) in threads.lock().iter() {
        thread_map.insert(*handle, thread_data(thread));
    }

    ProfileData {
        meta: Meta {
            mode: "wall".to_string(),
            started_at: started_at.nanoseconds(),
            interval: Some(interval_us),
            allocation_interval: if allocation_interval > 0 {
                Some(allocation_interval)
            } else {
                None
            },
        },
        stack_table: stacks,
        frame_table: frames,
        func_table: funcs,
        threads: thread_map,
        gc_markers: gc_markers.iter().map(marker_row).collect(),
        memory: memory.map(memory_data),
    }
}

/// Result of the retained collector: one pseudo-thread whose samples are the
/// surviving objects' allocation stacks and whose weights are their sizes.
pub fn build_object_profile(
    mode: &str,
    started_at: TimeStamp,
    stack_table: &StackTable,
    samples: Vec<StackId>,
    weights: Vec<u32>,
) -> ProfileData {
    let (stacks, frames, funcs) = stack_table.export();

    let mut thread_map = BTreeMap::new();
    thread_map.insert(
        0,
        ThreadData {
            tid: 0,
            name: String::new(),
            started_at: started_at.nanoseconds(),
            stopped_at: None,
            is_main: true,
            is_start: true,
            samples: SampleData {
                samples: samples.into_iter().map(|s| s as u32).collect(),
                weights,
                timestamps: vec![],
                sample_categories: vec![],
            },
            allocations: AllocationData::default(),
            markers: vec![],
        },
    );

    ProfileData {
        meta: Meta {
            mode: mode.to_string(),
            started_at: started_at.nanoseconds(),
            interval: None,
            allocation_interval: None,
        },
        stack_table: stacks,
        frame_table: frames,
        func_table: funcs,
        threads: thread_map,
        gc_markers: vec![],
        memory: None,
    }
}

/// Result of the custom collector: one pseudo-thread of manually taken
/// samples.
pub fn build_manual_profile(
    started_at: TimeStamp,
    stack_table: &StackTable,
    samples: &SampleList,
) -> ProfileData {
    let (stacks, frames, funcs) = stack_table.export();

    let mut thread_map = BTreeMap::new();
    thread_map.insert(
        0,
        ThreadData {
            tid: 0,
            name: String::new(),
            started_at: started_at.nanoseconds(),
            stopped_at: None,
            is_main: true,
            is_start: true,
            samples: sample_data(samples),
            allocations: AllocationData::default(),
            markers: vec![],
        },
    );

    ProfileData {
        meta: Meta {
            mode: "custom".to_string(),
            started_at: started_at.nanoseconds(),
            interval: None,
            allocation_interval: None,
        },
        stack_table: stacks,
        frame_table: frames,
        func_table: funcs,
        threads: thread_map,
        gc_markers: vec![],
        memory: None,
    }
}

fn thread_data(thread: &Thread) -> ThreadData {
    ThreadData {
        tid: thread.native_tid.unwrap_or(0),
        name: thread.name.clone().unwrap_or_default(),
        started_at: thread.started_at.nanoseconds(),
        stopped_at: thread.stopped_at.map(|t| t.nanoseconds()),
        is_main: thread.is_main,
        is_start: thread.is_start,
        samples: sample_data(&thread.samples),
        allocations: AllocationData {
            samples: thread.allocations.stacks.iter().map(|&s| s as u32).collect(),
            weights: thread.allocations.weights.clone(),
            timestamps: thread
                .allocations
                .timestamps
                .iter()
                .map(|t| t.nanoseconds())
                .collect(),
        },
        markers: thread.markers.snapshot().iter().map(marker_row).collect(),
    }
}

fn sample_data(samples: &SampleList) -> SampleData {
    SampleData {
        samples: samples.stacks.iter().map(|&s| s as u32).collect(),
        weights: samples.weights.clone(),
        timestamps: samples.timestamps.iter().map(|t| t.nanoseconds()).collect(),
        sample_categories: samples.categories.iter().map(|&c| c as u8).collect(),
    }
}

fn marker_row(marker: &Marker) -> MarkerData {
    MarkerData(
        marker.marker_type as u8,
        marker.phase as u8,
        marker.start.nanoseconds(),
        marker.end.map(|t| t.nanoseconds()),
        marker.stack.map(|s| s as u32),
        marker.extra.as_ref().map(|extra| match extra {
            MarkerExtra::Gc { cause, state } => MarkerExtraData::Gc {
                cause: cause.clone(),
                state: state.clone(),
            },
            MarkerExtra::Fiber { fiber_id } => MarkerExtraData::Fiber {
                fiber_id: *fiber_id,
            },
        }),
    )
}

fn memory_data(samples: &MemorySamples) -> MemoryData {
    MemoryData {
        timestamps: samples.timestamps.iter().map(|t| t.nanoseconds()).collect(),
        rss: samples.rss.clone(),
    }
}
