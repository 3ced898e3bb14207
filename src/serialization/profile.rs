//! The collector-to-consumer output model. Field names and shapes are part
//! of the interface with downstream tooling; see the serializer for how
//! collector state is folded into it.

use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProfileData {
    pub meta: Meta,
    pub stack_table: StackTableData,
    pub frame_table: FrameTableData,
    pub func_table: FuncTableData,
    pub threads: BTreeMap<u64, ThreadData>,
    pub gc_markers: Vec<MarkerData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryData>,
}

impl ProfileData {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("profile serialization cannot fail")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Meta {
    pub mode: String,
    /// Monotonic nanoseconds; consumers rebase against realtime themselves.
    pub started_at: u64,
    pub interval: Option<u64>,
    pub allocation_interval: Option<u64>,
}

/// One entry per stack id. `parent` is null for depth-1 stacks.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StackTableData {
    pub parent: Vec<Option<u32>>,
    pub frame: Vec<u32>,
}

/// One entry per frame index.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FrameTableData {
    pub func: Vec<u32>,
    pub line: Vec<i32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FuncTableData {
    pub name: Vec<String>,
    pub filename: Vec<String>,
    pub first_line: Vec<i32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ThreadData {
    pub tid: u64,
    pub name: String,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<u64>,
    pub is_main: bool,
    pub is_start: bool,
    pub samples: SampleData,
    pub allocations: AllocationData,
    pub markers: Vec<MarkerData>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SampleData {
    pub samples: Vec<u32>,
    pub weights: Vec<u32>,
    pub timestamps: Vec<u64>,
    pub sample_categories: Vec<u8>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AllocationData {
    pub samples: Vec<u32>,
    pub weights: Vec<u32>,
    pub timestamps: Vec<u64>,
}

/// `[type, phase, start, end|null, stack|null, extra|null]`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarkerData(
    pub u8,
    pub u8,
    pub u64,
    pub Option<u64>,
    pub Option<u32>,
    pub Option<MarkerExtraData>,
);

// Fiber first: untagged matching tries variants in order, and the Gc
// variant's all-optional fields would swallow anything.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MarkerExtraData {
    Fiber {
        fiber_id: u64,
    },
    Gc {
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MemoryData {
    pub timestamps: Vec<u64>,
    pub rss: Vec<u64>,
}
