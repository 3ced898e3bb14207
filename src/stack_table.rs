use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::error::ProfileError;
use crate::raw_sample::{Frame, RawSample};
use crate::runtime::{FrameHandle, FuncSymbol, HostRuntime};
use crate::serialization::profile::{FrameTableData, FuncTableData, StackTableData};

pub type StackId = usize;
pub type FrameIdx = usize;
pub type FuncIdx = usize;

/// The symbolicated form of a function, produced during finalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncInfo {
    pub label: String,
    pub filename: String,
    pub first_lineno: i32,
}

impl FuncInfo {
    fn from_symbol(symbol: FuncSymbol) -> FuncInfo {
        FuncInfo {
            // Unresolvable frames are still reported, under a placeholder
            label: symbol.full_label().unwrap_or_else(|| "(nil)".to_string()),
            filename: symbol.display_file().unwrap_or_default(),
            first_lineno: symbol.first_lineno.unwrap_or(0),
        }
    }
}

/// Insertion-ordered deduplicating index: key -> dense index, plus the list
/// of keys in index order.
struct IndexMap<K> {
    to_idx: FxHashMap<K, usize>,
    list: Vec<K>,
}

impl<K: Eq + Hash + Copy> IndexMap<K> {
    fn new() -> Self {
        IndexMap {
            to_idx: FxHashMap::default(),
            list: Vec::new(),
        }
    }

    fn index(&mut self, key: K) -> usize {
        match self.to_idx.get(&key) {
            Some(&idx) => idx,
            None => {
                let idx = self.list.len();
                self.list.push(key);
                self.to_idx.insert(key, idx);
                idx
            }
        }
    }

    fn len(&self) -> usize {
        self.list.len()
    }
}

/// One node of the prefix-shared stack trie. Nodes are append-only and a
/// node's parent always has a strictly smaller index; depth-1 stacks hang
/// off the synthetic root (`parent == None`).
struct StackNode {
    frame: Frame,
    parent: Option<StackId>,
    children: FxHashMap<Frame, StackId>,
}

struct Inner {
    nodes: Vec<StackNode>,
    root_children: FxHashMap<Frame, StackId>,
    frame_map: IndexMap<Frame>,
    func_map: IndexMap<FrameHandle>,
    func_info: Vec<FuncInfo>,
    finalized_idx: usize,
}

impl Inner {
    fn descend(&mut self, parent: Option<StackId>, frame: Frame) -> StackId {
        let existing = match parent {
            Some(idx) => self.nodes[idx].children.get(&frame).copied(),
            None => self.root_children.get(&frame).copied(),
        };
        if let Some(idx) = existing {
            return idx;
        }

        let idx = self.nodes.len();
        self.nodes.push(StackNode {
            frame,
            parent,
            children: FxHashMap::default(),
        });
        match parent {
            Some(p) => {
                self.nodes[p].children.insert(frame, idx);
            }
            None => {
                self.root_children.insert(frame, idx);
            }
        }
        idx
    }
}

/// Interned trie of stacks plus frame and function index maps. One mutex
/// covers node insertion and lookups; symbolication happens outside it (see
/// `finalize`).
pub struct StackTable {
    inner: Mutex<Inner>,
}

impl StackTable {
    pub fn new() -> Self {
        StackTable {
            inner: Mutex::new(Inner {
                nodes: Vec::new(),
                root_children: FxHashMap::default(),
                frame_map: IndexMap::new(),
                func_map: IndexMap::new(),
                func_info: Vec::new(),
                finalized_idx: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Intern a raw sample, walking from the outermost frame down and
    /// creating missing nodes. Deterministic: the same sample always yields
    /// the same id within one table.
    pub fn stack_index(&self, sample: &RawSample) -> Result<StackId, ProfileError> {
        if sample.is_empty() {
            return Err(ProfileError::EmptyStack);
        }

        let mut inner = self.lock();
        let mut node: Option<StackId> = None;
        for i in 0..sample.len() {
            node = Some(inner.descend(node, sample.frame(i)));
        }
        Ok(node.expect("nonempty sample produced no node"))
    }

    /// Parent of a stack, or `None` for depth-1 stacks.
    pub fn parent(&self, stack: StackId) -> Option<StackId> {
        let inner = self.lock();
        assert!(stack < inner.nodes.len(), "stackscope BUG: stack id out of range");
        inner.nodes[stack].parent
    }

    /// Dense index of the stack's own frame in the frame table.
    pub fn frame_index_of(&self, stack: StackId) -> FrameIdx {
        let mut inner = self.lock();
        assert!(stack < inner.nodes.len(), "stackscope BUG: stack id out of range");
        let frame = inner.nodes[stack].frame;
        inner.frame_map.index(frame)
    }

    pub fn stack_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn frame_count(&self) -> usize {
        self.lock().frame_map.len()
    }

    pub fn func_count(&self) -> usize {
        self.lock().func_map.len()
    }

    pub fn func_info(&self, func: FuncIdx) -> Option<FuncInfo> {
        self.lock().func_info.get(func).cloned()
    }

    /// Extend the frame/function index maps over all nodes interned since the
    /// last call, then resolve the new functions. Symbolication calls into
    /// the host and may allocate, trigger GC, or re-enter profiler hooks, so
    /// it must not happen while the table mutex is held.
    pub fn finalize(&self, runtime: &dyn HostRuntime) {
        let (pending, base) = {
            let mut inner = self.lock();
            for i in inner.finalized_idx..inner.nodes.len() {
                let frame = inner.nodes[i].frame;
                inner.frame_map.index(frame);
                inner.func_map.index(frame.handle);
            }
            inner.finalized_idx = inner.nodes.len();
            let base = inner.func_info.len();
            (inner.func_map.list[base..].to_vec(), base)
        };

        if pending.is_empty() {
            return;
        }

        let resolved: Vec<FuncInfo> = pending
            .into_iter()
            .map(|handle| FuncInfo::from_symbol(runtime.symbolicate(handle)))
            .collect();

        let mut inner = self.lock();
        // A concurrent finalize over an overlapping range may have appended
        // part of this range already. func_info only grows and entry i is
        // always the resolution of func_map.list[i], so fill in whatever is
        // still missing past the current length.
        let already_resolved = inner.func_info.len() - base;
        if already_resolved < resolved.len() {
            inner
                .func_info
                .extend(resolved.into_iter().skip(already_resolved));
        }
    }

    /// Reconstruct the root-to-leaf chain of a stack from another table in
    /// this one. Both tables are locked in address order so that two
    /// cross-converting threads cannot deadlock.
    pub fn convert(&self, other: &StackTable, other_stack: StackId) -> StackId {
        if std::ptr::eq(self, other) {
            let inner = self.lock();
            assert!(
                other_stack < inner.nodes.len(),
                "stackscope BUG: stack id out of range"
            );
            return other_stack;
        }

        let (mut mine, theirs) = if (self as *const StackTable) < (other as *const StackTable) {
            let mine = self.lock();
            let theirs = other.lock();
            (mine, theirs)
        } else {
            let theirs = other.lock();
            let mine = self.lock();
            (mine, theirs)
        };

        assert!(
            other_stack < theirs.nodes.len(),
            "stackscope BUG: stack id out of range"
        );

        let mut chain: Vec<Frame> = Vec::new();
        let mut cursor = Some(other_stack);
        while let Some(idx) = cursor {
            let node = &theirs.nodes[idx];
            chain.push(node.frame);
            cursor = node.parent;
        }

        let mut node: Option<StackId> = None;
        for frame in chain.into_iter().rev() {
            node = Some(mine.descend(node, frame));
        }
        node.expect("nonempty chain produced no node")
    }

    /// Visit every frame handle ever interned, so the host's GC keeps them
    /// alive for later symbolication.
    pub fn mark_reachable_frames(&self, visitor: &mut dyn FnMut(FrameHandle)) {
        let inner = self.lock();
        for node in &inner.nodes {
            visitor(node.frame.handle);
        }
    }

    /// Emit the columnar stack/frame/function tables. Call after `finalize`.
    pub fn export(&self) -> (StackTableData, FrameTableData, FuncTableData) {
        let mut inner = self.lock();

        let mut parent: Vec<Option<u32>> = Vec::with_capacity(inner.nodes.len());
        let mut frame: Vec<u32> = Vec::with_capacity(inner.nodes.len());
        for i in 0..inner.nodes.len() {
            let node_frame = inner.nodes[i].frame;
            parent.push(inner.nodes[i].parent.map(|p| p as u32));
            frame.push(inner.frame_map.index(node_frame) as u32);
        }

        let mut func: Vec<u32> = Vec::with_capacity(inner.frame_map.len());
        let mut line: Vec<i32> = Vec::with_capacity(inner.frame_map.len());
        for i in 0..inner.frame_map.len() {
            let f = inner.frame_map.list[i];
            func.push(inner.func_map.index(f.handle) as u32);
            line.push(f.line);
        }

        debug_assert_eq!(inner.func_info.len(), inner.func_map.len());
        let mut name: Vec<String> = Vec::with_capacity(inner.func_info.len());
        let mut filename: Vec<String> = Vec::with_capacity(inner.func_info.len());
        let mut first_line: Vec<i32> = Vec::with_capacity(inner.func_info.len());
        for info in &inner.func_info {
            name.push(info.label.clone());
            filename.push(info.filename.clone());
            first_line.push(info.first_lineno);
        }

        (
            StackTableData { parent, frame },
            FrameTableData { func, line },
            FuncTableData {
                name,
                filename,
                first_line,
            },
        )
    }
}

impl Default for StackTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Amortized per-thread interning path. Consecutive samples from one thread
/// share deep prefixes; by caching the last sample's frames and the stack
/// ids along its path, a new sample only descends the trie for its changed
/// suffix. Not signal-handler safe; invoked only from the sampler thread.
pub struct SampleTranslator {
    frames: Vec<Frame>,
    stack_ids: Vec<StackId>,
}

impl SampleTranslator {
    pub fn new() -> Self {
        SampleTranslator {
            frames: Vec::new(),
            stack_ids: Vec::new(),
        }
    }

    pub fn translate(
        &mut self,
        table: &StackTable,
        sample: &RawSample,
    ) -> Result<StackId, ProfileError> {
        if sample.is_empty() {
            return Err(ProfileError::EmptyStack);
        }

        let mut shared = 0;
        while shared < self.frames.len()
            && shared < sample.len()
            && self.frames[shared] == sample.frame(shared)
        {
            shared += 1;
        }

        let mut inner = table.lock();
        let mut node = if shared == 0 {
            None
        } else {
            Some(self.stack_ids[shared - 1])
        };
        self.frames.truncate(shared);
        self.stack_ids.truncate(shared);

        for i in shared..sample.len() {
            let frame = sample.frame(i);
            let idx = inner.descend(node, frame);
            node = Some(idx);
            self.frames.push(frame);
            self.stack_ids.push(idx);
        }

        Ok(*self.stack_ids.last().expect("nonempty sample produced no node"))
    }
}

impl Default for SampleTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        AllocHook, EventHook, GcDetails, GvlHook, HookHandle, ObjectHandle, SignalSafeRuntime,
        ThreadHandle,
    };

    struct StubRuntime;

    impl SignalSafeRuntime for StubRuntime {
        fn is_managed_thread(&self) -> bool {
            true
        }
        fn in_gc(&self) -> bool {
            false
        }
        fn current_stack(&self, _frames: &mut [FrameHandle], _lines: &mut [i32]) -> usize {
            0
        }
    }

    impl HostRuntime for StubRuntime {
        fn signal_safe(&self) -> &dyn SignalSafeRuntime {
            self
        }
        fn install_gvl_hook(&self, _hook: GvlHook) -> HookHandle {
            0
        }
        fn install_event_hook(&self, _hook: EventHook) -> HookHandle {
            0
        }
        fn install_alloc_hook(&self, _hook: AllocHook) -> HookHandle {
            0
        }
        fn remove_hook(&self, _hook: HookHandle) {}
        fn live_threads(&self) -> Vec<ThreadHandle> {
            vec![]
        }
        fn current_thread(&self) -> ThreadHandle {
            0
        }
        fn main_thread(&self) -> ThreadHandle {
            0
        }
        fn symbolicate(&self, frame: FrameHandle) -> FuncSymbol {
            if frame == 0xdead {
                // A frame whose label cannot be resolved
                return FuncSymbol::default();
            }
            FuncSymbol {
                label: Some(format!("Object#method_{}", frame)),
                file: Some(format!("file_{}.rb", frame)),
                absolute_path: Some(format!("/abs/file_{}.rb", frame)),
                first_lineno: Some(frame as i32),
                ..FuncSymbol::default()
            }
        }
        fn object_size(&self, _object: ObjectHandle) -> usize {
            0
        }
        fn object_location(&self, object: ObjectHandle) -> ObjectHandle {
            object
        }
        fn gc_details(&self) -> GcDetails {
            GcDetails::default()
        }
        fn run_gc(&self) {}
    }

    fn frame(handle: FrameHandle, line: i32) -> Frame {
        Frame { handle, line }
    }

    // Frames innermost-first, as the runtime reports them
    fn raw(frames: &[Frame]) -> RawSample {
        RawSample::from_frames(frames)
    }

    #[test]
    fn test_empty_stack_is_rejected() {
        let table = StackTable::new();
        assert_eq!(table.stack_index(&raw(&[])), Err(ProfileError::EmptyStack));
    }

    #[test]
    fn test_interning_is_idempotent() {
        let table = StackTable::new();
        let sample = raw(&[frame(3, 30), frame(2, 20), frame(1, 10)]);
        let a = table.stack_index(&sample).unwrap();
        let b = table.stack_index(&sample).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.stack_count(), 3);
    }

    #[test]
    fn test_prefix_sharing() {
        let table = StackTable::new();
        let a = table
            .stack_index(&raw(&[frame(2, 20), frame(1, 10)]))
            .unwrap();
        let b = table
            .stack_index(&raw(&[frame(3, 30), frame(1, 10)]))
            .unwrap();
        // Shared root frame, distinct leaves
        assert_eq!(table.stack_count(), 3);
        assert_ne!(a, b);
        assert_eq!(table.parent(a), table.parent(b));
    }

    #[test]
    fn test_parent_is_strictly_smaller() {
        let table = StackTable::new();
        let leaf = table
            .stack_index(&raw(&[frame(4, 4), frame(3, 3), frame(2, 2), frame(1, 1)]))
            .unwrap();
        let mut cursor = Some(leaf);
        while let Some(idx) = cursor {
            let parent = table.parent(idx);
            if let Some(p) = parent {
                assert!(p < idx);
            }
            cursor = parent;
        }
    }

    #[test]
    fn test_root_to_leaf_path_reproduces_sample() {
        let table = StackTable::new();
        let frames = [frame(30, 3), frame(20, 2), frame(10, 1)];
        let leaf = table.stack_index(&raw(&frames)).unwrap();
        table.finalize(&StubRuntime);

        // Walk leaf -> root collecting frame indices, then compare to the
        // original outermost-first sequence through the frame table.
        let (stacks, frame_table, _) = table.export();
        let mut path = vec![];
        let mut cursor = Some(leaf);
        while let Some(idx) = cursor {
            path.push(stacks.frame[idx] as usize);
            cursor = stacks.parent[idx].map(|p| p as usize);
        }
        path.reverse();
        let lines: Vec<i32> = path.iter().map(|&f| frame_table.line[f]).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_repeated_deep_stack_grows_no_new_nodes() {
        let table = StackTable::new();
        let frames: Vec<Frame> = (0..20).map(|i| frame(100 + i, i as i32)).collect();
        let sample = raw(&frames);
        let mut translator = SampleTranslator::new();
        let first = translator.translate(&table, &sample).unwrap();
        for _ in 0..1000 {
            assert_eq!(translator.translate(&table, &sample).unwrap(), first);
        }
        assert_eq!(table.stack_count(), 20);
    }

    #[test]
    fn test_translator_matches_direct_interning() {
        let table = StackTable::new();
        let mut translator = SampleTranslator::new();

        let s1 = raw(&[frame(3, 3), frame(2, 2), frame(1, 1)]);
        let s2 = raw(&[frame(4, 4), frame(2, 2), frame(1, 1)]);
        let s3 = raw(&[frame(1, 9)]);

        for sample in [&s1, &s2, &s3, &s1] {
            let via_translator = translator.translate(&table, sample).unwrap();
            let direct = table.stack_index(sample).unwrap();
            assert_eq!(via_translator, direct);
        }
    }

    #[test]
    fn test_translator_handles_prefix_samples() {
        let table = StackTable::new();
        let mut translator = SampleTranslator::new();
        let deep = raw(&[frame(3, 3), frame(2, 2), frame(1, 1)]);
        let shallow = raw(&[frame(2, 2), frame(1, 1)]);

        translator.translate(&table, &deep).unwrap();
        let a = translator.translate(&table, &shallow).unwrap();
        assert_eq!(a, table.stack_index(&shallow).unwrap());
    }

    #[test]
    fn test_convert_round_trip() {
        let t1 = StackTable::new();
        let t2 = StackTable::new();
        let sample = raw(&[frame(3, 3), frame(2, 2), frame(1, 1)]);

        let id1 = t1.stack_index(&sample).unwrap();
        let converted = t2.convert(&t1, id1);
        assert_eq!(converted, t2.stack_index(&sample).unwrap());

        // Converting within the same table is the identity
        assert_eq!(t1.convert(&t1, id1), id1);
    }

    #[test]
    fn test_finalize_resolves_functions() {
        let table = StackTable::new();
        table
            .stack_index(&raw(&[frame(7, 70), frame(5, 50)]))
            .unwrap();
        table.finalize(&StubRuntime);

        assert_eq!(table.frame_count(), 2);
        assert_eq!(table.func_count(), 2);

        let (_, frame_table, funcs) = table.export();
        let five = frame_table.line.iter().position(|&l| l == 50).unwrap();
        let func = frame_table.func[five] as usize;
        assert_eq!(funcs.name[func], "Object#method_5");
        assert_eq!(funcs.filename[func], "/abs/file_5.rb");
        assert_eq!(funcs.first_line[func], 5);
    }

    #[test]
    fn test_finalize_is_incremental_and_idempotent() {
        let table = StackTable::new();
        table.stack_index(&raw(&[frame(1, 1)])).unwrap();
        table.finalize(&StubRuntime);
        assert_eq!(table.func_count(), 1);

        table
            .stack_index(&raw(&[frame(2, 2), frame(1, 1)]))
            .unwrap();
        table.finalize(&StubRuntime);
        table.finalize(&StubRuntime);
        assert_eq!(table.func_count(), 2);
        assert_eq!(table.frame_count(), 2);
    }

    #[test]
    fn test_concurrent_finalize_loses_no_functions() {
        use std::sync::Arc;

        let table = Arc::new(StackTable::new());
        for i in 0..50u64 {
            table.stack_index(&raw(&[frame(i + 1, 1)])).unwrap();
        }

        let concurrent = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || table.finalize(&StubRuntime))
        };
        table.finalize(&StubRuntime);
        concurrent.join().unwrap();
        table.finalize(&StubRuntime);

        // However the two calls interleaved, every function must end up
        // resolved, in index order
        assert_eq!(table.func_count(), 50);
        for i in 0..50 {
            assert_eq!(
                table.func_info(i).unwrap().label,
                format!("Object#method_{}", i + 1)
            );
        }
    }

    #[test]
    fn test_unresolvable_function_gets_placeholder() {
        let table = StackTable::new();
        table.stack_index(&raw(&[frame(0xdead, 1)])).unwrap();
        table.finalize(&StubRuntime);
        let (_, _, funcs) = table.export();
        assert_eq!(funcs.name[0], "(nil)");
        assert_eq!(funcs.first_line[0], 0);
    }

    #[test]
    fn test_mark_reachable_frames_visits_all_handles() {
        let table = StackTable::new();
        table
            .stack_index(&raw(&[frame(3, 3), frame(2, 2), frame(1, 1)]))
            .unwrap();
        table.stack_index(&raw(&[frame(4, 4)])).unwrap();

        let mut seen = vec![];
        table.mark_reachable_frames(&mut |handle| seen.push(handle));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_same_frames_different_lines_are_distinct() {
        let table = StackTable::new();
        let a = table.stack_index(&raw(&[frame(1, 10)])).unwrap();
        let b = table.stack_index(&raw(&[frame(1, 11)])).unwrap();
        assert_ne!(a, b);
        table.finalize(&StubRuntime);
        // Two frames, one function
        assert_eq!(table.frame_count(), 2);
        assert_eq!(table.func_count(), 1);
    }
}
