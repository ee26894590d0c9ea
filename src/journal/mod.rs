//! The journal: an in-memory, bounded, ordered log of filesystem deltas.
//!
//! Writers record file changes and root updates; consumers replay them with
//! [`Journal::accumulate_range`] keyed by sequence number. The log is held
//! in two deques (file changes and root updates) merged by sequence on
//! iteration, compacts runs of identical modifications in place, and drops
//! its oldest entries when a memory limit is exceeded. A consumer whose
//! request precedes the oldest kept entry observes a truncation and is
//! expected to resync.

pub mod delta;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error};

use crate::model::{RelativePath, RootId, TreeEntryKind};
pub use delta::{
    FileChangeDelta, FileChangeKind, JournalDeltaInfo, JournalDeltaRange, PathChangeInfo,
    RootUpdateDelta, SequenceNumber,
};

/// Default memory budget for kept deltas.
pub const DEFAULT_MEMORY_LIMIT: usize = 1 << 30;

/// Sentinel directory whose changes never invalidate status results.
const HG_DIR: &str = ".hg";

/// Callback invoked (outside all journal locks) after a write that followed
/// an observation of the journal's latest state.
pub type SubscriberCallback = Arc<dyn Fn() + Send + Sync>;

/// Aggregate statistics over the kept deltas.
#[derive(Debug, Clone)]
pub struct JournalStats {
    /// Number of deltas currently kept (after compaction).
    pub entry_count: u64,
    /// Time of the oldest kept delta.
    pub earliest_timestamp: Instant,
    /// Time of the newest kept delta.
    pub latest_timestamp: Instant,
    /// Largest number of files merged by a single range accumulation.
    pub max_files_accumulated: usize,
}

enum DeltaRef<'a> {
    FileChange(&'a FileChangeDelta),
    RootUpdate(&'a RootUpdateDelta),
}

impl DeltaRef<'_> {
    fn sequence(&self) -> SequenceNumber {
        match self {
            DeltaRef::FileChange(d) => d.sequence,
            DeltaRef::RootUpdate(d) => d.sequence,
        }
    }

    fn time(&self) -> Instant {
        match self {
            DeltaRef::FileChange(d) => d.time,
            DeltaRef::RootUpdate(d) => d.time,
        }
    }

    fn estimate_memory_usage(&self) -> usize {
        match self {
            DeltaRef::FileChange(d) => d.estimate_memory_usage(),
            DeltaRef::RootUpdate(d) => d.estimate_memory_usage(),
        }
    }
}

struct DeltaState {
    file_change_deltas: VecDeque<FileChangeDelta>,
    root_update_deltas: VecDeque<RootUpdateDelta>,
    next_sequence: SequenceNumber,
    current_root: RootId,
    memory_limit: usize,
    delta_memory_usage: usize,
    stats: Option<JournalStats>,
    last_modification_has_been_observed: bool,
}

impl DeltaState {
    fn empty(&self) -> bool {
        self.file_change_deltas.is_empty() && self.root_update_deltas.is_empty()
    }

    fn front(&self) -> Option<DeltaRef<'_>> {
        match (
            self.file_change_deltas.front(),
            self.root_update_deltas.front(),
        ) {
            (Some(file), Some(root)) => {
                if file.sequence < root.sequence {
                    Some(DeltaRef::FileChange(file))
                } else {
                    Some(DeltaRef::RootUpdate(root))
                }
            }
            (Some(file), None) => Some(DeltaRef::FileChange(file)),
            (None, Some(root)) => Some(DeltaRef::RootUpdate(root)),
            (None, None) => None,
        }
    }

    fn pop_front(&mut self) {
        match (
            self.file_change_deltas.front(),
            self.root_update_deltas.front(),
        ) {
            (Some(file), Some(root)) => {
                if file.sequence < root.sequence {
                    self.file_change_deltas.pop_front();
                } else {
                    self.root_update_deltas.pop_front();
                }
            }
            (Some(_), None) => {
                self.file_change_deltas.pop_front();
            }
            (None, Some(_)) => {
                self.root_update_deltas.pop_front();
            }
            (None, None) => {}
        }
    }

    fn front_sequence(&self) -> Option<SequenceNumber> {
        self.front().map(|d| d.sequence())
    }

    fn is_file_change_in_back(&self) -> bool {
        match (
            self.file_change_deltas.back(),
            self.root_update_deltas.back(),
        ) {
            (Some(file), Some(root)) => file.sequence > root.sequence,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

struct SubscriberState {
    next_subscriber_id: u64,
    subscribers: FxHashMap<u64, SubscriberCallback>,
}

/// A per-mount ordered log of filesystem deltas.
pub struct Journal {
    delta_state: Mutex<DeltaState>,
    subscriber_state: RwLock<SubscriberState>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    /// Create an empty journal with the default memory limit.
    pub fn new() -> Self {
        Self::with_memory_limit(DEFAULT_MEMORY_LIMIT)
    }

    /// Create an empty journal bounded by `memory_limit` bytes of deltas.
    pub fn with_memory_limit(memory_limit: usize) -> Self {
        Self {
            delta_state: Mutex::new(DeltaState {
                file_change_deltas: VecDeque::new(),
                root_update_deltas: VecDeque::new(),
                next_sequence: 1,
                current_root: RootId::null(),
                memory_limit,
                delta_memory_usage: 0,
                stats: None,
                last_modification_has_been_observed: false,
            }),
            subscriber_state: RwLock::new(SubscriberState {
                next_subscriber_id: 1,
                subscribers: FxHashMap::default(),
            }),
        }
    }

    /// Record the creation of `path`.
    pub fn record_created(&self, path: RelativePath, dtype: TreeEntryKind) {
        self.add_file_change(
            FileChangeKind::Created,
            dtype,
            path,
            PathChangeInfo::new(false, true),
            None,
        );
    }

    /// Record the removal of `path`.
    pub fn record_removed(&self, path: RelativePath, dtype: TreeEntryKind) {
        self.add_file_change(
            FileChangeKind::Removed,
            dtype,
            path,
            PathChangeInfo::new(true, false),
            None,
        );
    }

    /// Record an in-place change of `path`.
    pub fn record_changed(&self, path: RelativePath, dtype: TreeEntryKind) {
        self.add_file_change(
            FileChangeKind::Changed,
            dtype,
            path,
            PathChangeInfo::new(true, true),
            None,
        );
    }

    /// Record `old_path` being renamed to a previously-absent `new_path`.
    pub fn record_renamed(
        &self,
        old_path: RelativePath,
        new_path: RelativePath,
        dtype: TreeEntryKind,
    ) {
        self.add_file_change(
            FileChangeKind::Renamed,
            dtype,
            old_path,
            PathChangeInfo::new(true, false),
            Some((new_path, PathChangeInfo::new(false, true))),
        );
    }

    /// Record `old_path` overwriting an existing `new_path`.
    pub fn record_replaced(
        &self,
        old_path: RelativePath,
        new_path: RelativePath,
        dtype: TreeEntryKind,
    ) {
        self.add_file_change(
            FileChangeKind::Replaced,
            dtype,
            old_path,
            PathChangeInfo::new(true, false),
            Some((new_path, PathChangeInfo::new(true, true))),
        );
    }

    /// Record an update to `to_root`, taking the previous root from the
    /// journal's current root.
    pub fn record_root_update(&self, to_root: RootId) {
        self.add_root_update(None, to_root, FxHashSet::default());
    }

    /// Record an update from `from_root` to `to_root`. A no-op when the two
    /// are equal.
    pub fn record_root_transition(&self, from_root: RootId, to_root: RootId) {
        if from_root == to_root {
            return;
        }
        self.add_root_update(Some(from_root), to_root, FxHashSet::default());
    }

    /// Record an update carrying the set of paths whose status differed
    /// across it. A no-op when the roots are equal and the set is empty.
    pub fn record_unclean_paths(
        &self,
        from_root: RootId,
        to_root: RootId,
        unclean_paths: FxHashSet<RelativePath>,
    ) {
        if from_root == to_root && unclean_paths.is_empty() {
            return;
        }
        self.add_root_update(Some(from_root), to_root, unclean_paths);
    }

    /// Drop every kept delta while keeping subscribers correct across the
    /// truncation: the sequence advances and a synthetic root update whose
    /// `from_root` equals the current root is appended, so the next range
    /// accumulation observes a root transition rather than silence.
    pub fn flush(&self) {
        let should_notify = {
            let mut state = self.delta_state.lock();
            state.next_sequence += 1;
            let last_root = state.current_root.clone();
            state.file_change_deltas.clear();
            state.root_update_deltas.clear();
            state.stats = None;
            state.delta_memory_usage = 0;
            // Deliberately bypasses the from == to no-op check.
            self.add_root_update_locked(&mut state, Some(last_root.clone()), last_root, FxHashSet::default())
        };
        if should_notify {
            self.notify_subscribers();
        }
    }

    fn add_file_change(
        &self,
        kind: FileChangeKind,
        dtype: TreeEntryKind,
        path1: RelativePath,
        info1: PathChangeInfo,
        path2: Option<(RelativePath, PathChangeInfo)>,
    ) {
        let should_notify = {
            let mut state = self.delta_state.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let delta = FileChangeDelta {
                sequence,
                time: Instant::now(),
                kind,
                dtype,
                path1,
                info1,
                path2,
            };
            Self::truncate_if_necessary(&mut state);
            if !Self::compact(&mut state, &delta) {
                Self::append_file_change(&mut state, delta);
            }
            Self::finish_add(&mut state)
        };
        if should_notify {
            self.notify_subscribers();
        }
    }

    fn add_root_update(
        &self,
        from_root: Option<RootId>,
        to_root: RootId,
        unclean_paths: FxHashSet<RelativePath>,
    ) {
        let should_notify = {
            let mut state = self.delta_state.lock();
            self.add_root_update_locked(&mut state, from_root, to_root, unclean_paths)
        };
        if should_notify {
            self.notify_subscribers();
        }
    }

    fn add_root_update_locked(
        &self,
        state: &mut DeltaState,
        from_root: Option<RootId>,
        to_root: RootId,
        unclean_paths: FxHashSet<RelativePath>,
    ) -> bool {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let delta = RootUpdateDelta {
            sequence,
            time: Instant::now(),
            // Absent means "continue from wherever the journal is".
            from_root: from_root.unwrap_or_else(|| state.current_root.clone()),
            unclean_paths,
        };
        Self::truncate_if_necessary(state);
        // Root updates never compact.
        let usage = delta.estimate_memory_usage();
        let time = delta.time;
        state.root_update_deltas.push_back(delta);
        Self::account_append(state, usage, time);
        state.current_root = to_root;
        Self::finish_add(state)
    }

    fn append_file_change(state: &mut DeltaState, delta: FileChangeDelta) {
        let usage = delta.estimate_memory_usage();
        let time = delta.time;
        state.file_change_deltas.push_back(delta);
        Self::account_append(state, usage, time);
    }

    fn account_append(state: &mut DeltaState, usage: usize, time: Instant) {
        match &mut state.stats {
            Some(stats) => {
                stats.entry_count += 1;
                state.delta_memory_usage += usage;
                stats.latest_timestamp = time;
            }
            None => {
                state.stats = Some(JournalStats {
                    entry_count: 1,
                    earliest_timestamp: time,
                    latest_timestamp: time,
                    max_files_accumulated: 0,
                });
                state.delta_memory_usage = usage;
            }
        }
    }

    fn finish_add(state: &mut DeltaState) -> bool {
        let front_time = state.front().map(|front| front.time());
        if let (Some(stats), Some(time)) = (&mut state.stats, front_time) {
            stats.earliest_timestamp = time;
        }
        let should_notify = state.last_modification_has_been_observed;
        state.last_modification_has_been_observed = false;
        should_notify
    }

    /// A new modification folds into the newest delta when that delta is a
    /// file change on the same paths with the same dtype. The merged delta
    /// keeps the slot, takes the new sequence and time, and preserves end
    /// state: it starts where the old delta started and ends where the new
    /// one ends, so a create followed by a change still reads as a create.
    fn compact(state: &mut DeltaState, delta: &FileChangeDelta) -> bool {
        if !delta.is_modification() || !state.is_file_change_in_back() {
            return false;
        }
        let Some(back) = state.file_change_deltas.back_mut() else {
            return false;
        };
        if !delta.is_same_action(back) {
            return false;
        }
        let old_usage = back.estimate_memory_usage();
        let new_usage = delta.estimate_memory_usage();
        if let Some(stats) = &mut state.stats {
            stats.latest_timestamp = delta.time;
        }
        let mut merged = delta.clone();
        merged.info1.existed_before = back.info1.existed_before;
        if let (Some((_, merged_info)), Some((_, back_info))) =
            (&mut merged.path2, &back.path2)
        {
            merged_info.existed_before = back_info.existed_before;
        }
        *back = merged;
        state.delta_memory_usage = state.delta_memory_usage - old_usage + new_usage;
        true
    }

    fn truncate_if_necessary(state: &mut DeltaState) {
        loop {
            if Self::estimate_memory_usage_locked(state) <= state.memory_limit {
                break;
            }
            let usage = match state.front() {
                Some(front) => front.estimate_memory_usage(),
                None => break,
            };
            if let Some(stats) = &mut state.stats {
                stats.entry_count = stats.entry_count.saturating_sub(1);
            }
            state.delta_memory_usage = state.delta_memory_usage.saturating_sub(usage);
            state.pop_front();
        }
    }

    fn estimate_memory_usage_locked(state: &DeltaState) -> usize {
        // Fixed header plus slack the deque buffers hold beyond their
        // occupied slots.
        let mut usage = std::mem::size_of::<Journal>();
        usage += (state.file_change_deltas.capacity() - state.file_change_deltas.len())
            * std::mem::size_of::<FileChangeDelta>();
        usage += (state.root_update_deltas.capacity() - state.root_update_deltas.len())
            * std::mem::size_of::<RootUpdateDelta>();
        if state.stats.is_some() {
            usage += state.delta_memory_usage;
        }
        usage
    }

    /// Estimated bytes held by the journal.
    pub fn estimate_memory_usage(&self) -> usize {
        Self::estimate_memory_usage_locked(&self.delta_state.lock())
    }

    /// Replace the memory limit. Takes effect on the next write.
    pub fn set_memory_limit(&self, limit: usize) {
        self.delta_state.lock().memory_limit = limit;
    }

    /// The current memory limit.
    pub fn memory_limit(&self) -> usize {
        self.delta_state.lock().memory_limit
    }

    /// Statistics over the kept deltas, if any have been recorded.
    pub fn stats(&self) -> Option<JournalStats> {
        self.delta_state.lock().stats.clone()
    }

    /// The journal's current root.
    pub fn current_root(&self) -> RootId {
        self.delta_state.lock().current_root.clone()
    }

    /// Summary of the newest delta. Marks the journal observed, so the next
    /// write triggers subscriber notification.
    pub fn latest_info(&self) -> Option<JournalDeltaInfo> {
        let mut state = self.delta_state.lock();
        state.last_modification_has_been_observed = true;
        if state.empty() {
            return None;
        }
        Some(if state.is_file_change_in_back() {
            let back = state.file_change_deltas.back().expect("non-empty deque");
            JournalDeltaInfo {
                from_root: state.current_root.clone(),
                to_root: state.current_root.clone(),
                sequence: back.sequence,
                time: back.time,
            }
        } else {
            let back = state.root_update_deltas.back().expect("non-empty deque");
            JournalDeltaInfo {
                from_root: back.from_root.clone(),
                to_root: state.current_root.clone(),
                sequence: back.sequence,
                time: back.time,
            }
        })
    }

    /// Register a subscriber. The callback runs after any write that
    /// followed an observation of the journal, outside all journal locks.
    pub fn register_subscriber(&self, callback: SubscriberCallback) -> u64 {
        let mut state = self.subscriber_state.write();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(id, callback);
        id
    }

    /// Remove a subscriber. The callback is destroyed outside the lock; its
    /// drop may re-enter the journal.
    pub fn cancel_subscriber(&self, id: u64) {
        let callback = {
            let mut state = self.subscriber_state.write();
            state.subscribers.remove(&id)
        };
        drop(callback);
    }

    /// Remove every subscriber, destroying the callbacks outside the lock.
    pub fn cancel_all_subscribers(&self) {
        let callbacks = {
            let mut state = self.subscriber_state.write();
            std::mem::take(&mut state.subscribers)
        };
        drop(callbacks);
    }

    /// True while `id` names a registered subscriber.
    pub fn is_subscriber_valid(&self, id: u64) -> bool {
        self.subscriber_state.read().subscribers.contains_key(&id)
    }

    fn notify_subscribers(&self) {
        let subscribers: Vec<SubscriberCallback> = {
            let state = self.subscriber_state.read();
            state.subscribers.values().cloned().collect()
        };
        for subscriber in subscribers {
            subscriber();
        }
    }

    /// Merge every delta with sequence ≥ `from` into a single range, newest
    /// to oldest. Returns `None` on an empty journal. Marks the journal
    /// observed.
    pub fn accumulate_range(&self, from: SequenceNumber) -> Option<JournalDeltaRange> {
        debug_assert!(from > 0);
        let mut state = self.delta_state.lock();

        let mut result: Option<JournalDeltaRange> = None;
        let mut files_accumulated = 0usize;

        if !state.empty() && state.front_sequence().unwrap_or(0) > from {
            // The requested range starts before anything we kept.
            result = Some(JournalDeltaRange::truncated());
        } else {
            let current_root = state.current_root.clone();
            Self::for_each_delta_locked(&state, from, None, &mut |delta| {
                let (sequence, time) = (delta.sequence(), delta.time());
                let range = result.get_or_insert_with(|| {
                    JournalDeltaRange::starting_at(sequence, time, current_root.clone())
                });
                // Walking newest to oldest: each visit lowers the bound.
                range.from_sequence = sequence;
                range.from_time = time;

                match delta {
                    DeltaRef::FileChange(current) => {
                        files_accumulated += 1;
                        for (name, current_info) in current.changed_files_in_overlay() {
                            if range.contains_hg_only_changes
                                && name.first_component() != Some(HG_DIR)
                            {
                                range.contains_hg_only_changes = false;
                            }
                            match range.changed_files_in_overlay.get_mut(&name) {
                                None => {
                                    range.changed_files_in_overlay.insert(name, current_info);
                                }
                                Some(merged) => {
                                    if merged.existed_before != current_info.existed_after {
                                        error!(
                                            path = %name,
                                            older = current_info.characterization(),
                                            newer = merged.characterization(),
                                            "journal holds an inconsistent event sequence"
                                        );
                                    }
                                    // The oldest delta's starting state wins.
                                    merged.existed_before = current_info.existed_before;
                                }
                            }
                        }
                    }
                    DeltaRef::RootUpdate(current) => {
                        range.snapshot_transitions.push(current.from_root.clone());
                        range
                            .unclean_paths
                            .extend(current.unclean_paths.iter().cloned());
                    }
                }
                true
            });
        }

        if let Some(range) = &mut result {
            if range.is_truncated {
                debug!(from, "journal range request truncated");
            }
            if let Some(stats) = &mut state.stats {
                stats.max_files_accumulated = stats.max_files_accumulated.max(files_accumulated);
            }
            range.snapshot_transitions.reverse();
            range.contains_root_update = range.snapshot_transitions.len() > 1;
        }

        state.last_modification_has_been_observed = true;
        result
    }

    /// Walk deltas newest to oldest, stopping at `from`, after `limit`
    /// deltas, or when a callback returns `false`. Returns `true` when the
    /// requested start precedes the oldest kept delta (the walk is then
    /// skipped). Marks the journal observed.
    pub fn for_each_delta(
        &self,
        from: SequenceNumber,
        limit: Option<usize>,
        mut file_change_callback: impl FnMut(&FileChangeDelta) -> bool,
        mut root_update_callback: impl FnMut(&RootUpdateDelta) -> bool,
    ) -> bool {
        debug_assert!(from > 0);
        let mut state = self.delta_state.lock();
        let truncated = !state.empty() && state.front_sequence().unwrap_or(0) > from;
        if !truncated {
            Self::for_each_delta_locked(&state, from, limit, &mut |delta| match delta {
                DeltaRef::FileChange(current) => file_change_callback(current),
                DeltaRef::RootUpdate(current) => root_update_callback(current),
            });
        }
        state.last_modification_has_been_observed = true;
        truncated
    }

    /// Number of deltas currently kept. Test and debugging aid.
    pub fn entry_count(&self) -> usize {
        let state = self.delta_state.lock();
        state.file_change_deltas.len() + state.root_update_deltas.len()
    }

    fn for_each_delta_locked(
        state: &DeltaState,
        from: SequenceNumber,
        limit: Option<usize>,
        visitor: &mut dyn FnMut(DeltaRef<'_>) -> bool,
    ) {
        let mut file_iter = state.file_change_deltas.iter().rev().peekable();
        let mut root_iter = state.root_update_deltas.iter().rev().peekable();
        let mut iterations = 0usize;

        loop {
            let is_file_change = match (file_iter.peek(), root_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(file), Some(root)) => file.sequence > root.sequence,
            };
            let delta = if is_file_change {
                DeltaRef::FileChange(*file_iter.peek().expect("peeked above"))
            } else {
                DeltaRef::RootUpdate(*root_iter.peek().expect("peeked above"))
            };
            if delta.sequence() < from {
                break;
            }
            if let Some(limit) = limit {
                if iterations >= limit {
                    break;
                }
            }
            if !visitor(delta) {
                break;
            }
            if is_file_change {
                file_iter.next();
            } else {
                root_iter.next();
            }
            iterations += 1;
        }
    }
}
