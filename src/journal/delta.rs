//! Delta records stored by the journal.

use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::model::{RelativePath, RootId, TreeEntryKind};

/// Position of a delta in a mount's journal. Strictly increasing, never
/// reused.
pub type SequenceNumber = u64;

/// Whether a path existed at the start and end of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChangeInfo {
    /// Whether this path existed at the start of this delta.
    pub existed_before: bool,
    /// Whether this path existed at the end of this delta. A path with
    /// `existed_after && !existed_before` is new in this delta.
    pub existed_after: bool,
}

impl PathChangeInfo {
    pub(crate) fn new(existed_before: bool, existed_after: bool) -> Self {
        Self {
            existed_before,
            existed_after,
        }
    }

    pub(crate) fn characterization(&self) -> &'static str {
        match (self.existed_before, self.existed_after) {
            (true, false) => "Removed",
            (false, true) => "Created",
            (true, true) => "Changed",
            (false, false) => "Ghost",
        }
    }
}

/// The action a file-change delta records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    /// `path1` was created.
    Created,
    /// `path1` was removed.
    Removed,
    /// `path1` changed in place.
    Changed,
    /// `path2` came into existence as the destination of a rename of
    /// `path1`.
    Renamed,
    /// `path2` was overwritten by `path1` as the result of a rename.
    Replaced,
}

/// A delta recording changed files.
#[derive(Debug, Clone)]
pub struct FileChangeDelta {
    /// Journal position.
    pub sequence: SequenceNumber,
    /// When the change was recorded (steady clock).
    pub time: Instant,
    /// The action recorded.
    pub kind: FileChangeKind,
    /// Entry type of the affected path. A rename keeps the type; a replace
    /// takes the type of the source.
    pub dtype: TreeEntryKind,
    /// First path and its existence transition.
    pub path1: RelativePath,
    /// Existence transition for `path1`.
    pub info1: PathChangeInfo,
    /// Second path, only set for `Renamed` / `Replaced`.
    pub path2: Option<(RelativePath, PathChangeInfo)>,
}

impl FileChangeDelta {
    /// True for a single-path modification (`Created`/`Removed`/`Changed`).
    pub fn is_modification(&self) -> bool {
        matches!(
            self.kind,
            FileChangeKind::Created | FileChangeKind::Removed | FileChangeKind::Changed
        )
    }

    /// True when `other` touches the same paths with the same dtype,
    /// disregarding sequence, time, and existence transitions. Two such
    /// deltas form one modification chain and may be compacted.
    pub fn is_same_action(&self, other: &FileChangeDelta) -> bool {
        self.dtype == other.dtype
            && self.path1 == other.path1
            && self.path2.as_ref().map(|(p, _)| p) == other.path2.as_ref().map(|(p, _)| p)
    }

    /// All paths this delta touched, with their existence transitions.
    pub fn changed_files_in_overlay(&self) -> FxHashMap<RelativePath, PathChangeInfo> {
        let mut changed = FxHashMap::default();
        changed.insert(self.path1.clone(), self.info1);
        if let Some((path2, info2)) = &self.path2 {
            changed.insert(path2.clone(), *info2);
        }
        changed
    }

    /// Bytes attributed to this delta for journal memory accounting.
    pub fn estimate_memory_usage(&self) -> usize {
        let mut usage = std::mem::size_of::<Self>() + self.path1.size_bytes();
        if let Some((path2, _)) = &self.path2 {
            usage += path2.size_bytes();
        }
        usage
    }
}

/// A delta recording a change of the checked-out root.
#[derive(Debug, Clone)]
pub struct RootUpdateDelta {
    /// Journal position.
    pub sequence: SequenceNumber,
    /// When the change was recorded (steady clock).
    pub time: Instant,
    /// The root this update moved away from. The root moved to is captured
    /// by the journal's current root.
    pub from_root: RootId,
    /// Files whose status differed across the update.
    pub unclean_paths: FxHashSet<RelativePath>,
}

impl RootUpdateDelta {
    /// Bytes attributed to this delta for journal memory accounting.
    pub fn estimate_memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.from_root.value().len()
            + self
                .unclean_paths
                .iter()
                .map(RelativePath::size_bytes)
                .sum::<usize>()
    }
}

/// Summary of the newest delta, used by consumers to learn the journal's
/// current position without accumulating a range.
#[derive(Debug, Clone)]
pub struct JournalDeltaInfo {
    /// Root before the newest delta.
    pub from_root: RootId,
    /// Root after the newest delta.
    pub to_root: RootId,
    /// Sequence of the newest delta.
    pub sequence: SequenceNumber,
    /// Time of the newest delta.
    pub time: Instant,
}

/// Accumulated view of all deltas at or after a requested sequence.
#[derive(Debug)]
pub struct JournalDeltaRange {
    /// Lowest sequence merged into this range.
    pub from_sequence: SequenceNumber,
    /// Highest sequence merged into this range.
    pub to_sequence: SequenceNumber,
    /// Time of the oldest merged delta.
    pub from_time: Instant,
    /// Time of the newest merged delta.
    pub to_time: Instant,
    /// Roots traversed, oldest first. One entry when no root update is in
    /// range; entries are not unique (`[A, B, A]` happens).
    pub snapshot_transitions: Vec<RootId>,
    /// Files changed in range, with existence transitions widened backwards
    /// in time.
    pub changed_files_in_overlay: FxHashMap<RelativePath, PathChangeInfo>,
    /// Union of the unclean path sets of the root updates in range.
    pub unclean_paths: FxHashSet<RelativePath>,
    /// Set when the requested sequence precedes the oldest kept delta; the
    /// rest of the range is unusable and the consumer should resync.
    pub is_truncated: bool,
    /// True while every changed path lives under `.hg`.
    pub contains_hg_only_changes: bool,
    /// True when the range crossed at least one root update.
    pub contains_root_update: bool,
}

impl JournalDeltaRange {
    pub(crate) fn truncated() -> Self {
        let now = Instant::now();
        Self {
            from_sequence: 0,
            to_sequence: 0,
            from_time: now,
            to_time: now,
            snapshot_transitions: Vec::new(),
            changed_files_in_overlay: FxHashMap::default(),
            unclean_paths: FxHashSet::default(),
            is_truncated: true,
            contains_hg_only_changes: true,
            contains_root_update: false,
        }
    }

    pub(crate) fn starting_at(sequence: SequenceNumber, time: Instant, current_root: RootId) -> Self {
        Self {
            from_sequence: sequence,
            to_sequence: sequence,
            from_time: time,
            to_time: time,
            snapshot_transitions: vec![current_root],
            changed_files_in_overlay: FxHashMap::default(),
            unclean_paths: FxHashSet::default(),
            is_truncated: false,
            contains_hg_only_changes: true,
            contains_root_update: false,
        }
    }
}
