//! Journal and status cache interplay.
//!
//! Covers compaction followed by truncation, and status result reuse
//! decisions driven by journal contents.

#![allow(missing_docs)]

use std::sync::Arc;

use rustc_hash::FxHashMap;

use penumbra::store::status_cache::{ScmFileStatus, ScmStatus, StatusCache, StatusGet};
use penumbra::{Journal, RelativePath, RootId, StoreConfig, TreeEntryKind};

fn rel(path: &str) -> RelativePath {
    RelativePath::new(path).expect("valid path")
}

fn modified(paths: &[&str]) -> Arc<ScmStatus> {
    let mut entries = FxHashMap::default();
    for path in paths {
        entries.insert(rel(path), ScmFileStatus::Modified);
    }
    Arc::new(ScmStatus {
        entries,
        errors: FxHashMap::default(),
    })
}

#[test]
fn compaction_then_truncation() {
    let journal = Journal::new();

    // Create and modify the same file: one compacted delta.
    journal.record_created(rel("foo.txt"), TreeEntryKind::RegularFile);
    journal.record_changed(rel("foo.txt"), TreeEntryKind::RegularFile);
    assert_eq!(journal.entry_count(), 1);

    let range = journal.accumulate_range(1).expect("range");
    let info = range
        .changed_files_in_overlay
        .get(&rel("foo.txt"))
        .expect("compacted entry");
    assert!(!info.existed_before, "creation start state preserved");
    assert!(info.existed_after, "modification end state preserved");

    // Starve the journal and write once more: the old delta is dropped.
    journal.set_memory_limit(1);
    journal.record_created(rel("bar.txt"), TreeEntryKind::RegularFile);

    let range = journal.accumulate_range(1).expect("range");
    assert!(range.is_truncated, "pre-truncation sequences are gone");
    assert!(range.changed_files_in_overlay.is_empty());
}

#[test]
fn status_reuse_across_hg_noise() {
    let journal = Arc::new(Journal::new());
    let cache = StatusCache::new(&StoreConfig::minimal(), Arc::clone(&journal));
    cache.reset_cached_working_dir(RootId::new("c1"));
    let key = StatusCache::make_key(&RootId::new("c1"), false);

    // Advance the journal to sequence 10 and cache a result there.
    for _ in 0..10 {
        journal.record_changed(rel("src/lib.rs"), TreeEntryKind::RegularFile);
    }
    let StatusGet::Compute(promise) = cache.get(&key, 10) else {
        panic!("first status query computes");
    };
    let result = modified(&["src/lib.rs"]);
    promise.fulfill(Ok(Arc::clone(&result)));
    cache.insert(key.clone(), 10, Arc::clone(&result));
    cache.drop_promise(&key, promise.seq());

    // Dirstate churn only: the cached result stays valid at sequence 13.
    for _ in 0..3 {
        journal.record_changed(rel(".hg/dirstate"), TreeEntryKind::RegularFile);
    }
    assert!(cache.is_cached_working_dir_valid(&RootId::new("c1")));
    match cache.get(&key, 13) {
        StatusGet::Ready(cached) => assert_eq!(cached, result),
        _ => panic!("expected cached reuse across .hg-only changes"),
    }

    // A source change at 14 forces a fresh computation.
    journal.record_changed(rel("src/main.rs"), TreeEntryKind::RegularFile);
    assert!(matches!(cache.get(&key, 14), StatusGet::Compute(_)));
}

#[test]
fn checkout_invalidates_status_reuse() {
    let journal = Arc::new(Journal::new());
    let cache = StatusCache::new(&StoreConfig::minimal(), Arc::clone(&journal));
    let key = StatusCache::make_key(&RootId::new("c1"), false);

    journal.record_changed(rel("a.txt"), TreeEntryKind::RegularFile);
    cache.insert(key.clone(), 1, modified(&["a.txt"]));

    journal.record_root_transition(RootId::new("c1"), RootId::new("c2"));
    assert!(
        matches!(cache.get(&key, 2), StatusGet::Compute(_)),
        "a root update in range forbids reuse"
    );
}

#[test]
fn flush_preserves_subscriber_correctness() {
    let journal = Arc::new(Journal::new());
    journal.record_root_update(RootId::new("base"));
    journal.record_created(rel("new.txt"), TreeEntryKind::RegularFile);

    let before = journal.latest_info().expect("non-empty journal");
    journal.flush();

    // The synthetic entry keeps consumers anchored on the same root with a
    // newer sequence, so they resync instead of missing the truncation.
    let info = journal.latest_info().expect("synthetic root update");
    assert!(info.sequence > before.sequence);
    assert_eq!(info.from_root, RootId::new("base"));
    assert_eq!(info.to_root, RootId::new("base"));

    let range = journal.accumulate_range(info.sequence).expect("range");
    assert!(!range.is_truncated);
    assert_eq!(range.snapshot_transitions.len(), 2);
}
