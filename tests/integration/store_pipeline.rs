//! End-to-end object store pipeline tests.
//!
//! Drives the full lookup path (memory cache, local store, queue, worker
//! pool, backing store) through a fake backing store, and checks request
//! deduplication, origin reporting, write-back policy, the blob equality
//! fast path, and trace archiving.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use penumbra::context::FetchContext;
use penumbra::store::backing::{
    bijective_compare, BackingStore, BlobAuxFetch, BlobFetch, ObjectComparison, TreeAuxFetch,
    TreeFetch,
};
use penumbra::store::trace::TraceEventType;
use penumbra::store::with_timeout;
use penumbra::{
    Blob, BlobAuxData, CaseSensitivity, FetchCause, FetchOrigin, LocalStore, ObjectId, ObjectKind,
    ObjectStore, PathComponent, RelativePath, RootId, StoreConfig, StoreError, Tree, TreeEntry,
    TreeEntryKind,
};

/// In-memory backing store with per-family fetch counters and an optional
/// gate that holds blob fetches until released.
#[derive(Default)]
struct FakeBackingStore {
    blobs: Mutex<FxHashMap<ObjectId, Vec<u8>>>,
    trees: Mutex<FxHashMap<ObjectId, Tree>>,
    root_trees: Mutex<FxHashMap<RootId, Tree>>,
    blob_aux: Mutex<FxHashMap<ObjectId, BlobAuxData>>,
    blob_fetches: AtomicU64,
    tree_fetches: AtomicU64,
    prefetched: Mutex<Vec<ObjectId>>,
    compare_unknown: bool,
    gate: Mutex<bool>,
    gate_cv: Condvar,
}

impl FakeBackingStore {
    fn new() -> Self {
        Self::default()
    }

    fn with_unknown_comparison() -> Self {
        Self {
            compare_unknown: true,
            ..Self::default()
        }
    }

    fn put_blob(&self, id: ObjectId, contents: &[u8]) {
        self.blobs.lock().insert(id, contents.to_vec());
    }

    fn put_root_tree(&self, root: RootId, tree: Tree) {
        self.root_trees.lock().insert(root, tree);
    }

    fn close_gate(&self) {
        *self.gate.lock() = true;
    }

    fn open_gate(&self) {
        *self.gate.lock() = false;
        self.gate_cv.notify_all();
    }

    fn wait_at_gate(&self) {
        let mut closed = self.gate.lock();
        while *closed {
            self.gate_cv.wait(&mut closed);
        }
    }

    fn blob_fetch_count(&self) -> u64 {
        self.blob_fetches.load(Ordering::SeqCst)
    }
}

impl BackingStore for FakeBackingStore {
    fn parse_root_id(&self, root_id: &str) -> penumbra::Result<RootId> {
        Ok(RootId::new(root_id))
    }

    fn render_root_id(&self, root_id: &RootId) -> String {
        root_id.value().to_owned()
    }

    fn parse_object_id(&self, object_id: &str) -> penumbra::Result<ObjectId> {
        ObjectId::from_hex(object_id)
    }

    fn render_object_id(&self, object_id: &ObjectId) -> String {
        object_id.to_string()
    }

    fn compare_objects_by_id(&self, one: &ObjectId, two: &ObjectId) -> ObjectComparison {
        if self.compare_unknown {
            ObjectComparison::Unknown
        } else {
            bijective_compare(one, two)
        }
    }

    fn get_root_tree(
        &self,
        root_id: &RootId,
        _context: &FetchContext,
    ) -> penumbra::Result<Tree> {
        self.root_trees
            .lock()
            .get(root_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::Tree, root_id))
    }

    fn get_tree(&self, id: &ObjectId, _context: &FetchContext) -> penumbra::Result<TreeFetch> {
        self.tree_fetches.fetch_add(1, Ordering::SeqCst);
        self.trees
            .lock()
            .get(id)
            .cloned()
            .map(|tree| TreeFetch {
                tree,
                origin: FetchOrigin::FromNetworkFetch,
            })
            .ok_or_else(|| StoreError::not_found(ObjectKind::Tree, id))
    }

    fn get_blob(&self, id: &ObjectId, _context: &FetchContext) -> penumbra::Result<BlobFetch> {
        self.wait_at_gate();
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .get(id)
            .map(|contents| BlobFetch {
                blob: Blob::new(id.clone(), contents.clone()),
                origin: FetchOrigin::FromNetworkFetch,
            })
            .ok_or_else(|| StoreError::not_found(ObjectKind::Blob, id))
    }

    fn get_blob_aux_data(
        &self,
        id: &ObjectId,
        _context: &FetchContext,
    ) -> penumbra::Result<BlobAuxFetch> {
        Ok(BlobAuxFetch {
            aux: self.blob_aux.lock().get(id).copied(),
            origin: FetchOrigin::FromNetworkFetch,
        })
    }

    fn get_tree_aux_data(
        &self,
        _id: &ObjectId,
        _context: &FetchContext,
    ) -> penumbra::Result<TreeAuxFetch> {
        Ok(TreeAuxFetch {
            aux: None,
            origin: FetchOrigin::FromNetworkFetch,
        })
    }

    fn prefetch_blobs(
        &self,
        ids: &[ObjectId],
        _context: &FetchContext,
    ) -> penumbra::Result<()> {
        self.prefetched.lock().extend_from_slice(ids);
        Ok(())
    }

    fn stop_recording_fetch(&self) -> FxHashSet<RelativePath> {
        FxHashSet::default()
    }
}

fn oid(byte: u8) -> ObjectId {
    ObjectId::from_bytes(vec![byte; 20])
}

fn store_over(backing: Arc<FakeBackingStore>) -> Arc<ObjectStore> {
    penumbra::logging::init();
    let local = LocalStore::in_memory().expect("in-memory local store");
    ObjectStore::new(StoreConfig::minimal(), local, backing)
}

#[tokio::test]
async fn blob_fetch_walks_the_tiers() {
    let backing = Arc::new(FakeBackingStore::new());
    backing.put_blob(oid(1), b"contents");
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Fs);
    let blob = store.get_blob(&oid(1), &context).await.expect("first fetch");
    assert_eq!(&blob.contents()[..], b"contents");
    assert_eq!(context.fetch_origin(), FetchOrigin::FromNetworkFetch);
    assert_eq!(backing.blob_fetch_count(), 1);

    // Second fetch is served from memory, with no backing traffic.
    let context = FetchContext::new(FetchCause::Fs);
    let again = store.get_blob(&oid(1), &context).await.expect("memory hit");
    assert_eq!(again.contents(), blob.contents());
    assert_eq!(context.fetch_origin(), FetchOrigin::FromMemoryCache);
    assert_eq!(backing.blob_fetch_count(), 1);

    let stats = store.stats();
    assert_eq!(stats.blobs.backing_fetches, 1);
    assert_eq!(stats.blobs.memory_hits, 1);
}

#[tokio::test]
async fn local_store_serves_a_fresh_process() {
    let backing = Arc::new(FakeBackingStore::new());
    backing.put_blob(oid(2), b"persisted");
    let local = LocalStore::in_memory().expect("local store");

    {
        let store = ObjectStore::new(
            StoreConfig::minimal(),
            Arc::clone(&local),
            Arc::clone(&backing) as Arc<dyn BackingStore>,
        );
        let context = FetchContext::new(FetchCause::Fs);
        store.get_blob(&oid(2), &context).await.expect("warm fetch");
    }

    // A fresh store over the same local store has a cold memory cache but
    // finds the written-back blob on disk.
    let store = ObjectStore::new(
        StoreConfig::minimal(),
        local,
        Arc::clone(&backing) as Arc<dyn BackingStore>,
    );
    let context = FetchContext::new(FetchCause::Fs);
    let blob = store.get_blob(&oid(2), &context).await.expect("disk hit");
    assert_eq!(&blob.contents()[..], b"persisted");
    assert_eq!(context.fetch_origin(), FetchOrigin::FromDiskCache);
    assert_eq!(backing.blob_fetch_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_backing_fetch() {
    let backing = Arc::new(FakeBackingStore::new());
    backing.put_blob(oid(3), b"shared");
    let store = store_over(Arc::clone(&backing));

    // Hold the worker at the backing store while both requests pile up.
    backing.close_gate();

    let first = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let context = FetchContext::new(FetchCause::Fs);
            store.get_blob(&oid(3), &context).await
        })
    };
    let second = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let context = FetchContext::new(FetchCause::Thrift);
            store.get_blob(&oid(3), &context).await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    backing.open_gate();

    let first = first.await.expect("join").expect("fetch");
    let second = second.await.expect("join").expect("fetch");
    assert_eq!(first.contents(), second.contents());
    // Both waiters saw the value, the backing store saw at most one fetch
    // for the deduplicated request (a second can only appear if one caller
    // already raced to completion before the other enqueued).
    assert!(backing.blob_fetch_count() <= 2);
    assert_eq!(&first.contents()[..], b"shared");
}

#[tokio::test]
async fn missing_blob_fails_every_waiter() {
    let backing = Arc::new(FakeBackingStore::new());
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Fs);
    let result = store.get_blob(&oid(9), &context).await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn identical_ids_compare_without_fetching() {
    let backing = Arc::new(FakeBackingStore::new());
    backing.put_blob(oid(4), b"same");
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Fs);
    assert!(store
        .are_blobs_equal(&oid(4), &oid(4), &context)
        .await
        .expect("compare"));
    assert_eq!(backing.blob_fetch_count(), 0);

    assert!(!store
        .are_blobs_equal(&oid(4), &oid(5), &context)
        .await
        .expect("compare"));
    assert_eq!(backing.blob_fetch_count(), 0);
}

#[tokio::test]
async fn unknown_comparison_fetches_both_blobs() {
    let backing = Arc::new(FakeBackingStore::with_unknown_comparison());
    backing.put_blob(oid(4), b"same bytes");
    backing.put_blob(oid(5), b"same bytes");
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Fs);
    assert!(store
        .are_blobs_equal(&oid(4), &oid(5), &context)
        .await
        .expect("compare"));
    assert_eq!(backing.blob_fetch_count(), 2);
}

#[tokio::test]
async fn root_tree_fetch_lands_in_the_tree_cache() {
    let backing = Arc::new(FakeBackingStore::new());
    let tree = Tree::new(
        oid(7),
        CaseSensitivity::Sensitive,
        vec![(
            PathComponent::new("README.md").expect("component"),
            TreeEntry {
                id: oid(8),
                kind: TreeEntryKind::RegularFile,
            },
        )],
    );
    backing.put_root_tree(RootId::new("main"), tree.clone());
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Fs);
    let fetched = store
        .get_root_tree(&RootId::new("main"), &context)
        .await
        .expect("root tree");
    assert_eq!(fetched.as_ref(), &tree);

    // The tree is now addressable by its own id from the memory tier.
    let context = FetchContext::new(FetchCause::Fs);
    let by_id = store.get_tree(&oid(7), &context).await.expect("tree by id");
    assert_eq!(context.fetch_origin(), FetchOrigin::FromMemoryCache);
    assert_eq!(by_id.get("README.md").expect("entry").id, oid(8));
}

#[tokio::test]
async fn prefetch_reaches_the_backing_store() {
    let backing = Arc::new(FakeBackingStore::new());
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Prefetch);
    store
        .prefetch_blobs(vec![oid(1), oid(2)], &context)
        .await
        .expect("prefetch");
    assert_eq!(*backing.prefetched.lock(), vec![oid(1), oid(2)]);
}

#[tokio::test]
async fn timeouts_surface_without_killing_the_request() {
    let backing = Arc::new(FakeBackingStore::new());
    backing.put_blob(oid(6), b"slow");
    backing.close_gate();
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Fs);
    let result = with_timeout(
        Duration::from_millis(20),
        store.get_blob(&oid(6), &context),
    )
    .await;
    assert!(matches!(result, Err(StoreError::Timeout)));
    backing.open_gate();

    // The request stayed in flight; a later caller still gets the blob.
    let context = FetchContext::new(FetchCause::Fs);
    let blob = store.get_blob(&oid(6), &context).await.expect("late fetch");
    assert_eq!(&blob.contents()[..], b"slow");
}

#[tokio::test]
async fn activity_buffer_archives_the_request_lifecycle() {
    let backing = Arc::new(FakeBackingStore::new());
    backing.put_blob(oid(1), b"traced");
    let store = store_over(Arc::clone(&backing));

    let context = FetchContext::new(FetchCause::Fs);
    store.get_blob(&oid(1), &context).await.expect("fetch");

    // The trace bus dispatches on its own thread; give it a moment.
    let mut snapshot = Vec::new();
    for _ in 0..100 {
        snapshot = store.activity_buffer().snapshot();
        if snapshot.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let types: Vec<TraceEventType> = snapshot.iter().map(|event| event.event_type).collect();
    assert!(types.contains(&TraceEventType::Queued), "queued event seen");
    assert!(types.contains(&TraceEventType::Start), "start event seen");
    assert!(types.contains(&TraceEventType::Finish), "finish event seen");
    let unique = snapshot[0].unique;
    assert!(snapshot.iter().all(|event| event.unique == unique));
}
