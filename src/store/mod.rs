//! The object store: tiered, deduplicated, traced fetching of trees, blobs
//! and aux data.
//!
//! Lookup order for every object family: in-memory cache, then the local
//! on-disk store, then the request queue, where a worker pool services
//! batches against the backing store. Every tier reports its origin to the
//! request's [`FetchContext`]; queue transitions are published on a lossy
//! trace bus and archived in an activity ring buffer.

pub mod backing;
pub mod local;
pub mod priority;
pub mod queue;
pub mod status_cache;
pub mod trace;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::cache::{CacheStats, Interest, InterestHandleFlavor, ObjectCache, SimpleFlavor};
use crate::config::StoreConfig;
use crate::context::{FetchContext, FetchOrigin};
use crate::error::{Result, StoreError};
use crate::model::{Blob, BlobAuxData, ObjectId, RelativePath, RootId, Tree, TreeAuxData};
use backing::{BackingStore, ObjectComparison};
use local::{CachedFamily, CachingPolicy, LocalStore};
use queue::{Enqueued, ImportRequest, ImportRequestQueue, RequestKind, RequestPayload, TreeSource};
use trace::{ActivityBuffer, ImportTraceEvent, TraceBus, TraceEventType, TraceSubscriptionHandle};

/// The in-memory tree cache flavor used by the store.
pub type TreeCache = ObjectCache<Tree, InterestHandleFlavor>;
/// The in-memory blob cache flavor used by the store.
pub type BlobCache = ObjectCache<Blob, InterestHandleFlavor>;

#[derive(Default)]
struct TierCounters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    backing_fetches: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl TierCounters {
    fn record(&self, origin: FetchOrigin) {
        match origin {
            FetchOrigin::FromMemoryCache => self.memory_hits.fetch_add(1, Ordering::Relaxed),
            FetchOrigin::FromDiskCache => self.disk_hits.fetch_add(1, Ordering::Relaxed),
            FetchOrigin::FromNetworkFetch => self.backing_fetches.fetch_add(1, Ordering::Relaxed),
            FetchOrigin::NotFetched => 0,
        };
    }

    fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            backing_fetches: self.backing_fetches.load(Ordering::Relaxed),
            total_duration: Duration::from_nanos(self.total_duration_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Adds the scope's elapsed time to a family's duration total, whichever
/// way the scope exits.
struct DurationScope<'a> {
    counters: &'a TierCounters,
    started: std::time::Instant,
}

impl<'a> DurationScope<'a> {
    fn new(counters: &'a TierCounters) -> Self {
        Self {
            counters,
            started: std::time::Instant::now(),
        }
    }
}

impl Drop for DurationScope<'_> {
    fn drop(&mut self) {
        let nanos = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.counters
            .total_duration_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Per-tier hit counts for one object family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSnapshot {
    /// Served from the in-memory cache.
    pub memory_hits: u64,
    /// Served from the local on-disk store.
    pub disk_hits: u64,
    /// Fetched through the backing store.
    pub backing_fetches: u64,
    /// Total wall time spent inside this family's fetch entry points.
    pub total_duration: Duration,
}

/// Aggregate object store counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectStoreStats {
    /// Tree fetch tiers.
    pub trees: TierSnapshot,
    /// Blob fetch tiers.
    pub blobs: TierSnapshot,
    /// Blob aux data fetch tiers.
    pub blob_aux: TierSnapshot,
    /// Tree aux data fetch tiers.
    pub tree_aux: TierSnapshot,
    /// Local store writes that failed and were ignored.
    pub local_store_write_failures: u64,
    /// In-memory tree cache counters.
    pub tree_cache: CacheStats,
    /// In-memory blob cache counters.
    pub blob_cache: CacheStats,
}

struct StoreInner {
    queue: ImportRequestQueue,
    backing_store: Arc<dyn BackingStore>,
    local_store: Arc<LocalStore>,
    caching_policy: CachingPolicy,
    trace_bus: TraceBus<ImportTraceEvent>,
    tree_counters: TierCounters,
    blob_counters: TierCounters,
    blob_aux_counters: TierCounters,
    tree_aux_counters: TierCounters,
    local_store_write_failures: AtomicU64,
}

impl StoreInner {
    fn publish(&self, event: ImportTraceEvent) {
        self.trace_bus.publish(event);
    }

    fn record_write_failure(&self, id: &ObjectId, err: &StoreError) {
        // A failed write-back costs a refetch later, never the request.
        warn!(%id, %err, "local store write failed; ignoring");
        self.local_store_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn write_back_tree(&self, tree: &Tree) {
        if self.caching_policy.should_cache(CachedFamily::Trees) {
            if let Err(err) = self.local_store.put_tree(tree) {
                self.record_write_failure(tree.id(), &err);
            }
        }
    }

    fn write_back_blob(&self, blob: &Blob) {
        if self.caching_policy.should_cache(CachedFamily::Blobs) {
            if let Err(err) = self.local_store.put_blob(blob) {
                self.record_write_failure(blob.id(), &err);
            }
        }
    }

    fn write_back_blob_aux(&self, id: &ObjectId, aux: &BlobAuxData) {
        if self.caching_policy.should_cache(CachedFamily::BlobAux) {
            if let Err(err) = self.local_store.put_blob_aux(id, aux) {
                self.record_write_failure(id, &err);
            }
        }
    }

    fn write_back_tree_aux(&self, id: &ObjectId, aux: &TreeAuxData) {
        if self.caching_policy.should_cache(CachedFamily::TreeAux) {
            if let Err(err) = self.local_store.put_tree_aux(id, aux) {
                self.record_write_failure(id, &err);
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            let batch = self.queue.dequeue();
            if batch.is_empty() {
                break;
            }
            match batch[0].kind() {
                RequestKind::Blob => self.process_blob_batch(batch),
                RequestKind::Tree => self.process_tree_batch(batch),
                RequestKind::BlobAux => self.process_blob_aux_batch(batch),
                RequestKind::TreeAux => self.process_tree_aux_batch(batch),
                RequestKind::Prefetch => self.process_prefetch_batch(batch),
            }
        }
    }

    fn process_tree_batch(&self, batch: Vec<Arc<ImportRequest>>) {
        for request in &batch {
            self.publish(ImportTraceEvent::for_request(request, TraceEventType::Start));
        }
        for request in batch {
            let RequestPayload::Tree { source, .. } = &request.payload else {
                continue;
            };
            let result = match source {
                TreeSource::Id => self
                    .backing_store
                    .get_tree(request.id(), request.context())
                    .map(|fetched| fetched.tree),
                TreeSource::Root(root_id) => self
                    .backing_store
                    .get_root_tree(root_id, request.context()),
            };
            let result = result.map(|tree| {
                self.write_back_tree(&tree);
                Arc::new(tree)
            });
            self.queue.mark_tree_finished(request.id(), result);
            self.publish(ImportTraceEvent::for_request(
                &request,
                TraceEventType::Finish,
            ));
        }
    }

    fn process_blob_batch(&self, batch: Vec<Arc<ImportRequest>>) {
        for request in &batch {
            self.publish(ImportTraceEvent::for_request(request, TraceEventType::Start));
        }
        for request in batch {
            let result = self
                .backing_store
                .get_blob(request.id(), request.context())
                .map(|fetched| {
                    self.write_back_blob(&fetched.blob);
                    Arc::new(fetched.blob)
                });
            self.queue.mark_blob_finished(request.id(), result);
            self.publish(ImportTraceEvent::for_request(
                &request,
                TraceEventType::Finish,
            ));
        }
    }

    fn process_blob_aux_batch(&self, batch: Vec<Arc<ImportRequest>>) {
        for request in &batch {
            self.publish(ImportTraceEvent::for_request(request, TraceEventType::Start));
        }
        for request in batch {
            let result = self
                .backing_store
                .get_blob_aux_data(request.id(), request.context())
                .map(|fetched| {
                    if let Some(aux) = &fetched.aux {
                        self.write_back_blob_aux(request.id(), aux);
                    }
                    fetched.aux
                });
            self.queue.mark_blob_aux_finished(request.id(), result);
            self.publish(ImportTraceEvent::for_request(
                &request,
                TraceEventType::Finish,
            ));
        }
    }

    fn process_tree_aux_batch(&self, batch: Vec<Arc<ImportRequest>>) {
        for request in &batch {
            self.publish(ImportTraceEvent::for_request(request, TraceEventType::Start));
        }
        for request in batch {
            let result = self
                .backing_store
                .get_tree_aux_data(request.id(), request.context())
                .map(|fetched| {
                    if let Some(aux) = &fetched.aux {
                        self.write_back_tree_aux(request.id(), aux);
                    }
                    fetched.aux
                });
            self.queue.mark_tree_aux_finished(request.id(), result);
            self.publish(ImportTraceEvent::for_request(
                &request,
                TraceEventType::Finish,
            ));
        }
    }

    fn process_prefetch_batch(&self, batch: Vec<Arc<ImportRequest>>) {
        for request in &batch {
            self.publish(ImportTraceEvent::for_request(request, TraceEventType::Start));
        }
        for request in batch {
            let RequestPayload::Prefetch { ids, .. } = &request.payload else {
                continue;
            };
            let result = self.backing_store.prefetch_blobs(ids, request.context());
            request.resolve_prefetch(result);
            self.publish(ImportTraceEvent::for_request(
                &request,
                TraceEventType::Finish,
            ));
        }
    }
}

/// The object store orchestrator.
///
/// Dropping the store stops the queue and joins the worker pool; requests
/// still queued at that point resolve as cancelled.
pub struct ObjectStore {
    config: StoreConfig,
    // Declared (and therefore dropped) before `inner`, ending the
    // subscription before the bus it points into.
    activity_subscription: Option<TraceSubscriptionHandle<ImportTraceEvent>>,
    activity_buffer: Arc<ActivityBuffer>,
    inner: Arc<StoreInner>,
    tree_cache: TreeCache,
    blob_cache: BlobCache,
    blob_aux_cache: ObjectCache<BlobAuxData, SimpleFlavor>,
    tree_aux_cache: ObjectCache<TreeAuxData, SimpleFlavor>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ObjectStore {
    /// Build a store over the given tiers and start its worker pool.
    pub fn new(
        config: StoreConfig,
        local_store: Arc<LocalStore>,
        backing_store: Arc<dyn BackingStore>,
    ) -> Arc<Self> {
        let repo_name = backing_store.repo_name().unwrap_or_default();
        let inner = Arc::new(StoreInner {
            queue: ImportRequestQueue::new(&config),
            backing_store,
            local_store,
            caching_policy: config.caching_policy,
            trace_bus: TraceBus::new(&repo_name, config.trace_bus_capacity),
            tree_counters: TierCounters::default(),
            blob_counters: TierCounters::default(),
            blob_aux_counters: TierCounters::default(),
            tree_aux_counters: TierCounters::default(),
            local_store_write_failures: AtomicU64::new(0),
        });

        let activity_buffer = ActivityBuffer::new(config.activity_buffer_capacity);
        let archive = Arc::clone(&activity_buffer);
        let activity_subscription = Some(
            inner
                .trace_bus
                .subscribe(move |event: &ImportTraceEvent| archive.add_event(event.clone())),
        );

        let worker_count = config.worker_threads.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("objstore-{index}"))
                .spawn(move || worker_inner.worker_loop())
                .expect("spawning object store worker");
            workers.push(handle);
        }

        Arc::new(Self {
            tree_cache: ObjectCache::new(
                config.tree_cache_max_bytes,
                config.tree_cache_min_entries,
                config.cache_shards,
            ),
            blob_cache: ObjectCache::new(
                config.blob_cache_max_bytes,
                config.blob_cache_min_entries,
                config.cache_shards,
            ),
            blob_aux_cache: ObjectCache::new(
                config.aux_cache_max_bytes,
                config.aux_cache_min_entries,
                config.cache_shards,
            ),
            tree_aux_cache: ObjectCache::new(
                config.aux_cache_max_bytes,
                config.aux_cache_min_entries,
                config.cache_shards,
            ),
            activity_buffer,
            activity_subscription,
            workers: Mutex::new(workers),
            config,
            inner,
        })
    }

    fn publish_queued(&self, unique: u64, kind: RequestKind, id: &ObjectId, context: &FetchContext) {
        self.inner.publish(ImportTraceEvent {
            unique,
            event_type: TraceEventType::Queued,
            kind,
            id: id.clone(),
            priority: context.priority().kind(),
            cause: context.cause(),
            client_pid: context.client_pid(),
            when: std::time::Instant::now(),
        });
    }

    async fn await_enqueued<T>(enqueued: Enqueued<T>) -> Result<T> {
        match enqueued.receiver.await {
            Ok(result) => result,
            // The queue shut down underneath us.
            Err(_) => Err(StoreError::Cancelled),
        }
    }

    /// Fetch a tree, trying memory, then the local store, then the backing
    /// store via the queue.
    pub async fn get_tree(&self, id: &ObjectId, context: &Arc<FetchContext>) -> Result<Arc<Tree>> {
        let _scope = DurationScope::new(&self.inner.tree_counters);
        if let Some(tree) = self
            .tree_cache
            .get_with_interest(id, Interest::UnlikelyNeededAgain)
            .object
        {
            context.did_fetch(FetchOrigin::FromMemoryCache);
            self.inner.tree_counters.record(FetchOrigin::FromMemoryCache);
            return Ok(tree);
        }

        if let Some(tree) = self.inner.local_store.get_tree(id)? {
            let tree = Arc::new(tree);
            self.tree_cache.insert_with_interest(
                id.clone(),
                Arc::clone(&tree),
                Interest::UnlikelyNeededAgain,
            );
            context.did_fetch(FetchOrigin::FromDiskCache);
            self.inner.tree_counters.record(FetchOrigin::FromDiskCache);
            return Ok(tree);
        }

        let enqueued = self.inner.queue.enqueue_tree(id.clone(), context);
        self.publish_queued(enqueued.unique, RequestKind::Tree, id, context);
        debug!(%id, "tree fetch queued");
        let tree = Self::await_enqueued(enqueued).await?;
        self.tree_cache.insert_with_interest(
            id.clone(),
            Arc::clone(&tree),
            Interest::UnlikelyNeededAgain,
        );
        context.did_fetch(FetchOrigin::FromNetworkFetch);
        self.inner.tree_counters.record(FetchOrigin::FromNetworkFetch);
        Ok(tree)
    }

    /// Fetch the root tree of a commit. Concurrent fetches of the same root
    /// collapse onto one request.
    pub async fn get_root_tree(
        &self,
        root_id: &RootId,
        context: &Arc<FetchContext>,
    ) -> Result<Arc<Tree>> {
        let _scope = DurationScope::new(&self.inner.tree_counters);
        let enqueued = self.inner.queue.enqueue_root_tree(root_id.clone(), context);
        let request_id = ImportRequestQueue::root_tree_request_id(root_id);
        self.publish_queued(enqueued.unique, RequestKind::Tree, &request_id, context);
        let tree = Self::await_enqueued(enqueued).await?;
        self.tree_cache.insert_with_interest(
            tree.id().clone(),
            Arc::clone(&tree),
            Interest::UnlikelyNeededAgain,
        );
        context.did_fetch(FetchOrigin::FromNetworkFetch);
        self.inner.tree_counters.record(FetchOrigin::FromNetworkFetch);
        Ok(tree)
    }

    /// Fetch a blob, trying memory, then the local store, then the backing
    /// store via the queue.
    pub async fn get_blob(&self, id: &ObjectId, context: &Arc<FetchContext>) -> Result<Arc<Blob>> {
        let _scope = DurationScope::new(&self.inner.blob_counters);
        if let Some(blob) = self
            .blob_cache
            .get_with_interest(id, Interest::UnlikelyNeededAgain)
            .object
        {
            context.did_fetch(FetchOrigin::FromMemoryCache);
            self.inner.blob_counters.record(FetchOrigin::FromMemoryCache);
            return Ok(blob);
        }

        if let Some(blob) = self.inner.local_store.get_blob(id)? {
            let blob = Arc::new(blob);
            self.blob_cache.insert_with_interest(
                id.clone(),
                Arc::clone(&blob),
                Interest::UnlikelyNeededAgain,
            );
            context.did_fetch(FetchOrigin::FromDiskCache);
            self.inner.blob_counters.record(FetchOrigin::FromDiskCache);
            return Ok(blob);
        }

        let enqueued = self.inner.queue.enqueue_blob(id.clone(), context);
        self.publish_queued(enqueued.unique, RequestKind::Blob, id, context);
        debug!(%id, "blob fetch queued");
        let blob = Self::await_enqueued(enqueued).await?;
        self.blob_cache.insert_with_interest(
            id.clone(),
            Arc::clone(&blob),
            Interest::UnlikelyNeededAgain,
        );
        context.did_fetch(FetchOrigin::FromNetworkFetch);
        self.inner.blob_counters.record(FetchOrigin::FromNetworkFetch);
        Ok(blob)
    }

    /// Fetch a blob's aux data. Returns `None` when the backing store has
    /// none for this id.
    pub async fn get_blob_aux_data(
        &self,
        id: &ObjectId,
        context: &Arc<FetchContext>,
    ) -> Result<Option<BlobAuxData>> {
        let _scope = DurationScope::new(&self.inner.blob_aux_counters);
        if let Some(aux) = self.blob_aux_cache.get(id) {
            context.did_fetch(FetchOrigin::FromMemoryCache);
            self.inner
                .blob_aux_counters
                .record(FetchOrigin::FromMemoryCache);
            return Ok(Some(*aux));
        }

        if let Some(aux) = self.inner.local_store.get_blob_aux(id)? {
            self.blob_aux_cache.insert(id.clone(), Arc::new(aux));
            context.did_fetch(FetchOrigin::FromDiskCache);
            self.inner
                .blob_aux_counters
                .record(FetchOrigin::FromDiskCache);
            return Ok(Some(aux));
        }

        let enqueued = self.inner.queue.enqueue_blob_aux(id.clone(), context);
        self.publish_queued(enqueued.unique, RequestKind::BlobAux, id, context);
        let aux = Self::await_enqueued(enqueued).await?;
        if let Some(aux) = aux {
            self.blob_aux_cache.insert(id.clone(), Arc::new(aux));
        }
        context.did_fetch(FetchOrigin::FromNetworkFetch);
        self.inner
            .blob_aux_counters
            .record(FetchOrigin::FromNetworkFetch);
        Ok(aux)
    }

    /// Fetch a tree's aux data. Returns `None` when the backing store has
    /// none for this id.
    pub async fn get_tree_aux_data(
        &self,
        id: &ObjectId,
        context: &Arc<FetchContext>,
    ) -> Result<Option<TreeAuxData>> {
        let _scope = DurationScope::new(&self.inner.tree_aux_counters);
        if let Some(aux) = self.tree_aux_cache.get(id) {
            context.did_fetch(FetchOrigin::FromMemoryCache);
            self.inner
                .tree_aux_counters
                .record(FetchOrigin::FromMemoryCache);
            return Ok(Some(*aux));
        }

        if let Some(aux) = self.inner.local_store.get_tree_aux(id)? {
            self.tree_aux_cache.insert(id.clone(), Arc::new(aux));
            context.did_fetch(FetchOrigin::FromDiskCache);
            self.inner
                .tree_aux_counters
                .record(FetchOrigin::FromDiskCache);
            return Ok(Some(aux));
        }

        let enqueued = self.inner.queue.enqueue_tree_aux(id.clone(), context);
        self.publish_queued(enqueued.unique, RequestKind::TreeAux, id, context);
        let aux = Self::await_enqueued(enqueued).await?;
        if let Some(aux) = aux {
            self.tree_aux_cache.insert(id.clone(), Arc::new(aux));
        }
        context.did_fetch(FetchOrigin::FromNetworkFetch);
        self.inner
            .tree_aux_counters
            .record(FetchOrigin::FromNetworkFetch);
        Ok(aux)
    }

    /// Warm the pipeline for a set of blobs.
    pub async fn prefetch_blobs(
        &self,
        ids: Vec<ObjectId>,
        context: &Arc<FetchContext>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let first = ids[0].clone();
        let enqueued = self.inner.queue.enqueue_prefetch(ids, context);
        self.publish_queued(enqueued.unique, RequestKind::Prefetch, &first, context);
        Self::await_enqueued(enqueued).await
    }

    /// Whether two blob ids refer to the same contents. Identical or
    /// different ids answer without any fetch; otherwise both blobs are
    /// fetched and compared byte by byte.
    pub async fn are_blobs_equal(
        &self,
        one: &ObjectId,
        two: &ObjectId,
        context: &Arc<FetchContext>,
    ) -> Result<bool> {
        match self.inner.backing_store.compare_objects_by_id(one, two) {
            ObjectComparison::Identical => Ok(true),
            ObjectComparison::Different => Ok(false),
            ObjectComparison::Unknown => {
                let (first, second) =
                    tokio::join!(self.get_blob(one, context), self.get_blob(two, context));
                Ok(first?.contents() == second?.contents())
            }
        }
    }

    /// Opportunistically hand a known manifest for `root_id` to the backing
    /// store.
    pub fn import_manifest_for_root(
        &self,
        root_id: &RootId,
        manifest: &ObjectId,
        context: &Arc<FetchContext>,
    ) -> Result<()> {
        self.inner
            .backing_store
            .import_manifest_for_root(root_id, manifest, context)
    }

    /// Canonicalize a human-readable root id.
    pub fn parse_root_id(&self, root_id: &str) -> Result<RootId> {
        self.inner.backing_store.parse_root_id(root_id)
    }

    /// Render a root id for humans.
    pub fn render_root_id(&self, root_id: &RootId) -> String {
        self.inner.backing_store.render_root_id(root_id)
    }

    /// Canonicalize a human-readable object id.
    pub fn parse_object_id(&self, object_id: &str) -> Result<ObjectId> {
        self.inner.backing_store.parse_object_id(object_id)
    }

    /// Render an object id for humans.
    pub fn render_object_id(&self, object_id: &ObjectId) -> String {
        self.inner.backing_store.render_object_id(object_id)
    }

    /// Run the backing store's periodic housekeeping.
    pub fn periodic_management_task(&self) {
        self.inner.backing_store.periodic_management_task();
    }

    /// Begin recording fetched file paths in the backing store.
    pub fn start_recording_fetch(&self) {
        self.inner.backing_store.start_recording_fetch();
    }

    /// Stop recording and collect the fetched paths.
    pub fn stop_recording_fetch(&self) -> FxHashSet<RelativePath> {
        self.inner.backing_store.stop_recording_fetch()
    }

    /// Fail every queued request; shutdown path. Returns how many requests
    /// were dropped.
    pub fn drop_all_pending_requests(&self) -> usize {
        self.inner.queue.drop_all()
    }

    /// The store's in-memory tree cache.
    pub fn tree_cache(&self) -> &TreeCache {
        &self.tree_cache
    }

    /// The store's in-memory blob cache.
    pub fn blob_cache(&self) -> &BlobCache {
        &self.blob_cache
    }

    /// The debugging ring buffer of recent import events.
    pub fn activity_buffer(&self) -> &Arc<ActivityBuffer> {
        &self.activity_buffer
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Aggregate counters.
    pub fn stats(&self) -> ObjectStoreStats {
        ObjectStoreStats {
            trees: self.inner.tree_counters.snapshot(),
            blobs: self.inner.blob_counters.snapshot(),
            blob_aux: self.inner.blob_aux_counters.snapshot(),
            tree_aux: self.inner.tree_aux_counters.snapshot(),
            local_store_write_failures: self
                .inner
                .local_store_write_failures
                .load(Ordering::Relaxed),
            tree_cache: self.tree_cache.stats(),
            blob_cache: self.blob_cache.stats(),
        }
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        self.inner.queue.stop();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

/// Bound a fetch with a deadline; on expiry the caller observes `Timeout`
/// while the underlying request stays in flight for other waiters.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}
