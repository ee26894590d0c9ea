//! The import request queue.
//!
//! Requests are bucketed by kind and scheduled by priority; concurrent
//! requests for the same object collapse onto one in-flight request whose
//! priority is raised to the highest of its waiters. Workers block on
//! [`ImportRequestQueue::dequeue`] and resolve every waiter through
//! [`ImportRequestQueue`]'s `mark_*_finished` methods.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::config::StoreConfig;
use crate::context::{FetchCause, FetchContext};
use crate::error::{Result, StoreError};
use crate::idgen::generate_unique_id;
use crate::model::{Blob, BlobAuxData, ObjectId, RootId, Tree, TreeAuxData};
use crate::store::priority::ImportPriority;

/// The request families, one queue bucket each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Blob fetches.
    Blob,
    /// Tree fetches (including root trees).
    Tree,
    /// Blob aux data fetches.
    BlobAux,
    /// Tree aux data fetches.
    TreeAux,
    /// Bulk blob prefetches.
    Prefetch,
}

const KIND_COUNT: usize = 5;

impl RequestKind {
    fn index(self) -> usize {
        match self {
            RequestKind::Blob => 0,
            RequestKind::Tree => 1,
            RequestKind::BlobAux => 2,
            RequestKind::TreeAux => 3,
            RequestKind::Prefetch => 4,
        }
    }
}

type Senders<T> = Mutex<SmallVec<[oneshot::Sender<Result<T>>; 1]>>;

/// Where a tree request should be resolved from.
#[derive(Debug, Clone)]
pub(crate) enum TreeSource {
    /// An ordinary tree object.
    Id,
    /// The root tree of a commit; the request's object id is derived from
    /// the rendered root so concurrent fetches of one root deduplicate.
    Root(RootId),
}

pub(crate) enum RequestPayload {
    Blob {
        promises: Senders<Arc<Blob>>,
    },
    Tree {
        source: TreeSource,
        promises: Senders<Arc<Tree>>,
    },
    BlobAux {
        promises: Senders<Option<BlobAuxData>>,
    },
    TreeAux {
        promises: Senders<Option<TreeAuxData>>,
    },
    Prefetch {
        ids: Vec<ObjectId>,
        promises: Senders<()>,
    },
}

/// One queued (or in-flight) import. Shared between the queue, the dedup
/// tracker, and the worker processing it.
pub struct ImportRequest {
    unique: u64,
    id: ObjectId,
    /// Effective priority. Starts from the originating context's priority
    /// and only ever rises, as deduplicated waiters join.
    priority: AtomicU64,
    context: Arc<FetchContext>,
    request_time: Instant,
    pub(crate) payload: RequestPayload,
}

impl ImportRequest {
    fn new(id: ObjectId, context: &Arc<FetchContext>, payload: RequestPayload) -> Arc<Self> {
        Arc::new(Self {
            unique: generate_unique_id(),
            id,
            priority: AtomicU64::new(context.priority().value()),
            context: Arc::clone(context),
            request_time: Instant::now(),
            payload,
        })
    }

    /// Process-unique id of this request, shared by its trace events.
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// The object this request is for. For root trees this is the derived
    /// dedup id, not a real object id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// The request's bucket.
    pub fn kind(&self) -> RequestKind {
        match &self.payload {
            RequestPayload::Blob { .. } => RequestKind::Blob,
            RequestPayload::Tree { .. } => RequestKind::Tree,
            RequestPayload::BlobAux { .. } => RequestKind::BlobAux,
            RequestPayload::TreeAux { .. } => RequestKind::TreeAux,
            RequestPayload::Prefetch { .. } => RequestKind::Prefetch,
        }
    }

    /// The request's current effective priority.
    pub fn priority(&self) -> ImportPriority {
        ImportPriority::from_value(self.priority.load(Ordering::Relaxed))
    }

    /// Why the request was issued.
    pub fn cause(&self) -> FetchCause {
        self.context.cause()
    }

    /// The requesting client process, when known.
    pub fn client_pid(&self) -> Option<u32> {
        self.context.client_pid()
    }

    /// The context the request was issued under.
    pub fn context(&self) -> &Arc<FetchContext> {
        &self.context
    }

    /// When the request entered the queue.
    pub fn request_time(&self) -> Instant {
        self.request_time
    }

    fn raise_priority(&self, candidate: ImportPriority) {
        self.priority
            .fetch_max(candidate.value(), Ordering::Relaxed);
    }

    fn resolve<T: Clone>(promises: &Senders<T>, result: &Result<T>) {
        let senders = std::mem::take(&mut *promises.lock());
        for sender in senders {
            // A waiter that dropped its future is fine to ignore.
            let _ = sender.send(result.clone());
        }
    }

    pub(crate) fn resolve_prefetch(&self, result: Result<()>) {
        if let RequestPayload::Prefetch { promises, .. } = &self.payload {
            Self::resolve(promises, &result);
        }
    }
}

struct Bucket {
    queue: Vec<Arc<ImportRequest>>,
    /// One entry per in-flight object of this kind. Entries persist across
    /// dequeue and are removed by `mark_*_finished`, so late duplicate
    /// requests still join a fetch that is already running.
    tracker: FxHashMap<ObjectId, Arc<ImportRequest>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            queue: Vec::new(),
            tracker: FxHashMap::default(),
        }
    }
}

struct State {
    running: bool,
    buckets: [Bucket; KIND_COUNT],
}

/// Priority-scheduled queue with per-kind buckets and in-flight dedup.
pub struct ImportRequestQueue {
    state: Mutex<State>,
    queue_cv: Condvar,
    batch_sizes: [usize; KIND_COUNT],
}

/// A future view on one enqueued request.
pub struct Enqueued<T> {
    /// Unique id of the (possibly pre-existing) request serving this caller.
    pub unique: u64,
    /// Completion channel resolved by `mark_*_finished`.
    pub receiver: oneshot::Receiver<Result<T>>,
}

impl ImportRequestQueue {
    /// Build a queue using the config's per-kind batch sizes.
    pub fn new(config: &StoreConfig) -> Self {
        let mut batch_sizes = [1usize; KIND_COUNT];
        batch_sizes[RequestKind::Blob.index()] = config.blob_batch_size.max(1);
        batch_sizes[RequestKind::Tree.index()] = config.tree_batch_size.max(1);
        batch_sizes[RequestKind::BlobAux.index()] = config.blob_aux_batch_size.max(1);
        batch_sizes[RequestKind::TreeAux.index()] = config.tree_aux_batch_size.max(1);
        batch_sizes[RequestKind::Prefetch.index()] = config.prefetch_batch_size.max(1);
        Self {
            state: Mutex::new(State {
                running: true,
                buckets: std::array::from_fn(|_| Bucket::new()),
            }),
            queue_cv: Condvar::new(),
            batch_sizes,
        }
    }

    /// Enqueue a blob fetch.
    pub fn enqueue_blob(&self, id: ObjectId, context: &Arc<FetchContext>) -> Enqueued<Arc<Blob>> {
        self.enqueue(RequestKind::Blob, id, context, || RequestPayload::Blob {
            promises: Mutex::new(SmallVec::new()),
        })
    }

    /// Enqueue a tree fetch.
    pub fn enqueue_tree(&self, id: ObjectId, context: &Arc<FetchContext>) -> Enqueued<Arc<Tree>> {
        self.enqueue(RequestKind::Tree, id, context, || RequestPayload::Tree {
            source: TreeSource::Id,
            promises: Mutex::new(SmallVec::new()),
        })
    }

    /// Enqueue a root tree fetch, deduplicated on a derived id.
    pub fn enqueue_root_tree(
        &self,
        root_id: RootId,
        context: &Arc<FetchContext>,
    ) -> Enqueued<Arc<Tree>> {
        let derived = Self::root_tree_request_id(&root_id);
        self.enqueue(RequestKind::Tree, derived, context, move || {
            RequestPayload::Tree {
                source: TreeSource::Root(root_id),
                promises: Mutex::new(SmallVec::new()),
            }
        })
    }

    /// The dedup id used for a root tree request.
    pub fn root_tree_request_id(root_id: &RootId) -> ObjectId {
        let mut raw = b"root:".to_vec();
        raw.extend_from_slice(root_id.value().as_bytes());
        ObjectId::from_bytes(raw)
    }

    /// Enqueue a blob aux data fetch.
    pub fn enqueue_blob_aux(
        &self,
        id: ObjectId,
        context: &Arc<FetchContext>,
    ) -> Enqueued<Option<BlobAuxData>> {
        self.enqueue(RequestKind::BlobAux, id, context, || {
            RequestPayload::BlobAux {
                promises: Mutex::new(SmallVec::new()),
            }
        })
    }

    /// Enqueue a tree aux data fetch.
    pub fn enqueue_tree_aux(
        &self,
        id: ObjectId,
        context: &Arc<FetchContext>,
    ) -> Enqueued<Option<TreeAuxData>> {
        self.enqueue(RequestKind::TreeAux, id, context, || {
            RequestPayload::TreeAux {
                promises: Mutex::new(SmallVec::new()),
            }
        })
    }

    /// Enqueue a bulk prefetch. Prefetches carry many ids, so they bypass
    /// the single-id dedup tracker; the worker resolves their promises
    /// directly.
    pub fn enqueue_prefetch(
        &self,
        ids: Vec<ObjectId>,
        context: &Arc<FetchContext>,
    ) -> Enqueued<()> {
        let (sender, receiver) = oneshot::channel();
        let request = ImportRequest::new(
            // Each prefetch is its own request; give it a unique dedup id.
            ObjectId::from_bytes(generate_unique_id().to_be_bytes().to_vec()),
            context,
            RequestPayload::Prefetch {
                ids,
                promises: Mutex::new(SmallVec::new()),
            },
        );
        if let RequestPayload::Prefetch { promises, .. } = &request.payload {
            promises.lock().push(sender);
        }
        let unique = request.unique;

        let mut state = self.state.lock();
        if state.running {
            state.buckets[RequestKind::Prefetch.index()]
                .queue
                .push(request);
            drop(state);
            self.queue_cv.notify_one();
        }
        // When stopped, the request (and its senders) just drop: the
        // caller's future resolves to a cancellation.
        Enqueued { unique, receiver }
    }

    fn enqueue<T: Clone>(
        &self,
        kind: RequestKind,
        id: ObjectId,
        context: &Arc<FetchContext>,
        make_payload: impl FnOnce() -> RequestPayload,
    ) -> Enqueued<T>
    where
        ImportRequest: PromiseAccess<T>,
    {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        if !state.running {
            // Shutdown path: the future is never completed.
            return Enqueued {
                unique: 0,
                receiver,
            };
        }

        let bucket = &mut state.buckets[kind.index()];
        if let Some(existing) = bucket.tracker.get(&id) {
            existing.promises().lock().push(sender);
            existing.raise_priority(context.priority());
            let unique = existing.unique;
            return Enqueued { unique, receiver };
        }

        let request = ImportRequest::new(id.clone(), context, make_payload());
        request.promises().lock().push(sender);
        let unique = request.unique;
        bucket.tracker.insert(id, Arc::clone(&request));
        bucket.queue.push(request);
        drop(state);
        self.queue_cv.notify_one();
        Enqueued { unique, receiver }
    }

    /// Block until work or shutdown. Returns a batch of requests of one
    /// kind, picked from the bucket whose best request has the highest
    /// priority; inside a kind, higher priority first, ties in FIFO order.
    /// Returns an empty vector when the queue is stopped.
    pub fn dequeue(&self) -> Vec<Arc<ImportRequest>> {
        let mut state = self.state.lock();
        loop {
            if !state.running {
                return Vec::new();
            }
            if state.buckets.iter().any(|bucket| !bucket.queue.is_empty()) {
                break;
            }
            self.queue_cv.wait(&mut state);
        }

        let mut best: Option<(usize, u64)> = None;
        for (index, bucket) in state.buckets.iter().enumerate() {
            if let Some(max) = bucket
                .queue
                .iter()
                .map(|request| request.priority.load(Ordering::Relaxed))
                .max()
            {
                if best.is_none_or(|(_, best_priority)| max > best_priority) {
                    best = Some((index, max));
                }
            }
        }
        let (index, _) = best.expect("a non-empty bucket exists");
        let bucket = &mut state.buckets[index];
        // Stable sort keeps FIFO order within equal priorities.
        bucket
            .queue
            .sort_by_key(|request| std::cmp::Reverse(request.priority.load(Ordering::Relaxed)));
        let take = self.batch_sizes[index].min(bucket.queue.len());
        bucket.queue.drain(..take).collect()
    }

    /// Stop the queue: wake all workers, and silently discard any future
    /// enqueue. Process-shutdown path.
    pub fn stop(&self) {
        self.state.lock().running = false;
        self.queue_cv.notify_all();
    }

    /// Resolve every waiter of a finished blob fetch.
    pub fn mark_blob_finished(&self, id: &ObjectId, result: Result<Arc<Blob>>) {
        self.mark_finished(RequestKind::Blob, id, result);
    }

    /// Resolve every waiter of a finished tree fetch.
    pub fn mark_tree_finished(&self, id: &ObjectId, result: Result<Arc<Tree>>) {
        self.mark_finished(RequestKind::Tree, id, result);
    }

    /// Resolve every waiter of a finished blob aux data fetch.
    pub fn mark_blob_aux_finished(&self, id: &ObjectId, result: Result<Option<BlobAuxData>>) {
        self.mark_finished(RequestKind::BlobAux, id, result);
    }

    /// Resolve every waiter of a finished tree aux data fetch.
    pub fn mark_tree_aux_finished(&self, id: &ObjectId, result: Result<Option<TreeAuxData>>) {
        self.mark_finished(RequestKind::TreeAux, id, result);
    }

    fn mark_finished<T: Clone>(&self, kind: RequestKind, id: &ObjectId, result: Result<T>)
    where
        ImportRequest: PromiseAccess<T>,
    {
        let request = {
            let mut state = self.state.lock();
            state.buckets[kind.index()].tracker.remove(id)
        };
        let Some(request) = request else {
            // Dropped during shutdown; nothing to resolve.
            return;
        };
        ImportRequest::resolve(request.promises(), &result);
    }

    /// Fail every queued request with a cancellation and empty the buckets.
    /// Returns how many requests were dropped.
    pub fn drop_all(&self) -> usize {
        let dropped: Vec<Arc<ImportRequest>> = {
            let mut state = self.state.lock();
            let mut dropped = Vec::new();
            for bucket in &mut state.buckets {
                dropped.extend(bucket.queue.drain(..));
                dropped.extend(bucket.tracker.drain().map(|(_, request)| request));
            }
            dropped
        };
        // Tracker and queue both held most requests; dedup by unique id so
        // each promise set resolves once.
        let mut seen = FxHashMap::default();
        let mut count = 0;
        for request in dropped {
            if seen.insert(request.unique, ()).is_some() {
                continue;
            }
            count += 1;
            match &request.payload {
                RequestPayload::Blob { promises } => {
                    ImportRequest::resolve(promises, &Err(StoreError::Cancelled))
                }
                RequestPayload::Tree { promises, .. } => {
                    ImportRequest::resolve(promises, &Err(StoreError::Cancelled))
                }
                RequestPayload::BlobAux { promises } => {
                    ImportRequest::resolve(promises, &Err(StoreError::Cancelled))
                }
                RequestPayload::TreeAux { promises } => {
                    ImportRequest::resolve(promises, &Err(StoreError::Cancelled))
                }
                RequestPayload::Prefetch { promises, .. } => {
                    ImportRequest::resolve(promises, &Err(StoreError::Cancelled))
                }
            }
        }
        count
    }
}

/// Maps a result type to the matching promise list of a request.
pub(crate) trait PromiseAccess<T> {
    fn promises(&self) -> &Senders<T>;
}

impl PromiseAccess<Arc<Blob>> for ImportRequest {
    fn promises(&self) -> &Senders<Arc<Blob>> {
        match &self.payload {
            RequestPayload::Blob { promises } => promises,
            _ => unreachable!("blob promise requested from a non-blob request"),
        }
    }
}

impl PromiseAccess<Arc<Tree>> for ImportRequest {
    fn promises(&self) -> &Senders<Arc<Tree>> {
        match &self.payload {
            RequestPayload::Tree { promises, .. } => promises,
            _ => unreachable!("tree promise requested from a non-tree request"),
        }
    }
}

impl PromiseAccess<Option<BlobAuxData>> for ImportRequest {
    fn promises(&self) -> &Senders<Option<BlobAuxData>> {
        match &self.payload {
            RequestPayload::BlobAux { promises } => promises,
            _ => unreachable!("blob aux promise requested from a non-aux request"),
        }
    }
}

impl PromiseAccess<Option<TreeAuxData>> for ImportRequest {
    fn promises(&self) -> &Senders<Option<TreeAuxData>> {
        match &self.payload {
            RequestPayload::TreeAux { promises } => promises,
            _ => unreachable!("tree aux promise requested from a non-aux request"),
        }
    }
}

impl PromiseAccess<()> for ImportRequest {
    fn promises(&self) -> &Senders<()> {
        match &self.payload {
            RequestPayload::Prefetch { promises, .. } => promises,
            _ => unreachable!("prefetch promise requested from a non-prefetch request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FetchCause;
    use crate::store::priority::ImportPriorityKind;

    fn queue() -> ImportRequestQueue {
        ImportRequestQueue::new(&StoreConfig::minimal())
    }

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes(vec![byte; 20])
    }

    fn blob(byte: u8) -> Arc<Blob> {
        Arc::new(Blob::new(oid(byte), vec![byte; 4]))
    }

    #[test]
    fn duplicate_enqueue_collapses_and_raises_priority() {
        let queue = queue();
        let low = FetchContext::with_priority(
            FetchCause::Prefetch,
            ImportPriority::with_offset(ImportPriorityKind::Low, 500),
        );
        let normal = FetchContext::with_priority(
            FetchCause::Fs,
            ImportPriority::with_offset(ImportPriorityKind::Normal, 0),
        );

        let first = queue.enqueue_blob(oid(1), &low);
        let second = queue.enqueue_blob(oid(1), &normal);
        assert_eq!(first.unique, second.unique);

        let batch = queue.dequeue();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0].priority(),
            ImportPriority::with_offset(ImportPriorityKind::Normal, 0)
        );
    }

    #[test]
    fn escalated_request_outranks_other_low_requests() {
        let queue = queue();
        let low = FetchContext::with_priority(FetchCause::Prefetch, ImportPriority::low());
        queue.enqueue_blob(oid(9), &low);

        let lower = FetchContext::with_priority(
            FetchCause::Prefetch,
            ImportPriority::with_offset(ImportPriorityKind::Low, 500),
        );
        let normal = FetchContext::with_priority(
            FetchCause::Fs,
            ImportPriority::with_offset(ImportPriorityKind::Normal, 0),
        );
        queue.enqueue_blob(oid(1), &lower);
        queue.enqueue_blob(oid(1), &normal);

        let batch = queue.dequeue();
        // Escalated oid(1) must lead the batch despite arriving second.
        assert_eq!(batch[0].id(), &oid(1));
    }

    #[tokio::test]
    async fn mark_finished_resolves_every_waiter() {
        let queue = queue();
        let context = FetchContext::new(FetchCause::Fs);
        let first = queue.enqueue_blob(oid(1), &context);
        let second = queue.enqueue_blob(oid(1), &context);

        let batch = queue.dequeue();
        assert_eq!(batch.len(), 1);
        queue.mark_blob_finished(&oid(1), Ok(blob(1)));

        let a = first.receiver.await.unwrap().unwrap();
        let b = second.receiver.await.unwrap().unwrap();
        assert_eq!(a.id(), &oid(1));
        assert_eq!(b.id(), &oid(1));
    }

    #[tokio::test]
    async fn mark_finished_spreads_errors() {
        let queue = queue();
        let context = FetchContext::new(FetchCause::Fs);
        let first = queue.enqueue_tree(oid(2), &context);
        let second = queue.enqueue_tree(oid(2), &context);
        queue.dequeue();
        queue.mark_tree_finished(
            &oid(2),
            Err(StoreError::not_found(crate::error::ObjectKind::Tree, oid(2))),
        );

        assert!(matches!(
            first.receiver.await.unwrap(),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            second.receiver.await.unwrap(),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn mark_finished_for_unknown_id_is_a_no_op() {
        let queue = queue();
        queue.mark_blob_finished(&oid(7), Ok(blob(7)));
    }

    #[test]
    fn dequeue_prefers_highest_priority_bucket() {
        let queue = queue();
        let low = FetchContext::with_priority(FetchCause::Prefetch, ImportPriority::low());
        let high = FetchContext::with_priority(FetchCause::Fs, ImportPriority::high());
        queue.enqueue_blob(oid(1), &low);
        queue.enqueue_tree(oid(2), &high);

        let batch = queue.dequeue();
        assert_eq!(batch[0].kind(), RequestKind::Tree);
    }

    #[test]
    fn batches_are_single_kind_and_bounded() {
        let queue = queue();
        let context = FetchContext::new(FetchCause::Fs);
        for byte in 0..6 {
            queue.enqueue_blob(oid(byte), &context);
        }
        let batch = queue.dequeue();
        assert_eq!(batch.len(), 4);
        assert!(batch.iter().all(|r| r.kind() == RequestKind::Blob));
        let rest = queue.dequeue();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn stop_unblocks_and_discards() {
        let queue = Arc::new(queue());
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue())
        };
        queue.stop();
        assert!(waiter.join().unwrap().is_empty());

        let context = FetchContext::new(FetchCause::Fs);
        let enqueued = queue.enqueue_blob(oid(1), &context);
        // Discarded: the promise is never resolved.
        assert!(enqueued.receiver.await.is_err());
    }

    #[tokio::test]
    async fn drop_all_cancels_everything() {
        let queue = queue();
        let context = FetchContext::new(FetchCause::Fs);
        let blob_req = queue.enqueue_blob(oid(1), &context);
        let tree_req = queue.enqueue_tree(oid(2), &context);
        assert_eq!(queue.drop_all(), 2);

        assert!(matches!(
            blob_req.receiver.await.unwrap(),
            Err(StoreError::Cancelled)
        ));
        assert!(matches!(
            tree_req.receiver.await.unwrap(),
            Err(StoreError::Cancelled)
        ));
    }

    #[test]
    fn root_tree_requests_dedup_by_root() {
        let queue = queue();
        let context = FetchContext::new(FetchCause::Fs);
        let first = queue.enqueue_root_tree(RootId::new("r1"), &context);
        let second = queue.enqueue_root_tree(RootId::new("r1"), &context);
        let other = queue.enqueue_root_tree(RootId::new("r2"), &context);
        assert_eq!(first.unique, second.unique);
        assert_ne!(first.unique, other.unique);
    }
}
