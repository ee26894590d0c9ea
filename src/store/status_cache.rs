//! Cache of working-copy status results, deduplicating concurrent
//! computations per `(commit, list_ignored)` key.
//!
//! One journal position is stored per key: positions only move forward, so
//! a result computed at a newer position always supersedes an older one,
//! and an older result can be reused at a newer position when the journal
//! shows nothing but `.hg` noise in between.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::{CacheSize, ObjectCache, SimpleFlavor};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::journal::{Journal, SequenceNumber};
use crate::model::{ObjectId, RelativePath, RootId};

/// Status of one path relative to a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmFileStatus {
    /// Tracked in the working copy, absent in the commit.
    Added,
    /// Present in both, contents differ.
    Modified,
    /// Present in the commit, gone from the working copy.
    Removed,
    /// Present but ignored.
    Ignored,
}

/// What changed between a commit and the working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScmStatus {
    /// Changed paths and how they changed.
    pub entries: FxHashMap<RelativePath, ScmFileStatus>,
    /// Paths whose status could not be computed, with the reason.
    pub errors: FxHashMap<RelativePath, String>,
}

impl ScmStatus {
    fn size_bytes(&self) -> usize {
        let entry_bytes: usize = self
            .entries
            .keys()
            .map(|path| path.size_bytes() + std::mem::size_of::<ScmFileStatus>())
            .sum();
        let error_bytes: usize = self
            .errors
            .iter()
            .map(|(path, reason)| path.size_bytes() + reason.len())
            .sum();
        std::mem::size_of::<Self>() + entry_bytes + error_bytes
    }
}

/// A status result pinned to the journal position it was computed at. The
/// position moves forward as the result is revalidated against newer
/// positions.
pub struct SeqStatusPair {
    seq: AtomicU64,
    status: Arc<ScmStatus>,
}

impl SeqStatusPair {
    fn new(seq: SequenceNumber, status: Arc<ScmStatus>) -> Self {
        Self {
            seq: AtomicU64::new(seq),
            status,
        }
    }

    fn seq(&self) -> SequenceNumber {
        self.seq.load(Ordering::Relaxed)
    }
}

impl CacheSize for SeqStatusPair {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.status.size_bytes()
    }
}

/// Result shared between every waiter of one status computation.
pub type SharedStatus = std::result::Result<Arc<ScmStatus>, StoreError>;

/// A future on a status computation owned by another request.
pub struct StatusFuture {
    receiver: watch::Receiver<Option<SharedStatus>>,
}

impl StatusFuture {
    /// Wait for the owning request to finish. Fails with `Cancelled` when
    /// the owner goes away without delivering a result.
    pub async fn wait(mut self) -> SharedStatus {
        let value = self
            .receiver
            .wait_for(|value| value.is_some())
            .await
            .map_err(|_| StoreError::Cancelled)?;
        value.clone().expect("wait_for only returns Some")
    }
}

/// The obligation to compute a status result and hand it to every waiter.
pub struct StatusPromise {
    key: ObjectId,
    seq: SequenceNumber,
    sender: Arc<watch::Sender<Option<SharedStatus>>>,
}

impl StatusPromise {
    /// The cache key this promise was installed under.
    pub fn key(&self) -> &ObjectId {
        &self.key
    }

    /// The journal position the promise was installed at. Pass it back to
    /// [`StatusCache::drop_promise`].
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// Deliver the result to every waiter.
    pub fn fulfill(&self, result: SharedStatus) {
        self.sender.send_replace(Some(result));
    }
}

/// Outcome of a [`StatusCache::get`] lookup.
pub enum StatusGet {
    /// A cached result is valid at the requested position.
    Ready(Arc<ScmStatus>),
    /// Another request is computing this result; wait for it.
    Pending(StatusFuture),
    /// The caller must compute the result, [`StatusPromise::fulfill`] it,
    /// then [`StatusCache::insert`] and [`StatusCache::drop_promise`].
    Compute(StatusPromise),
}

type PromiseMap = FxHashMap<ObjectId, (SequenceNumber, Arc<watch::Sender<Option<SharedStatus>>>)>;

struct PromiseState {
    promises: PromiseMap,
    cached_working_copy_parent: RootId,
}

/// Cache of status results with promise deduplication, validated for reuse
/// against the journal.
pub struct StatusCache {
    internal: ObjectCache<SeqStatusPair, SimpleFlavor>,
    state: Mutex<PromiseState>,
    journal: Arc<Journal>,
}

impl StatusCache {
    /// Create a status cache bound to a journal.
    pub fn new(config: &StoreConfig, journal: Arc<Journal>) -> Self {
        Self {
            internal: ObjectCache::new(
                config.status_cache_max_bytes,
                config.status_cache_min_entries,
                config.cache_shards,
            ),
            state: Mutex::new(PromiseState {
                promises: PromiseMap::default(),
                cached_working_copy_parent: RootId::null(),
            }),
            journal,
        }
    }

    /// Build the cache key for a status query.
    pub fn make_key(commit: &RootId, list_ignored: bool) -> ObjectId {
        ObjectId::from_bytes(format!("{}:{}", commit.value(), list_ignored).into_bytes())
    }

    /// Look up a result valid at `current_seq`, join an in-flight
    /// computation, or take on the computation.
    pub fn get(&self, key: &ObjectId, current_seq: SequenceNumber) -> StatusGet {
        if let Some(pair) = self.internal.get(key) {
            if self.is_sequence_valid(current_seq, pair.seq()) {
                debug!(%key, current_seq, cached_seq = pair.seq(), "status cache hit");
                // Remember the newer position so the next lookup skips the
                // journal walk.
                pair.seq.store(current_seq, Ordering::Relaxed);
                return StatusGet::Ready(Arc::clone(&pair.status));
            }
        }

        let mut state = self.state.lock();
        if let Some((seq, sender)) = state.promises.get_mut(key) {
            if self.is_sequence_valid(current_seq, *seq) {
                debug!(%key, current_seq, promised_seq = *seq, "joining in-flight status");
                *seq = current_seq;
                return StatusGet::Pending(StatusFuture {
                    receiver: sender.subscribe(),
                });
            }
        }

        debug!(%key, current_seq, "status cache miss");
        let (sender, _receiver) = watch::channel(None);
        let sender = Arc::new(sender);
        state
            .promises
            .insert(key.clone(), (current_seq, Arc::clone(&sender)));
        StatusGet::Compute(StatusPromise {
            key: key.clone(),
            seq: current_seq,
            sender,
        })
    }

    /// Store a computed result. Only replaces an existing entry when the
    /// new result was computed at a strictly newer position.
    pub fn insert(&self, key: ObjectId, seq: SequenceNumber, status: Arc<ScmStatus>) {
        match self.internal.get(&key) {
            None => {
                self.internal
                    .insert(key, Arc::new(SeqStatusPair::new(seq, status)));
            }
            Some(existing) if seq > existing.seq() => {
                self.internal.invalidate(&key);
                self.internal
                    .insert(key, Arc::new(SeqStatusPair::new(seq, status)));
            }
            Some(_) => {}
        }
    }

    /// Remove the promise installed at `seq` for `key`. A promise installed
    /// by a newer concurrent request (at a different position) is left in
    /// place.
    pub fn drop_promise(&self, key: &ObjectId, seq: SequenceNumber) {
        let mut state = self.state.lock();
        if let Some((installed_seq, _)) = state.promises.get(key) {
            if *installed_seq == seq {
                state.promises.remove(key);
            }
        }
    }

    /// Whether a result computed at `cached_seq` can serve a request at
    /// `current_seq`: trivially when it is at least as new, otherwise when
    /// the journal range in between is untruncated, `.hg`-only, and free of
    /// root updates.
    pub fn is_sequence_valid(
        &self,
        current_seq: SequenceNumber,
        cached_seq: SequenceNumber,
    ) -> bool {
        if cached_seq >= current_seq {
            return true;
        }
        // The range is inclusive, so start just past the cached position.
        // It may extend beyond current_seq; that only makes the check
        // stricter.
        match self.journal.accumulate_range(cached_seq + 1) {
            None => true,
            Some(range) => {
                let valid = !range.is_truncated
                    && range.contains_hg_only_changes
                    && !range.contains_root_update;
                debug!(
                    cached_seq,
                    truncated = range.is_truncated,
                    hg_only = range.contains_hg_only_changes,
                    root_update = range.contains_root_update,
                    valid,
                    "status range check"
                );
                valid
            }
        }
    }

    /// Whether cached results may be trusted for the given working copy
    /// parent. Must be checked before any [`StatusCache::get`].
    pub fn is_cached_working_dir_valid(&self, current: &RootId) -> bool {
        &self.state.lock().cached_working_copy_parent == current
    }

    /// Bind the cache to a new working copy parent.
    pub fn reset_cached_working_dir(&self, current: RootId) {
        self.state.lock().cached_working_copy_parent = current;
    }

    /// Drop every result and promise; used when the working copy parent
    /// changes. In-flight computations still deliver to their own waiters.
    pub fn clear(&self) {
        self.internal.clear();
        let mut state = self.state.lock();
        state.promises.clear();
        state.cached_working_copy_parent = RootId::null();
    }

    /// Number of cached results.
    pub fn result_count(&self) -> usize {
        self.internal.stats().object_count
    }
}
