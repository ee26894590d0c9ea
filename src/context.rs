//! Per-request fetch context and the per-process access log.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::store::priority::ImportPriority;

/// Why a fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCause {
    /// Cause unknown.
    Unknown,
    /// Serving a filesystem channel request.
    Fs,
    /// Serving a service endpoint request.
    Thrift,
    /// Background prefetching.
    Prefetch,
}

/// Which tier ultimately produced an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    /// Nothing fetched yet.
    NotFetched = 0,
    /// Served from the in-memory cache.
    FromMemoryCache = 1,
    /// Served from the local on-disk cache.
    FromDiskCache = 2,
    /// Fetched from the backing store.
    FromNetworkFetch = 3,
}

impl FetchOrigin {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FetchOrigin::FromMemoryCache,
            2 => FetchOrigin::FromDiskCache,
            3 => FetchOrigin::FromNetworkFetch,
            _ => FetchOrigin::NotFetched,
        }
    }
}

/// The flavor of access recorded against a client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Served from memory.
    MemoryCacheImport,
    /// Served from the local on-disk cache.
    DiskCacheImport,
    /// Served by the backing store.
    BackingStoreImport,
}

/// Aggregated accesses for one client process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounts {
    /// Fetches served from memory.
    pub memory_cache_imports: u64,
    /// Fetches served from the on-disk cache.
    pub disk_cache_imports: u64,
    /// Fetches served by the backing store.
    pub backing_store_imports: u64,
    /// Total time the process spent waiting on fetches.
    pub total_duration: Duration,
}

/// A bounded per-pid log of fetch accesses. The least recently active
/// processes age out first.
pub struct ProcessAccessLog {
    buckets: Mutex<LruCache<u32, AccessCounts>>,
}

impl ProcessAccessLog {
    /// Create a log tracking up to `capacity` processes.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Arc::new(Self {
            buckets: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Count one access for `pid`.
    pub fn record_access(&self, pid: u32, access: AccessType) {
        let mut buckets = self.buckets.lock();
        let counts = buckets.get_or_insert_mut(pid, AccessCounts::default);
        match access {
            AccessType::MemoryCacheImport => counts.memory_cache_imports += 1,
            AccessType::DiskCacheImport => counts.disk_cache_imports += 1,
            AccessType::BackingStoreImport => counts.backing_store_imports += 1,
        }
    }

    /// Add fetch wait time to `pid`'s aggregate bucket.
    pub fn add_duration(&self, pid: u32, duration: Duration) {
        let mut buckets = self.buckets.lock();
        let counts = buckets.get_or_insert_mut(pid, AccessCounts::default);
        counts.total_duration += duration;
    }

    /// Snapshot of `pid`'s counts, if the process is still tracked.
    pub fn counts_for(&self, pid: u32) -> Option<AccessCounts> {
        self.buckets.lock().peek(&pid).copied()
    }
}

/// Per-request descriptor: who asked, why, how urgently, and where the
/// answer ultimately came from.
///
/// Dropping the context closes out the request: when a client pid is known,
/// the access log receives one access typed by the last observed fetch
/// origin plus the elapsed wall time.
pub struct FetchContext {
    cause: FetchCause,
    client_pid: Option<u32>,
    priority: AtomicU64,
    origin: AtomicU8,
    request_info: Option<FxHashMap<String, String>>,
    access_log: Option<Arc<ProcessAccessLog>>,
    start: Instant,
}

impl FetchContext {
    /// A context with the given cause and default priority for it.
    pub fn new(cause: FetchCause) -> Arc<Self> {
        let priority = match cause {
            FetchCause::Fs => ImportPriority::high(),
            FetchCause::Prefetch => ImportPriority::low(),
            _ => ImportPriority::normal(),
        };
        Arc::new(Self {
            cause,
            client_pid: None,
            priority: AtomicU64::new(priority.value()),
            origin: AtomicU8::new(FetchOrigin::NotFetched as u8),
            request_info: None,
            access_log: None,
            start: Instant::now(),
        })
    }

    /// A fully-specified context, tied to a client process and access log.
    pub fn for_client(
        cause: FetchCause,
        priority: ImportPriority,
        client_pid: u32,
        access_log: Arc<ProcessAccessLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cause,
            client_pid: Some(client_pid),
            priority: AtomicU64::new(priority.value()),
            origin: AtomicU8::new(FetchOrigin::NotFetched as u8),
            request_info: None,
            access_log: Some(access_log),
            start: Instant::now(),
        })
    }

    /// A context with an explicit priority and no client attribution.
    pub fn with_priority(cause: FetchCause, priority: ImportPriority) -> Arc<Self> {
        Arc::new(Self {
            cause,
            client_pid: None,
            priority: AtomicU64::new(priority.value()),
            origin: AtomicU8::new(FetchOrigin::NotFetched as u8),
            request_info: None,
            access_log: None,
            start: Instant::now(),
        })
    }

    /// Why this request exists.
    pub fn cause(&self) -> FetchCause {
        self.cause
    }

    /// The requesting client process, when known.
    pub fn client_pid(&self) -> Option<u32> {
        self.client_pid
    }

    /// Extra key/value detail attached to the request.
    pub fn request_info(&self) -> Option<&FxHashMap<String, String>> {
        self.request_info.as_ref()
    }

    /// The request's current priority.
    pub fn priority(&self) -> ImportPriority {
        ImportPriority::from_value(self.priority.load(Ordering::Relaxed))
    }

    /// Lower the priority's offset by `delta`, keeping its class. Safe to
    /// call from any thread.
    pub fn deprioritize(&self, delta: u64) {
        let mut current = self.priority.load(Ordering::Relaxed);
        loop {
            let lowered = ImportPriority::from_value(current).deprioritized(delta).value();
            match self.priority.compare_exchange(
                current,
                lowered,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Note where an object was found. May be called concurrently by
    /// arbitrary threads; the last write wins.
    pub fn did_fetch(&self, origin: FetchOrigin) {
        self.origin.store(origin as u8, Ordering::Relaxed);
    }

    /// The last observed fetch origin.
    pub fn fetch_origin(&self) -> FetchOrigin {
        FetchOrigin::from_u8(self.origin.load(Ordering::Relaxed))
    }
}

impl Drop for FetchContext {
    fn drop(&mut self) {
        let (Some(pid), Some(log)) = (self.client_pid, self.access_log.as_ref()) else {
            return;
        };
        let access = match self.fetch_origin() {
            FetchOrigin::FromMemoryCache => Some(AccessType::MemoryCacheImport),
            FetchOrigin::FromDiskCache => Some(AccessType::DiskCacheImport),
            FetchOrigin::FromNetworkFetch => Some(AccessType::BackingStoreImport),
            FetchOrigin::NotFetched => None,
        };
        if let Some(access) = access {
            log.record_access(pid, access);
        }
        log.add_duration(pid, self.start.elapsed());
    }
}
