//! Tuning knobs for the object store pipeline.

use std::time::Duration;

use crate::store::local::CachingPolicy;

/// Configuration for an object store and its collaborators.
///
/// These options control the worker pool, dequeue batch sizes, in-memory
/// cache budgets, trace buffering, journal bounds, and notification
/// throttling.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Worker threads servicing the request queue. Clamped to at least 1.
    pub worker_threads: usize,
    /// Maximum tree requests handed to a worker per dequeue.
    pub tree_batch_size: usize,
    /// Maximum blob requests handed to a worker per dequeue.
    pub blob_batch_size: usize,
    /// Maximum blob aux data requests handed to a worker per dequeue.
    pub blob_aux_batch_size: usize,
    /// Maximum tree aux data requests handed to a worker per dequeue.
    pub tree_aux_batch_size: usize,
    /// Maximum prefetch requests handed to a worker per dequeue.
    pub prefetch_batch_size: usize,
    /// Byte budget of the in-memory tree cache.
    pub tree_cache_max_bytes: usize,
    /// Entries the tree cache keeps even above its byte budget.
    pub tree_cache_min_entries: usize,
    /// Byte budget of the in-memory blob cache.
    pub blob_cache_max_bytes: usize,
    /// Entries the blob cache keeps even above its byte budget.
    pub blob_cache_min_entries: usize,
    /// Byte budget of the in-memory aux data cache.
    pub aux_cache_max_bytes: usize,
    /// Entries the aux cache keeps even above its byte budget.
    pub aux_cache_min_entries: usize,
    /// Byte budget of the status result cache.
    pub status_cache_max_bytes: usize,
    /// Entries the status cache keeps even above its byte budget.
    pub status_cache_min_entries: usize,
    /// Shards per in-memory cache.
    pub cache_shards: usize,
    /// Which object families are written back to the local store.
    pub caching_policy: CachingPolicy,
    /// Capacity of the lossy import trace bus.
    pub trace_bus_capacity: usize,
    /// Events retained by the activity ring buffer.
    pub activity_buffer_capacity: usize,
    /// Journal delta memory budget.
    pub journal_memory_limit: usize,
    /// Minimum spacing between user-visible notifications.
    pub notification_interval: Duration,
    /// Client processes tracked by the access log.
    pub access_log_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            worker_threads: 8,
            tree_batch_size: 16,
            blob_batch_size: 16,
            blob_aux_batch_size: 128,
            tree_aux_batch_size: 128,
            prefetch_batch_size: 128,
            tree_cache_max_bytes: 40 * 1024 * 1024,
            tree_cache_min_entries: 16,
            blob_cache_max_bytes: 40 * 1024 * 1024,
            blob_cache_min_entries: 16,
            aux_cache_max_bytes: 1024 * 1024,
            aux_cache_min_entries: 64,
            status_cache_max_bytes: 8 * 1024 * 1024,
            status_cache_min_entries: 4,
            cache_shards: 16,
            caching_policy: CachingPolicy::TreesAndBlobAuxData,
            trace_bus_capacity: 100_000,
            activity_buffer_capacity: 100,
            journal_memory_limit: crate::journal::DEFAULT_MEMORY_LIMIT,
            notification_interval: Duration::from_secs(60),
            access_log_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// A small single-threaded profile for tests.
    pub fn minimal() -> Self {
        Self {
            worker_threads: 1,
            tree_batch_size: 4,
            blob_batch_size: 4,
            blob_aux_batch_size: 4,
            tree_aux_batch_size: 4,
            prefetch_batch_size: 4,
            tree_cache_max_bytes: 64 * 1024,
            tree_cache_min_entries: 2,
            blob_cache_max_bytes: 64 * 1024,
            blob_cache_min_entries: 2,
            aux_cache_max_bytes: 16 * 1024,
            aux_cache_min_entries: 2,
            status_cache_max_bytes: 16 * 1024,
            status_cache_min_entries: 2,
            cache_shards: 2,
            caching_policy: CachingPolicy::Anything,
            trace_bus_capacity: 1024,
            activity_buffer_capacity: 32,
            journal_memory_limit: crate::journal::DEFAULT_MEMORY_LIMIT,
            notification_interval: Duration::from_millis(10),
            access_log_capacity: 16,
        }
    }
}
