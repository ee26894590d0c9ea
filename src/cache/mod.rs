//! Sharded in-memory LRU cache for loaded objects.
//!
//! The cache is parameterized by a maximum byte budget and a minimum entry
//! count. Eviction runs when the budget is exceeded, but always leaves the
//! minimum entry count in place so a frequently-used object larger than the
//! whole budget stays cacheable.
//!
//! Two flavors exist and must not be mixed on one instance, enforced by the
//! `F` marker type: [`SimpleFlavor`] is a plain LRU; [`InterestHandleFlavor`]
//! adds scoped retention, where dropping the last [`InterestHandle`] for an
//! entry removes it immediately, ahead of LRU order.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;
use xxhash_rust::xxh64::xxh64;

use crate::idgen::generate_unique_id;
use crate::model::ObjectId;

/// Values stored in an [`ObjectCache`] report their own footprint.
pub trait CacheSize {
    /// Approximate bytes held by this value.
    fn size_bytes(&self) -> usize;
}

/// Marker for the flavor parameter of [`ObjectCache`].
pub trait CacheFlavor: private::Sealed {}

/// Plain LRU flavor.
pub enum SimpleFlavor {}

/// Scoped-retention flavor.
pub enum InterestHandleFlavor {}

impl CacheFlavor for SimpleFlavor {}
impl CacheFlavor for InterestHandleFlavor {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::SimpleFlavor {}
    impl Sealed for super::InterestHandleFlavor {}
}

/// How much the caller cares about an object staying cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Return the object if cached; no reference taken, no handle issued.
    UnlikelyNeededAgain,
    /// Take a reference without issuing a handle. The entry is assumed worth
    /// keeping until natural eviction.
    LikelyNeededAgain,
    /// Take a reference and issue a handle whose drop releases it.
    WantHandle,
}

/// Counters describing a cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently cached.
    pub object_count: usize,
    /// Bytes currently cached, as recorded at insert.
    pub total_size_bytes: usize,
    /// Lookup hits.
    pub hit_count: u64,
    /// Lookup misses.
    pub miss_count: u64,
    /// Entries removed by the LRU budget.
    pub eviction_count: u64,
    /// Entries removed by the last interest handle going away.
    pub drop_count: u64,
}

struct CacheItem<V> {
    object: Arc<V>,
    // Recorded at insert and never recomputed, so accounting stays
    // consistent even if the value's footprint estimate changes.
    size: usize,
    reference_count: u64,
    generation: u64,
    queue_stamp: u64,
}

struct Shard<V> {
    items: FxHashMap<ObjectId, CacheItem<V>>,
    // Eviction order, oldest in front. An entry is current only while its
    // stamp matches the item's `queue_stamp`; promotions leave stale slots
    // behind that are skipped (and periodically compacted away).
    queue: VecDeque<(ObjectId, u64)>,
    next_stamp: u64,
    total_size: usize,
    hit_count: u64,
    miss_count: u64,
    eviction_count: u64,
    drop_count: u64,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            items: FxHashMap::default(),
            queue: VecDeque::new(),
            next_stamp: 0,
            total_size: 0,
            hit_count: 0,
            miss_count: 0,
            eviction_count: 0,
            drop_count: 0,
        }
    }

    fn promote(&mut self, id: &ObjectId) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        match self.items.get_mut(id) {
            Some(item) => item.queue_stamp = stamp,
            None => return,
        }
        self.queue.push_back((id.clone(), stamp));
        self.maybe_compact();
    }

    fn maybe_compact(&mut self) {
        if self.queue.len() > 2 * self.items.len() + 16 {
            let items = &self.items;
            self.queue
                .retain(|(id, stamp)| items.get(id).is_some_and(|item| item.queue_stamp == *stamp));
        }
    }

    fn remove_item(&mut self, id: &ObjectId) {
        if let Some(item) = self.items.remove(id) {
            self.total_size -= item.size;
        }
    }

    /// Pop eviction candidates until one unpinned entry is removed. Pinned
    /// entries rotate to the back; stale slots are discarded. Returns false
    /// when nothing is evictable.
    fn evict_one(&mut self) -> bool {
        let mut remaining = self.queue.len();
        while remaining > 0 {
            remaining -= 1;
            let Some((id, stamp)) = self.queue.pop_front() else {
                return false;
            };
            match self.items.get(&id) {
                Some(item) if item.queue_stamp == stamp => {
                    if item.reference_count == 0 {
                        self.eviction_count += 1;
                        self.remove_item(&id);
                        return true;
                    }
                    self.queue.push_back((id, stamp));
                }
                _ => {}
            }
        }
        false
    }

    fn evict_until_fits(&mut self, max_bytes: usize, min_entries: usize) {
        while self.total_size > max_bytes && self.items.len() > min_entries {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Returns whether the id was freshly inserted. A duplicate insert keeps
    /// the existing value and only refreshes its LRU position.
    fn insert_impl(&mut self, id: &ObjectId, object: Arc<V>, size: usize) -> bool {
        if self.items.contains_key(id) {
            self.promote(id);
            return false;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.items.insert(
            id.clone(),
            CacheItem {
                object,
                size,
                reference_count: 0,
                generation: u64::MAX,
                queue_stamp: stamp,
            },
        );
        self.queue.push_back((id.clone(), stamp));
        self.total_size += size;
        true
    }

    fn get_impl(&mut self, id: &ObjectId) -> Option<Arc<V>> {
        if self.items.contains_key(id) {
            self.hit_count += 1;
            self.promote(id);
            self.items.get(id).map(|item| Arc::clone(&item.object))
        } else {
            self.miss_count += 1;
            None
        }
    }
}

struct CacheInner<V> {
    shards: Box<[Mutex<Shard<V>>]>,
    max_bytes_per_shard: usize,
    min_entries_per_shard: usize,
}

impl<V> CacheInner<V> {
    fn shard_for(&self, id: &ObjectId) -> &Mutex<Shard<V>> {
        let idx = (xxh64(id.as_bytes(), 0) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Return the object and refresh its LRU position, touching nothing
    /// else. This is what a handle's revalidation does.
    fn get_object(&self, id: &ObjectId) -> Option<Arc<V>> {
        self.shard_for(id).lock().get_impl(id)
    }

    fn drop_interest(&self, id: &ObjectId, generation: u64) {
        let mut shard = self.shard_for(id).lock();
        let Some(item) = shard.items.get_mut(id) else {
            // Already evicted.
            return;
        };
        if item.generation != generation {
            // Evicted and re-inserted between handle creation and drop.
            return;
        }
        if item.reference_count == 0 {
            warn!(%id, "interest handle dropped with zero reference count");
            return;
        }
        item.reference_count -= 1;
        if item.reference_count == 0 {
            shard.drop_count += 1;
            shard.remove_item(id);
        }
    }
}

/// Result of an interest-flavored lookup.
pub struct CacheHit<V> {
    /// The cached object, when present.
    pub object: Option<Arc<V>>,
    /// A retention handle, only issued for [`Interest::WantHandle`].
    pub handle: Option<InterestHandle<V>>,
}

impl<V> CacheHit<V> {
    fn miss() -> Self {
        Self {
            object: None,
            handle: None,
        }
    }
}

/// A sharded LRU cache over content-addressed objects. Cheap to clone; all
/// clones share the same storage.
pub struct ObjectCache<V, F: CacheFlavor> {
    inner: Arc<CacheInner<V>>,
    _flavor: PhantomData<F>,
}

impl<V, F: CacheFlavor> Clone for ObjectCache<V, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _flavor: PhantomData,
        }
    }
}

impl<V, F: CacheFlavor> ObjectCache<V, F> {
    /// Create a cache with the given byte budget, minimum entry count, and
    /// shard count. Budgets are split per shard; the minimum entry count is
    /// divided rounded up, with a floor of one entry per shard whenever a
    /// minimum is requested at all.
    pub fn new(max_bytes: usize, min_entries: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let min_entries_per_shard = if min_entries == 0 {
            0
        } else {
            min_entries.div_ceil(shard_count).max(1)
        };
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(CacheInner {
                shards,
                max_bytes_per_shard: max_bytes / shard_count,
                min_entries_per_shard,
            }),
            _flavor: PhantomData,
        }
    }

    /// True when the id is currently cached. Does not affect LRU order.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.shard_for(id).lock().items.contains_key(id)
    }

    /// Evict everything.
    pub fn clear(&self) {
        for shard in self.inner.shards.iter() {
            let mut shard = shard.lock();
            shard.items.clear();
            shard.queue.clear();
            shard.total_size = 0;
        }
    }

    /// Aggregate counters across all shards.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in self.inner.shards.iter() {
            let shard = shard.lock();
            stats.object_count += shard.items.len();
            stats.total_size_bytes += shard.total_size;
            stats.hit_count += shard.hit_count;
            stats.miss_count += shard.miss_count;
            stats.eviction_count += shard.eviction_count;
            stats.drop_count += shard.drop_count;
        }
        stats
    }
}

impl<V: CacheSize> ObjectCache<V, SimpleFlavor> {
    /// Return the cached value and refresh its LRU position.
    pub fn get(&self, id: &ObjectId) -> Option<Arc<V>> {
        self.inner.get_object(id)
    }

    /// Insert a value, evicting from the front of the shard until the shard
    /// fits its budget or holds no more than its minimum entry count.
    pub fn insert(&self, id: ObjectId, object: Arc<V>) {
        let size = object.size_bytes();
        let mut shard = self.inner.shard_for(&id).lock();
        if shard.insert_impl(&id, object, size) {
            shard.evict_until_fits(
                self.inner.max_bytes_per_shard,
                self.inner.min_entries_per_shard,
            );
        }
    }

    /// Drop one entry, if present. A later insert of the same id stores the
    /// new value (a plain insert would keep the old one).
    pub fn invalidate(&self, id: &ObjectId) {
        self.inner.shard_for(id).lock().remove_item(id);
    }
}

impl<V: CacheSize> ObjectCache<V, InterestHandleFlavor> {
    /// Look up an object, registering the caller's interest in it.
    pub fn get_with_interest(&self, id: &ObjectId, interest: Interest) -> CacheHit<V> {
        let (object, generation) = {
            let mut shard = self.inner.shard_for(id).lock();
            let Some(object) = shard.get_impl(id) else {
                return CacheHit::miss();
            };
            let item = shard.items.get_mut(id).expect("item just looked up");
            match interest {
                Interest::UnlikelyNeededAgain => {}
                Interest::LikelyNeededAgain | Interest::WantHandle => {
                    item.reference_count += 1;
                }
            }
            (object, item.generation)
        };

        let handle = (interest == Interest::WantHandle).then(|| InterestHandle {
            cache: Arc::downgrade(&self.inner),
            id: id.clone(),
            object: Arc::downgrade(&object),
            generation,
        });
        CacheHit {
            object: Some(object),
            handle,
        }
    }

    /// Insert an object, registering the caller's interest in it. Returns a
    /// retention handle for [`Interest::WantHandle`].
    pub fn insert_with_interest(
        &self,
        id: ObjectId,
        object: Arc<V>,
        interest: Interest,
    ) -> Option<InterestHandle<V>> {
        let size = object.size_bytes();
        let weak_object = Arc::downgrade(&object);
        let new_generation = generate_unique_id();

        let generation = {
            let mut guard = self.inner.shard_for(&id).lock();
            let shard = &mut *guard;
            let inserted = shard.insert_impl(&id, object, size);
            let generation = {
                let item = shard.items.get_mut(&id).expect("item just inserted");
                match interest {
                    Interest::UnlikelyNeededAgain => {}
                    Interest::LikelyNeededAgain | Interest::WantHandle => {
                        item.reference_count += 1;
                    }
                }
                if inserted {
                    item.generation = new_generation;
                    new_generation
                } else {
                    // Duplicate insert: adopt the existing entry's
                    // generation.
                    item.generation
                }
            };
            if inserted {
                shard.evict_until_fits(
                    self.inner.max_bytes_per_shard,
                    self.inner.min_entries_per_shard,
                );
            }
            // A duplicate insert skips eviction: the cache did not grow.
            generation
        };

        (interest == Interest::WantHandle).then(|| InterestHandle {
            cache: Arc::downgrade(&self.inner),
            id,
            object: weak_object,
            generation,
        })
    }
}

/// A scoped token keeping one cache entry alive while held.
///
/// Move-only. Dropping it releases the reference; when the last reference
/// goes away the entry is removed from the cache immediately. The handle
/// also keeps a weak edge to the value itself, so [`InterestHandle::object`]
/// can succeed even after the cache has moved on.
pub struct InterestHandle<V> {
    cache: Weak<CacheInner<V>>,
    id: ObjectId,
    object: Weak<V>,
    generation: u64,
}

impl<V> InterestHandle<V> {
    /// Fetch the referenced object, refreshing its LRU position when it is
    /// still cached, and falling back to the weak value edge otherwise. No
    /// new reference is taken.
    pub fn object(&self) -> Option<Arc<V>> {
        if let Some(cache) = self.cache.upgrade() {
            if let Some(object) = cache.get_object(&self.id) {
                return Some(object);
            }
        }
        self.object.upgrade()
    }

    /// Release the reference early, without waiting for drop.
    pub fn reset(&mut self) {
        let cache = std::mem::replace(&mut self.cache, Weak::new());
        if let Some(cache) = cache.upgrade() {
            cache.drop_interest(&self.id, self.generation);
        }
    }
}

impl<V> Drop for InterestHandle<V> {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sized(usize);

    impl CacheSize for Sized {
        fn size_bytes(&self) -> usize {
            self.0
        }
    }

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes(vec![byte; 20])
    }

    fn simple(max_bytes: usize, min_entries: usize) -> ObjectCache<Sized, SimpleFlavor> {
        ObjectCache::new(max_bytes, min_entries, 1)
    }

    fn interest(
        max_bytes: usize,
        min_entries: usize,
    ) -> ObjectCache<Sized, InterestHandleFlavor> {
        ObjectCache::new(max_bytes, min_entries, 1)
    }

    #[test]
    fn insert_then_get() {
        let cache = simple(10, 1);
        cache.insert(oid(1), Arc::new(Sized(3)));
        assert!(cache.contains(&oid(1)));
        assert_eq!(cache.get(&oid(1)).unwrap().0, 3);
        assert!(cache.get(&oid(2)).is_none());
    }

    #[test]
    fn eviction_respects_byte_budget() {
        let cache = simple(10, 1);
        for byte in 1..=4 {
            cache.insert(oid(byte), Arc::new(Sized(3)));
        }
        // 12 bytes exceeds the budget; the oldest entry goes.
        assert!(!cache.contains(&oid(1)));
        for byte in 2..=4 {
            assert!(cache.contains(&oid(byte)));
        }
        assert_eq!(cache.stats().total_size_bytes, 9);
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[test]
    fn get_refreshes_lru_position() {
        let cache = simple(10, 1);
        cache.insert(oid(1), Arc::new(Sized(3)));
        cache.insert(oid(2), Arc::new(Sized(3)));
        cache.insert(oid(3), Arc::new(Sized(3)));
        cache.get(&oid(1));
        cache.insert(oid(4), Arc::new(Sized(3)));
        // oid(2) was the least recently used after the touch of oid(1).
        assert!(cache.contains(&oid(1)));
        assert!(!cache.contains(&oid(2)));
    }

    #[test]
    fn duplicate_insert_keeps_existing_value() {
        let cache = simple(100, 1);
        cache.insert(oid(1), Arc::new(Sized(3)));
        cache.insert(oid(1), Arc::new(Sized(9)));
        assert_eq!(cache.get(&oid(1)).unwrap().0, 3);
        assert_eq!(cache.stats().object_count, 1);
    }

    #[test]
    fn invalidate_allows_replacement() {
        let cache = simple(100, 1);
        cache.insert(oid(1), Arc::new(Sized(3)));
        cache.invalidate(&oid(1));
        assert!(!cache.contains(&oid(1)));
        cache.insert(oid(1), Arc::new(Sized(9)));
        assert_eq!(cache.get(&oid(1)).unwrap().0, 9);
    }

    #[test]
    fn minimum_entries_overrides_byte_budget() {
        let cache = simple(10, 1);
        cache.insert(oid(1), Arc::new(Sized(100)));
        // One huge object is always cacheable.
        assert!(cache.contains(&oid(1)));
        cache.insert(oid(2), Arc::new(Sized(100)));
        assert_eq!(cache.stats().object_count, 1);
    }

    #[test]
    fn want_handle_drop_evicts_immediately() {
        let cache = interest(100, 0);
        let handle = cache
            .insert_with_interest(oid(1), Arc::new(Sized(3)), Interest::WantHandle)
            .unwrap();
        assert!(cache.contains(&oid(1)));
        drop(handle);
        assert!(!cache.contains(&oid(1)));
        assert_eq!(cache.stats().drop_count, 1);
    }

    #[test]
    fn handle_yields_object_after_eviction() {
        let cache = interest(100, 0);
        let object = Arc::new(Sized(3));
        let handle = cache
            .insert_with_interest(oid(1), Arc::clone(&object), Interest::WantHandle)
            .unwrap();
        cache.clear();
        assert!(!cache.contains(&oid(1)));
        // The weak value edge still resolves while the Arc lives.
        assert!(handle.object().is_some());
        drop(object);
        assert!(handle.object().is_none());
    }

    #[test]
    fn stale_handle_drop_is_a_no_op() {
        let cache = interest(100, 0);
        let handle = cache
            .insert_with_interest(oid(1), Arc::new(Sized(3)), Interest::WantHandle)
            .unwrap();
        cache.clear();
        // Re-insert under a fresh generation.
        let keep =
            cache.insert_with_interest(oid(1), Arc::new(Sized(4)), Interest::LikelyNeededAgain);
        assert!(keep.is_none());
        drop(handle);
        // The old handle must not tear down the new entry.
        assert!(cache.contains(&oid(1)));
    }

    #[test]
    fn pinned_entries_survive_budget_eviction() {
        let cache = interest(10, 0);
        let _handle = cache
            .insert_with_interest(oid(1), Arc::new(Sized(6)), Interest::WantHandle)
            .unwrap();
        cache.insert_with_interest(oid(2), Arc::new(Sized(6)), Interest::UnlikelyNeededAgain);
        // Over budget, but only the unpinned entry may go.
        assert!(cache.contains(&oid(1)));
        assert!(!cache.contains(&oid(2)));
    }

    #[test]
    fn likely_needed_again_pins_without_handle() {
        let cache = interest(10, 0);
        let hit =
            cache.insert_with_interest(oid(1), Arc::new(Sized(6)), Interest::LikelyNeededAgain);
        assert!(hit.is_none());
        cache.insert_with_interest(oid(2), Arc::new(Sized(6)), Interest::UnlikelyNeededAgain);
        assert!(cache.contains(&oid(1)));
        assert!(!cache.contains(&oid(2)));
    }

    #[test]
    fn get_with_interest_issues_handles_on_demand() {
        let cache = interest(100, 0);
        cache.insert_with_interest(oid(1), Arc::new(Sized(3)), Interest::UnlikelyNeededAgain);

        let peek = cache.get_with_interest(&oid(1), Interest::UnlikelyNeededAgain);
        assert!(peek.object.is_some());
        assert!(peek.handle.is_none());

        let held = cache.get_with_interest(&oid(1), Interest::WantHandle);
        let handle = held.handle.unwrap();
        drop(handle);
        // The only reference came from the handle; the entry is gone.
        assert!(!cache.contains(&oid(1)));
    }

    #[test]
    fn sharded_budget_splits_evenly() {
        let cache: ObjectCache<Sized, SimpleFlavor> = ObjectCache::new(100, 4, 4);
        assert_eq!(cache.inner.max_bytes_per_shard, 25);
        assert_eq!(cache.inner.min_entries_per_shard, 1);
        for byte in 0..32 {
            cache.insert(oid(byte), Arc::new(Sized(10)));
        }
        let stats = cache.stats();
        assert!(stats.object_count >= 4);
        assert!(stats.eviction_count > 0);
    }
}
