//! The backing store facade.
//!
//! A backing store is the authoritative external source of trees, blobs and
//! aux data. Implementations must be thread-safe; their methods run on the
//! object store's worker pool, and the orchestrator's async surface is the
//! only place consumers wait.

use rustc_hash::FxHashSet;

use crate::context::{FetchContext, FetchOrigin};
use crate::error::{ObjectKind, Result, StoreError};
use crate::model::{Blob, BlobAuxData, ObjectId, RelativePath, RootId, Tree, TreeAuxData};

/// What comparing two object ids reveals about their contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectComparison {
    /// The ids alone do not decide it; the contents must be fetched.
    Unknown,
    /// The ids are known to name the same contents.
    Identical,
    /// The ids are known to name different contents.
    Different,
}

/// A fetched tree and where it came from.
#[derive(Debug)]
pub struct TreeFetch {
    /// The tree.
    pub tree: Tree,
    /// Which tier of the backing store produced it.
    pub origin: FetchOrigin,
}

/// A fetched blob and where it came from.
#[derive(Debug)]
pub struct BlobFetch {
    /// The blob.
    pub blob: Blob,
    /// Which tier of the backing store produced it.
    pub origin: FetchOrigin,
}

/// Fetched blob aux data, absent when the store has none for the id.
#[derive(Debug)]
pub struct BlobAuxFetch {
    /// The aux data, if any.
    pub aux: Option<BlobAuxData>,
    /// Which tier of the backing store produced it.
    pub origin: FetchOrigin,
}

/// Fetched tree aux data, absent when the store has none for the id.
#[derive(Debug)]
pub struct TreeAuxFetch {
    /// The aux data, if any.
    pub aux: Option<TreeAuxData>,
    /// Which tier of the backing store produced it.
    pub origin: FetchOrigin,
}

/// Abstract source of trees, blobs and aux data.
pub trait BackingStore: Send + Sync {
    /// Canonicalize a human-readable root id.
    fn parse_root_id(&self, root_id: &str) -> Result<RootId>;

    /// Render a root id for humans.
    fn render_root_id(&self, root_id: &RootId) -> String;

    /// Canonicalize a human-readable object id.
    fn parse_object_id(&self, object_id: &str) -> Result<ObjectId>;

    /// Render an object id for humans.
    fn render_object_id(&self, object_id: &ObjectId) -> String;

    /// Compare two ids without fetching. `Unknown` is allowed when the store
    /// uses path-dependent encodings.
    fn compare_objects_by_id(&self, one: &ObjectId, two: &ObjectId) -> ObjectComparison;

    /// Fetch the root tree of a commit.
    fn get_root_tree(&self, root_id: &RootId, context: &FetchContext) -> Result<Tree>;

    /// Fetch a tree.
    fn get_tree(&self, id: &ObjectId, context: &FetchContext) -> Result<TreeFetch>;

    /// Fetch a blob.
    fn get_blob(&self, id: &ObjectId, context: &FetchContext) -> Result<BlobFetch>;

    /// Fetch a blob's aux data.
    fn get_blob_aux_data(&self, id: &ObjectId, context: &FetchContext) -> Result<BlobAuxFetch>;

    /// Fetch a tree's aux data.
    fn get_tree_aux_data(&self, id: &ObjectId, context: &FetchContext) -> Result<TreeAuxFetch>;

    /// Warm the store for a set of blobs. The default does nothing.
    fn prefetch_blobs(&self, _ids: &[ObjectId], _context: &FetchContext) -> Result<()> {
        Ok(())
    }

    /// Opportunistically upload a known manifest for a root. Useful right
    /// after commit creation, before the store can resolve the root on its
    /// own. The default does nothing.
    fn import_manifest_for_root(
        &self,
        _root_id: &RootId,
        _manifest: &ObjectId,
        _context: &FetchContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Begin recording the paths of fetched files. Calling it twice has no
    /// additional effect.
    fn start_recording_fetch(&self) {}

    /// Stop recording and return the paths fetched since recording started.
    /// Only this call clears the accumulated records.
    fn stop_recording_fetch(&self) -> FxHashSet<RelativePath> {
        FxHashSet::default()
    }

    /// A name for the underlying repository, for logging.
    fn repo_name(&self) -> Option<String> {
        None
    }

    /// Periodic housekeeping hook. The default does nothing.
    fn periodic_management_task(&self) {}
}

/// Comparison helper for stores whose ids map one-to-one onto objects, such
/// as content-hashed stores: equal bytes mean equal objects, different
/// bytes mean different objects.
pub fn bijective_compare(one: &ObjectId, two: &ObjectId) -> ObjectComparison {
    if one == two {
        ObjectComparison::Identical
    } else {
        ObjectComparison::Different
    }
}

/// A backing store with nothing in it. Every lookup fails with `NotFound`.
#[derive(Debug, Default)]
pub struct EmptyBackingStore;

impl BackingStore for EmptyBackingStore {
    fn parse_root_id(&self, root_id: &str) -> Result<RootId> {
        Ok(RootId::new(root_id))
    }

    fn render_root_id(&self, root_id: &RootId) -> String {
        root_id.value().to_owned()
    }

    fn parse_object_id(&self, object_id: &str) -> Result<ObjectId> {
        ObjectId::from_hex(object_id)
    }

    fn render_object_id(&self, object_id: &ObjectId) -> String {
        object_id.to_string()
    }

    fn compare_objects_by_id(&self, one: &ObjectId, two: &ObjectId) -> ObjectComparison {
        bijective_compare(one, two)
    }

    fn get_root_tree(&self, root_id: &RootId, _context: &FetchContext) -> Result<Tree> {
        Err(StoreError::not_found(ObjectKind::Tree, root_id))
    }

    fn get_tree(&self, id: &ObjectId, _context: &FetchContext) -> Result<TreeFetch> {
        Err(StoreError::not_found(ObjectKind::Tree, id))
    }

    fn get_blob(&self, id: &ObjectId, _context: &FetchContext) -> Result<BlobFetch> {
        Err(StoreError::not_found(ObjectKind::Blob, id))
    }

    fn get_blob_aux_data(&self, id: &ObjectId, _context: &FetchContext) -> Result<BlobAuxFetch> {
        Err(StoreError::not_found(ObjectKind::BlobAux, id))
    }

    fn get_tree_aux_data(&self, id: &ObjectId, _context: &FetchContext) -> Result<TreeAuxFetch> {
        Err(StoreError::not_found(ObjectKind::TreeAux, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FetchCause;

    #[test]
    fn empty_store_finds_nothing() {
        let store = EmptyBackingStore;
        let context = FetchContext::new(FetchCause::Unknown);
        let id = ObjectId::from_bytes(vec![1; 20]);
        assert!(matches!(
            store.get_blob(&id, &context),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_root_tree(&RootId::new("r"), &context),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn bijective_comparison() {
        let a = ObjectId::from_bytes(vec![1; 20]);
        let b = ObjectId::from_bytes(vec![1; 20]);
        let c = ObjectId::from_bytes(vec![2; 20]);
        assert_eq!(bijective_compare(&a, &b), ObjectComparison::Identical);
        assert_eq!(bijective_compare(&a, &c), ObjectComparison::Different);
    }
}
