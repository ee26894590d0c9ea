//! # Penumbra - Virtual Filesystem Object Store
//!
//! Penumbra is the object-graph storage core of a source-control-aware
//! virtual filesystem: it materializes a repository checkout on demand by
//! fetching content-addressed objects (trees, blobs, aux data) from a
//! backing store, caching them in memory and on disk, and recording every
//! working-copy mutation in a journal that external observers can replay.
//!
//! ## Architecture
//!
//! Penumbra is layered around five subsystems:
//!
//! - **Object store pipeline** ([`store`]): tiered lookup (memory cache,
//!   local on-disk store, backing store) behind a priority queue with
//!   request deduplication, serviced by a worker pool.
//! - **Object cache** ([`cache`]): a sharded LRU with a plain flavor and an
//!   interest-handle flavor for scoped retention.
//! - **Status cache** ([`store::status_cache`]): deduplicates concurrent
//!   status computations and validates reuse against the journal.
//! - **Journal** ([`journal`]): a bounded ordered log of filesystem deltas
//!   with compaction, subscription, and range accumulation.
//! - **Checkout state** ([`checkout`]): the versioned SNAPSHOT binary
//!   format plus the per-mount configuration surface.
//!
//! The filesystem channel adapters, wire protocols, and working-copy
//! materialization live outside this crate; they drive it through
//! [`store::ObjectStore`], [`journal::Journal`] and [`checkout`].

pub mod cache;
pub mod checkout;
pub mod config;
pub mod context;
pub mod error;
pub mod idgen;
pub mod journal;
pub mod logging;
pub mod model;
pub mod notify;
pub mod store;

// Re-export the main public API
pub use crate::config::StoreConfig;
pub use crate::context::{FetchCause, FetchContext, FetchOrigin, ProcessAccessLog};
pub use crate::error::{ObjectKind, Result, StoreError};
pub use crate::journal::{Journal, JournalDeltaRange};
pub use crate::model::{
    AbsolutePath, Blob, BlobAuxData, CaseSensitivity, ObjectId, PathComponent, RelativePath,
    RootId, Tree, TreeAuxData, TreeEntry, TreeEntryKind,
};
pub use crate::store::backing::{BackingStore, EmptyBackingStore, ObjectComparison};
pub use crate::store::local::{CachingPolicy, LocalStore};
pub use crate::store::priority::{ImportPriority, ImportPriorityKind};
pub use crate::store::status_cache::{ScmFileStatus, ScmStatus, StatusCache, StatusGet};
pub use crate::store::ObjectStore;
