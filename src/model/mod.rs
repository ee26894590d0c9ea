//! Content-addressed object model: ids, blobs, trees and their aux data.

pub mod path;

use std::fmt;

use bytes::Bytes;

use crate::error::{Result, StoreError};
pub use path::{AbsolutePath, CaseSensitivity, PathComponent, RelativePath};

/// An opaque content-addressed object identifier.
///
/// Byte equality implies the ids name the same object; inequality implies
/// nothing, because a backing store may use path-dependent encodings that
/// give one object several ids.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(Bytes);

impl ObjectId {
    /// Wrap raw id bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Parse a hex rendering of the id bytes.
    pub fn from_hex(hex_str: impl AsRef<[u8]>) -> Result<Self> {
        let raw = hex::decode(hex_str)
            .map_err(|_| StoreError::Corrupt("object id is not valid hex".into()))?;
        Ok(Self(Bytes::from(raw)))
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Byte length of the id.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length id.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", hex::encode(&self.0))
    }
}

/// A human-readable identifier for a repository root (a commit).
///
/// The empty string is the null root: the state before anything was checked
/// out.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootId(String);

impl RootId {
    /// Wrap a root id string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The null-root sentinel.
    pub fn null() -> Self {
        Self(String::new())
    }

    /// True for the null root.
    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    /// The root id string.
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootId({:?})", self.0)
    }
}

/// A file content object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    id: ObjectId,
    contents: Bytes,
}

impl Blob {
    /// Build a blob from its id and contents.
    pub fn new(id: ObjectId, contents: impl Into<Bytes>) -> Self {
        Self {
            id,
            contents: contents.into(),
        }
    }

    /// The blob's id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// The blob's contents.
    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    /// Content length in bytes.
    pub fn size_bytes(&self) -> usize {
        self.contents.len()
    }
}

/// Derived hashes and size kept next to a blob. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobAuxData {
    /// Content length in bytes.
    pub total_size: u64,
    /// SHA-1 of the contents.
    pub content_sha1: [u8; 20],
    /// Keyed BLAKE-3 of the contents, when the store computes one.
    pub blake3: Option<[u8; 32]>,
}

impl BlobAuxData {
    pub(crate) fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Derived digest kept next to a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeAuxData {
    /// Aggregate size of the tree's reachable blobs.
    pub digest_size: u64,
    /// Digest over the tree's entries.
    pub digest_hash: [u8; 32],
}

impl TreeAuxData {
    pub(crate) fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// What kind of entry a tree row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeEntryKind {
    /// A subdirectory.
    Tree,
    /// A regular file.
    RegularFile,
    /// A file with the executable bit set.
    ExecutableFile,
    /// A symbolic link.
    Symlink,
}

impl TreeEntryKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            TreeEntryKind::Tree => 0,
            TreeEntryKind::RegularFile => 1,
            TreeEntryKind::ExecutableFile => 2,
            TreeEntryKind::Symlink => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TreeEntryKind::Tree),
            1 => Ok(TreeEntryKind::RegularFile),
            2 => Ok(TreeEntryKind::ExecutableFile),
            3 => Ok(TreeEntryKind::Symlink),
            _ => Err(StoreError::Corrupt(format!("unknown tree entry kind {value}"))),
        }
    }
}

/// One row of a tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// The entry's object id.
    pub id: ObjectId,
    /// The entry's kind.
    pub kind: TreeEntryKind,
}

/// An immutable directory listing, ordered under the tree's case policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    id: ObjectId,
    case_sensitivity: CaseSensitivity,
    // Kept sorted by `case_sensitivity.compare` over the entry names.
    entries: Vec<(PathComponent, TreeEntry)>,
}

impl Tree {
    /// Build a tree, sorting the entries under the given policy.
    pub fn new(
        id: ObjectId,
        case_sensitivity: CaseSensitivity,
        mut entries: Vec<(PathComponent, TreeEntry)>,
    ) -> Self {
        entries.sort_by(|(a, _), (b, _)| case_sensitivity.compare(a.as_str(), b.as_str()));
        Self {
            id,
            case_sensitivity,
            entries,
        }
    }

    /// The tree's id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// The tree's comparison policy.
    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case_sensitivity
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by name under the tree's policy.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        let policy = self.case_sensitivity;
        self.entries
            .binary_search_by(|(entry_name, _)| policy.compare(entry_name.as_str(), name))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Entries in tree order.
    pub fn entries(&self) -> impl Iterator<Item = (&PathComponent, &TreeEntry)> {
        self.entries.iter().map(|(name, entry)| (name, entry))
    }

    /// Approximate heap footprint; feeds cache accounting.
    pub fn size_bytes(&self) -> usize {
        let per_entry = std::mem::size_of::<(PathComponent, TreeEntry)>();
        self.entries
            .iter()
            .map(|(name, entry)| per_entry + name.as_str().len() + entry.id.len())
            .sum::<usize>()
            + self.id.len()
    }
}

impl crate::cache::CacheSize for Blob {
    fn size_bytes(&self) -> usize {
        Blob::size_bytes(self)
    }
}

impl crate::cache::CacheSize for Tree {
    fn size_bytes(&self) -> usize {
        Tree::size_bytes(self)
    }
}

impl crate::cache::CacheSize for BlobAuxData {
    fn size_bytes(&self) -> usize {
        BlobAuxData::size_bytes(self)
    }
}

impl crate::cache::CacheSize for TreeAuxData {
    fn size_bytes(&self) -> usize {
        TreeAuxData::size_bytes(self)
    }
}
