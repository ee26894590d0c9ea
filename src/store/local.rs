//! The local on-disk cache sitting between the in-memory caches and the
//! backing store.
//!
//! Objects are stored in a bundled SQLite database, one table per object
//! family, keyed by raw object id. Payloads use a small versioned binary
//! codec with a crc32 trailer; any record that fails to decode is treated
//! as a miss, deleted, and refetched from the tier below.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::model::{
    Blob, BlobAuxData, CaseSensitivity, ObjectId, PathComponent, Tree, TreeAuxData, TreeEntry,
    TreeEntryKind,
};

/// Which object families are written back to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingPolicy {
    /// Write nothing.
    NoCaching,
    /// Write trees (and tree aux data).
    Trees,
    /// Write blobs.
    Blobs,
    /// Write blob aux data.
    BlobAuxData,
    /// Write trees and both aux data families, but not blobs.
    TreesAndBlobAuxData,
    /// Write everything.
    Anything,
}

/// The families a caching policy decides over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedFamily {
    /// Tree listings.
    Trees,
    /// Blob contents.
    Blobs,
    /// Blob aux data.
    BlobAux,
    /// Tree aux data.
    TreeAux,
}

impl CachingPolicy {
    /// Whether objects of `family` should be written to the local store.
    pub fn should_cache(self, family: CachedFamily) -> bool {
        match self {
            CachingPolicy::NoCaching => false,
            CachingPolicy::Anything => true,
            CachingPolicy::Trees => matches!(family, CachedFamily::Trees | CachedFamily::TreeAux),
            CachingPolicy::Blobs => matches!(family, CachedFamily::Blobs),
            CachingPolicy::BlobAuxData => matches!(family, CachedFamily::BlobAux),
            CachingPolicy::TreesAndBlobAuxData => !matches!(family, CachedFamily::Blobs),
        }
    }
}

const TREE_RECORD_VERSION: u8 = 1;
const AUX_RECORD_VERSION: u8 = 1;

fn sql_error(err: rusqlite::Error) -> StoreError {
    StoreError::Io(std::io::Error::other(err))
}

fn crc_of(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn seal(mut payload: Vec<u8>) -> Vec<u8> {
    let crc = crc_of(&payload);
    payload.extend_from_slice(&crc.to_be_bytes());
    payload
}

fn unseal(record: &[u8]) -> Result<&[u8]> {
    if record.len() < 4 {
        return Err(StoreError::Corrupt("local store record too short".into()));
    }
    let (payload, trailer) = record.split_at(record.len() - 4);
    let stored = u32::from_be_bytes(trailer.try_into().expect("4-byte slice"));
    if crc_of(payload) != stored {
        return Err(StoreError::Corrupt("local store record crc mismatch".into()));
    }
    Ok(payload)
}

fn encode_tree(tree: &Tree) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + tree.size_bytes());
    payload.push(TREE_RECORD_VERSION);
    payload.push(match tree.case_sensitivity() {
        CaseSensitivity::Sensitive => 0,
        CaseSensitivity::Insensitive => 1,
    });
    payload.extend_from_slice(&(tree.len() as u32).to_be_bytes());
    for (name, entry) in tree.entries() {
        payload.extend_from_slice(&(name.as_str().len() as u16).to_be_bytes());
        payload.extend_from_slice(name.as_str().as_bytes());
        payload.extend_from_slice(&(entry.id.len() as u16).to_be_bytes());
        payload.extend_from_slice(entry.id.as_bytes());
        payload.push(entry.kind.as_u8());
    }
    seal(payload)
}

fn decode_tree(id: &ObjectId, record: &[u8]) -> Result<Tree> {
    let payload = unseal(record)?;
    let mut cursor = payload;
    let version = take(&mut cursor, 1)?[0];
    if version != TREE_RECORD_VERSION {
        return Err(StoreError::Corrupt(format!(
            "unknown tree record version {version}"
        )));
    }
    let case_sensitivity = match take(&mut cursor, 1)?[0] {
        0 => CaseSensitivity::Sensitive,
        1 => CaseSensitivity::Insensitive,
        other => {
            return Err(StoreError::Corrupt(format!(
                "unknown case sensitivity byte {other}"
            )))
        }
    };
    let count = u32::from_be_bytes(take(&mut cursor, 4)?.try_into().expect("4-byte slice"));
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len =
            u16::from_be_bytes(take(&mut cursor, 2)?.try_into().expect("2-byte slice")) as usize;
        let name_bytes = take(&mut cursor, name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| StoreError::Corrupt("tree entry name is not UTF-8".into()))?;
        let id_len =
            u16::from_be_bytes(take(&mut cursor, 2)?.try_into().expect("2-byte slice")) as usize;
        let entry_id = ObjectId::from_bytes(take(&mut cursor, id_len)?.to_vec());
        let kind = TreeEntryKind::from_u8(take(&mut cursor, 1)?[0])?;
        let component = PathComponent::new(name)
            .map_err(|err| StoreError::Corrupt(format!("bad tree entry name: {err}")))?;
        entries.push((component, TreeEntry { id: entry_id, kind }));
    }
    Ok(Tree::new(id.clone(), case_sensitivity, entries))
}

fn encode_blob_aux(aux: &BlobAuxData) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + 8 + 20 + 1 + 32);
    payload.push(AUX_RECORD_VERSION);
    payload.extend_from_slice(&aux.total_size.to_be_bytes());
    payload.extend_from_slice(&aux.content_sha1);
    match aux.blake3 {
        Some(blake3) => {
            payload.push(1);
            payload.extend_from_slice(&blake3);
        }
        None => payload.push(0),
    }
    seal(payload)
}

fn decode_blob_aux(record: &[u8]) -> Result<BlobAuxData> {
    let payload = unseal(record)?;
    let mut cursor = payload;
    let version = take(&mut cursor, 1)?[0];
    if version != AUX_RECORD_VERSION {
        return Err(StoreError::Corrupt(format!(
            "unknown blob aux record version {version}"
        )));
    }
    let total_size = u64::from_be_bytes(take(&mut cursor, 8)?.try_into().expect("8-byte slice"));
    let content_sha1: [u8; 20] = take(&mut cursor, 20)?.try_into().expect("20-byte slice");
    let blake3 = match take(&mut cursor, 1)?[0] {
        0 => None,
        1 => Some(take(&mut cursor, 32)?.try_into().expect("32-byte slice")),
        other => {
            return Err(StoreError::Corrupt(format!(
                "unknown blake3 presence byte {other}"
            )))
        }
    };
    Ok(BlobAuxData {
        total_size,
        content_sha1,
        blake3,
    })
}

fn encode_tree_aux(aux: &TreeAuxData) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + 8 + 32);
    payload.push(AUX_RECORD_VERSION);
    payload.extend_from_slice(&aux.digest_size.to_be_bytes());
    payload.extend_from_slice(&aux.digest_hash);
    seal(payload)
}

fn decode_tree_aux(record: &[u8]) -> Result<TreeAuxData> {
    let payload = unseal(record)?;
    let mut cursor = payload;
    let version = take(&mut cursor, 1)?[0];
    if version != AUX_RECORD_VERSION {
        return Err(StoreError::Corrupt(format!(
            "unknown tree aux record version {version}"
        )));
    }
    let digest_size = u64::from_be_bytes(take(&mut cursor, 8)?.try_into().expect("8-byte slice"));
    let digest_hash: [u8; 32] = take(&mut cursor, 32)?.try_into().expect("32-byte slice");
    Ok(TreeAuxData {
        digest_size,
        digest_hash,
    })
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if cursor.len() < len {
        return Err(StoreError::Corrupt("local store record truncated".into()));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

/// On-disk key-value cache of fetched objects.
pub struct LocalStore {
    connection: Mutex<Connection>,
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let connection = Connection::open(path).map_err(sql_error)?;
        Self::initialize(connection)
    }

    /// An in-memory store for tests.
    pub fn in_memory() -> Result<Arc<Self>> {
        let connection = Connection::open_in_memory().map_err(sql_error)?;
        Self::initialize(connection)
    }

    fn initialize(connection: Connection) -> Result<Arc<Self>> {
        connection
            .execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 CREATE TABLE IF NOT EXISTS blobs (id BLOB PRIMARY KEY, data BLOB NOT NULL);
                 CREATE TABLE IF NOT EXISTS trees (id BLOB PRIMARY KEY, data BLOB NOT NULL);
                 CREATE TABLE IF NOT EXISTS blob_aux (id BLOB PRIMARY KEY, data BLOB NOT NULL);
                 CREATE TABLE IF NOT EXISTS tree_aux (id BLOB PRIMARY KEY, data BLOB NOT NULL);",
            )
            .map_err(sql_error)?;
        Ok(Arc::new(Self {
            connection: Mutex::new(connection),
        }))
    }

    fn read_record(&self, table: &str, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        let connection = self.connection.lock();
        let query = format!("SELECT data FROM {table} WHERE id = ?1");
        connection
            .query_row(&query, [id.as_bytes()], |row| row.get::<_, Vec<u8>>(0))
            .optional()
            .map_err(sql_error)
    }

    fn write_record(&self, table: &str, id: &ObjectId, data: &[u8]) -> Result<()> {
        let connection = self.connection.lock();
        let statement = format!("INSERT OR REPLACE INTO {table} (id, data) VALUES (?1, ?2)");
        connection
            .execute(&statement, rusqlite::params![id.as_bytes(), data])
            .map_err(sql_error)?;
        Ok(())
    }

    fn delete_record(&self, table: &str, id: &ObjectId) {
        let connection = self.connection.lock();
        let statement = format!("DELETE FROM {table} WHERE id = ?1");
        let _ = connection.execute(&statement, [id.as_bytes()]);
    }

    /// Decode a record, downgrading decode failures to a miss: the record
    /// is deleted and the caller falls through to the next tier.
    fn decode_or_miss<T>(
        &self,
        table: &str,
        id: &ObjectId,
        record: Option<Vec<u8>>,
        decode: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Option<T> {
        let record = record?;
        match decode(&record) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%id, table, %err, "dropping undecodable local store record");
                self.delete_record(table, id);
                None
            }
        }
    }

    /// Look up a blob. Decode failures count as misses.
    pub fn get_blob(&self, id: &ObjectId) -> Result<Option<Blob>> {
        let record = self.read_record("blobs", id)?;
        Ok(self.decode_or_miss("blobs", id, record, |record| {
            let payload = unseal(record)?;
            Ok(Blob::new(id.clone(), payload.to_vec()))
        }))
    }

    /// Write a blob.
    pub fn put_blob(&self, blob: &Blob) -> Result<()> {
        self.write_record("blobs", blob.id(), &seal(blob.contents().to_vec()))
    }

    /// Look up a tree. Decode failures count as misses.
    pub fn get_tree(&self, id: &ObjectId) -> Result<Option<Tree>> {
        let record = self.read_record("trees", id)?;
        Ok(self.decode_or_miss("trees", id, record, |record| decode_tree(id, record)))
    }

    /// Write a tree.
    pub fn put_tree(&self, tree: &Tree) -> Result<()> {
        self.write_record("trees", tree.id(), &encode_tree(tree))
    }

    /// Look up blob aux data. Decode failures count as misses.
    pub fn get_blob_aux(&self, id: &ObjectId) -> Result<Option<BlobAuxData>> {
        let record = self.read_record("blob_aux", id)?;
        Ok(self.decode_or_miss("blob_aux", id, record, decode_blob_aux))
    }

    /// Write blob aux data.
    pub fn put_blob_aux(&self, id: &ObjectId, aux: &BlobAuxData) -> Result<()> {
        self.write_record("blob_aux", id, &encode_blob_aux(aux))
    }

    /// Look up tree aux data. Decode failures count as misses.
    pub fn get_tree_aux(&self, id: &ObjectId) -> Result<Option<TreeAuxData>> {
        let record = self.read_record("tree_aux", id)?;
        Ok(self.decode_or_miss("tree_aux", id, record, decode_tree_aux))
    }

    /// Write tree aux data.
    pub fn put_tree_aux(&self, id: &ObjectId, aux: &TreeAuxData) -> Result<()> {
        self.write_record("tree_aux", id, &encode_tree_aux(aux))
    }
}
