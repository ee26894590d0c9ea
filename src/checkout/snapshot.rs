//! SNAPSHOT file codec.
//!
//! The SNAPSHOT file records which commit a working copy sits on, or which
//! checkout transition is underway. All multi-byte integers are big-endian.
//!
//! Layout:
//!
//! - 4-byte identifier: `"eden"`
//! - 4-byte format version
//!
//! Followed by, per version:
//!
//! - v1 (legacy): 20-byte binary commit id, optionally a second one (never
//!   read back).
//! - v2 (legacy): 32-bit length, root id string of that length.
//! - v3 (checkout in progress): 32-bit pid of the process doing the
//!   checkout, then length-prefixed from and to root id strings.
//! - v4 (steady state): length-prefixed working copy parent and checked out
//!   root id strings.

use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::model::RootId;

const SNAPSHOT_MAGIC: &[u8; 4] = b"eden";
const SNAPSHOT_HEADER_SIZE: usize = 8;

const FORMAT_VERSION_1: u32 = 1;
const FORMAT_VERSION_2: u32 = 2;
const FORMAT_CHECKOUT_IN_PROGRESS: u32 = 3;
const FORMAT_WORKING_COPY_PARENT_AND_CHECKED_OUT: u32 = 4;

/// Raw byte length of a legacy v1 commit hash.
const V1_HASH_SIZE: usize = 20;

/// The checkout state recorded in a SNAPSHOT file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentCommit {
    /// Steady state: the working copy parent and the checked out revision.
    /// Equal unless the parent was reset without updating the working copy.
    WorkingCopyParentAndCheckedOutRevision {
        /// The working copy parent commit.
        parent: RootId,
        /// The revision the working copy files come from.
        checked_out: RootId,
    },
    /// A checkout is in flight.
    CheckoutInProgress {
        /// Root the checkout started from.
        from: RootId,
        /// Root the checkout is moving to.
        to: RootId,
        /// Pid of the process performing the checkout.
        pid: u32,
    },
}

/// Which root to pick out of a [`ParentCommit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootIdPreference {
    /// During a checkout, prefer the destination.
    To,
    /// During a checkout, prefer the origin.
    From,
    /// Only accept a settled checkout.
    OnlyStable,
}

impl ParentCommit {
    /// The most recent checkout destination under the given preference.
    pub fn last_checkout_id(&self, preference: RootIdPreference) -> Option<&RootId> {
        match self {
            ParentCommit::WorkingCopyParentAndCheckedOutRevision { checked_out, .. } => {
                Some(checked_out)
            }
            ParentCommit::CheckoutInProgress { from, to, .. } => match preference {
                RootIdPreference::To => Some(to),
                RootIdPreference::From => Some(from),
                RootIdPreference::OnlyStable => None,
            },
        }
    }

    /// True while a checkout is in flight.
    pub fn is_checkout_in_progress(&self) -> bool {
        matches!(self, ParentCommit::CheckoutInProgress { .. })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(StoreError::Corrupt(
                "SNAPSHOT file ends mid-field".to_string(),
            ));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32_be()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::Corrupt("SNAPSHOT root id is not UTF-8".to_string()))
    }
}

/// Read the checkout state from a SNAPSHOT file.
pub fn read_parent_commit(path: &Path) -> Result<ParentCommit> {
    let contents = std::fs::read(path)?;
    if contents.len() < SNAPSHOT_HEADER_SIZE {
        return Err(StoreError::Corrupt(format!(
            "SNAPSHOT file is too short ({} bytes)",
            contents.len()
        )));
    }
    if &contents[..4] != SNAPSHOT_MAGIC {
        return Err(StoreError::Corrupt(
            "unsupported legacy SNAPSHOT file".to_string(),
        ));
    }

    let mut cursor = Cursor::new(&contents[4..]);
    let version = cursor.read_u32_be()?;
    match version {
        FORMAT_VERSION_1 => {
            if cursor.remaining() != V1_HASH_SIZE && cursor.remaining() != 2 * V1_HASH_SIZE {
                return Err(StoreError::Corrupt(format!(
                    "unexpected length for v1 SNAPSHOT file ({} bytes)",
                    contents.len()
                )));
            }
            let hash = cursor.read_bytes(V1_HASH_SIZE)?;
            // A second parent hash may follow; it is never used.

            // v1 stored hashes as binary, but RootId prefers them inflated
            // to human-readable ASCII, so hexlify here.
            let root = RootId::new(hex::encode(hash));
            Ok(ParentCommit::WorkingCopyParentAndCheckedOutRevision {
                parent: root.clone(),
                checked_out: root,
            })
        }
        FORMAT_VERSION_2 => {
            let root = RootId::new(cursor.read_string()?);
            Ok(ParentCommit::WorkingCopyParentAndCheckedOutRevision {
                parent: root.clone(),
                checked_out: root,
            })
        }
        FORMAT_CHECKOUT_IN_PROGRESS => {
            let pid = cursor.read_u32_be()?;
            let from = RootId::new(cursor.read_string()?);
            let to = RootId::new(cursor.read_string()?);
            Ok(ParentCommit::CheckoutInProgress { from, to, pid })
        }
        FORMAT_WORKING_COPY_PARENT_AND_CHECKED_OUT => {
            let parent = RootId::new(cursor.read_string()?);
            let checked_out = RootId::new(cursor.read_string()?);
            Ok(ParentCommit::WorkingCopyParentAndCheckedOutRevision {
                parent,
                checked_out,
            })
        }
        other => Err(StoreError::Corrupt(format!(
            "unsupported SNAPSHOT file format (version {other})"
        ))),
    }
}

fn push_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Writers see either the old or the new file, never a mix: the contents go
/// to a temporary file in the same directory, which is renamed over the
/// destination.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        StoreError::Corrupt(format!("SNAPSHOT path has no parent: {}", path.display()))
    })?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_data()?;
    temp.persist(path)
        .map_err(|persist_error| StoreError::Io(persist_error.error))?;
    Ok(())
}

fn write_working_copy_parent_and_checked_out(
    path: &Path,
    parent: &RootId,
    checked_out: &RootId,
) -> Result<()> {
    let mut buf = Vec::with_capacity(
        SNAPSHOT_HEADER_SIZE + 8 + parent.value().len() + checked_out.value().len(),
    );
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.extend_from_slice(&FORMAT_WORKING_COPY_PARENT_AND_CHECKED_OUT.to_be_bytes());
    push_string(&mut buf, parent.value());
    push_string(&mut buf, checked_out.value());
    write_atomically(path, &buf)
}

/// Record a completed checkout: both the working copy parent and the checked
/// out revision become `commit`.
pub fn set_checked_out_commit(path: &Path, commit: &RootId) -> Result<()> {
    debug!(%commit, "writing checked out commit");
    write_working_copy_parent_and_checked_out(path, commit, commit)
}

/// Move the working copy parent while keeping the checked out revision that
/// is currently on disk. Fails when a checkout is in flight, since there is
/// no stable checked out revision to preserve.
pub fn set_working_copy_parent(path: &Path, commit: &RootId) -> Result<()> {
    let current = read_parent_commit(path)?;
    let checked_out = current
        .last_checkout_id(RootIdPreference::OnlyStable)
        .ok_or_else(|| {
            StoreError::Protocol("cannot move working copy parent during a checkout".to_string())
        })?
        .clone();
    write_working_copy_parent_and_checked_out(path, commit, &checked_out)
}

/// Record the start of a checkout from `from` to `to`.
pub fn set_checkout_in_progress(path: &Path, from: &RootId, to: &RootId) -> Result<()> {
    let mut buf = Vec::with_capacity(
        SNAPSHOT_HEADER_SIZE + 12 + from.value().len() + to.value().len(),
    );
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.extend_from_slice(&FORMAT_CHECKOUT_IN_PROGRESS.to_be_bytes());
    buf.extend_from_slice(&std::process::id().to_be_bytes());
    push_string(&mut buf, from.value());
    push_string(&mut buf, to.value());
    write_atomically(path, &buf)
}
