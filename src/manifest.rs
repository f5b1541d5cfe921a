//! # Manifests and Reconciliation
//!
//! A manifest is a peer's versioned list of [`FileRecord`]s. Comparing a remote
//! manifest with local records yields the files to fetch and the deletions to apply;
//! the most recent update-time wins and local state never regresses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Metadata for one path of a shared folder.
///
/// Live records carry every field. Tombstones (`deleted == true`) keep only `path`,
/// `utime` and `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the share root, `/`-separated.
    pub path: String,
    /// Update-time in Unix milliseconds; orders versions of a path across peers.
    pub utime: i64,
    pub deleted: bool,
    pub size: Option<u64>,
    /// Modification time in Unix milliseconds.
    pub mtime: Option<i64>,
    /// Permission bits.
    pub mode: Option<u32>,
    /// BLAKE3 digest of the content.
    pub hash: Option<[u8; 32]>,
    /// Identity of the file, stable across content changes.
    pub id: String,
    /// Per-file content key.
    pub key: Option<[u8; 32]>,
}

impl FileRecord {
    /// A tombstone for this record stamped with `utime`.
    pub fn tombstone(&self, utime: i64) -> FileRecord {
        FileRecord {
            path: self.path.clone(),
            utime,
            deleted: true,
            size: None,
            mtime: None,
            mode: None,
            hash: None,
            id: self.id.clone(),
            key: None,
        }
    }

    /// Whether the record carries exactly the fields its kind requires.
    pub fn is_well_formed(&self) -> bool {
        let fields = [
            self.size.is_some(),
            self.mtime.is_some(),
            self.mode.is_some(),
            self.hash.is_some(),
            self.key.is_some(),
        ];
        if self.deleted {
            fields.iter().all(|present| !present)
        } else {
            fields.iter().all(|present| *present)
        }
    }

    pub fn hash_hex(&self) -> String {
        self.hash.map(hex::encode).unwrap_or_else(|| "-".to_string())
    }
}

/// A peer's view of a shared folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub peer_id: String,
    pub version: u64,
    pub files: Vec<FileRecord>,
}

/// Whether `remote` should be fetched given the local record for the same path.
pub fn needs_fetch(local: Option<&FileRecord>, remote: &FileRecord) -> bool {
    if remote.deleted {
        return false;
    }
    match local {
        None => true,
        Some(local) => local.utime <= remote.utime && local.hash != remote.hash,
    }
}

/// Whether a remote tombstone should delete the local file.
pub fn needs_deletion(local: Option<&FileRecord>, remote: &FileRecord) -> bool {
    remote.deleted && matches!(local, Some(local) if !local.deleted && local.utime < remote.utime)
}

/// Outcome of comparing a remote manifest against local records.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reconciliation {
    pub fetch: BTreeSet<String>,
    pub delete: Vec<FileRecord>,
}

/// Compare `remote` with local state, looked up through `local`.
pub fn reconcile<F>(remote: &Manifest, mut local: F) -> Reconciliation
where
    F: FnMut(&str) -> Option<FileRecord>,
{
    let mut result = Reconciliation::default();
    for record in &remote.files {
        let mine = local(&record.path);
        if needs_fetch(mine.as_ref(), record) {
            result.fetch.insert(record.path.clone());
        } else if needs_deletion(mine.as_ref(), record) {
            result.delete.push(record.clone());
        }
    }
    result
}
