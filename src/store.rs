//! # Persistent Key/Value Log
//!
//! Crash-safe storage for synchronization metadata. Every mutation is appended to a
//! log file and mirrored in an in-memory map; opening the file replays the log to
//! rebuild the map.
//!
//! ## Features
//!
//! - **Append-only writes**: `put`/`delete` cost one appended entry
//! - **Tail repair**: a torn final entry from an unclean shutdown is cut off on open
//! - **Self-compaction**: the log is rewritten with only live keys once it bloats
//! - **All-or-nothing vacuum**: a failed compaction leaves the original log in use
//!
//! ## File Format
//!
//! ```text
//! SLYSHARE-LOG 1\n
//! r:<key-len>:<value-len>\n<key bytes><value bytes>
//! d:<key-len>:0\n<key bytes>
//! ...
//! ```
//!
//! Keys and values are `bincode`-encoded.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use slyshare::store::PersistentLog;
//!
//! fn remember() -> anyhow::Result<()> {
//!     let mut log: PersistentLog<String, u64> = PersistentLog::open("state.log")?;
//!     log.put("version".to_string(), 7)?;
//!     assert_eq!(log.get("version"), Some(&7));
//!     log.close()?;
//!     Ok(())
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::LogError;

/// First line of every log file.
pub const LOG_HEADER: &[u8] = b"SLYSHARE-LOG 1\n";

const OP_REPLACE: char = 'r';
const OP_DELETE: char = 'd';

/// When to compact the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacuumPolicy {
    /// Never compact while the log holds this many entries or fewer.
    pub min_entries: u64,
    /// Compact once `entries / live keys` reaches this ratio.
    pub bloat_ratio: u64,
    /// `fsync` after every appended entry.
    pub sync_writes: bool,
}

impl Default for VacuumPolicy {
    fn default() -> Self {
        Self {
            min_entries: 4096,
            bloat_ratio: 4,
            sync_writes: true,
        }
    }
}

/// The step a vacuum was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumStep {
    CreateTemp,
    WriteEntries,
    Sync,
    Rename,
}

impl fmt::Display for VacuumStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            VacuumStep::CreateTemp => "creating the temp file",
            VacuumStep::WriteEntries => "writing live entries",
            VacuumStep::Sync => "syncing the temp file",
            VacuumStep::Rename => "renaming over the log",
        };
        f.write_str(step)
    }
}

enum Entry<K, V> {
    Replace(K, V),
    Delete(K),
}

/// Append-only log backing an in-memory `HashMap`.
///
/// The map always equals the header plus a replay of every entry in the file. A log
/// has a single writer; other processes may only inspect it with
/// [`PersistentLog::open_read_only`].
#[derive(Debug)]
pub struct PersistentLog<K, V> {
    path: PathBuf,
    map: HashMap<K, V>,
    file: Option<File>,
    /// Logical entries in the file.
    entries: u64,
    /// Byte length of the file, used to roll back a torn append.
    bytes: u64,
    policy: VacuumPolicy,
    #[cfg(test)]
    fail_at: Option<VacuumStep>,
}

impl<K, V> PersistentLog<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash,
    V: Serialize + DeserializeOwned,
{
    /// Open (or create) the log at `path` with the default vacuum policy.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        Self::open_with(path, VacuumPolicy::default())
    }

    /// Open (or create) the log at `path`.
    ///
    /// An existing file must start with [`LOG_HEADER`]. A malformed or short entry ends
    /// the replay and the file is truncated to the last complete entry.
    pub fn open_with(path: impl AsRef<Path>, policy: VacuumPolicy) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let mut map = HashMap::new();
        let mut entries = 0;

        let (file, bytes) = if path.exists() {
            let mut file = OpenOptions::new().read(true).append(true).open(&path)?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;

            if data.len() < LOG_HEADER.len() && LOG_HEADER.starts_with(&data) {
                // Crashed between creating the file and writing its header.
                warn!("Log {} has an incomplete header, rewriting it", path.display());
                file.set_len(0)?;
                file.write_all(LOG_HEADER)?;
                file.sync_all()?;
                (file, LOG_HEADER.len() as u64)
            } else if !data.starts_with(LOG_HEADER) {
                return Err(LogError::BadHeader { path });
            } else {
                let (replayed, count, pos) = replay::<K, V>(&data);
                map = replayed;
                entries = count;

                if pos < data.len() {
                    warn!(
                        "Log {} ends with a torn entry, truncating {} trailing bytes",
                        path.display(),
                        data.len() - pos
                    );
                    file.set_len(pos as u64)?;
                    file.sync_all()?;
                }
                (file, pos as u64)
            }
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let mut file = OpenOptions::new()
                .read(true)
                .append(true)
                .create_new(true)
                .open(&path)?;
            file.write_all(LOG_HEADER)?;
            file.sync_all()?;
            (file, LOG_HEADER.len() as u64)
        };

        debug!("Opened log {} ({} keys, {} entries)", path.display(), map.len(), entries);

        Ok(Self {
            path,
            map,
            file: Some(file),
            entries,
            bytes,
            policy,
            #[cfg(test)]
            fail_at: None,
        })
    }

    /// Load the log at `path` without taking it over.
    ///
    /// Meant for inspecting a log another process is writing: a torn tail is skipped
    /// rather than truncated, and the returned log is closed, so writes fail with
    /// [`LogError::Closed`].
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let mut data = fs::read(&path)?;
        if data.len() < LOG_HEADER.len() && LOG_HEADER.starts_with(&data) {
            data = LOG_HEADER.to_vec();
        } else if !data.starts_with(LOG_HEADER) {
            return Err(LogError::BadHeader { path });
        }

        let (map, entries, pos) = replay::<K, V>(&data);
        if pos < data.len() {
            debug!(
                "Log {} has {} bytes past its last complete entry",
                path.display(),
                data.len() - pos
            );
        }

        Ok(Self {
            path,
            map,
            file: None,
            entries,
            bytes: pos as u64,
            policy: VacuumPolicy::default(),
            #[cfg(test)]
            fail_at: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    /// Number of entries currently in the file, live or superseded.
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Insert or replace `key`.
    pub fn put(&mut self, key: K, value: V) -> Result<(), LogError> {
        self.ensure_open()?;
        let entry = encode_entry(OP_REPLACE, &bincode::serialize(&key)?, &bincode::serialize(&value)?);
        self.append(&entry)?;
        self.map.insert(key, value);
        self.maybe_vacuum();
        Ok(())
    }

    /// Append the current value of `key` again. Returns `false` when the key is absent.
    pub fn resave<Q>(&mut self, key: &Q) -> Result<bool, LogError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.ensure_open()?;
        let entry = match self.map.get_key_value(key) {
            Some((key, value)) => {
                encode_entry(OP_REPLACE, &bincode::serialize(key)?, &bincode::serialize(value)?)
            }
            None => return Ok(false),
        };
        self.append(&entry)?;
        self.maybe_vacuum();
        Ok(true)
    }

    /// Remove `key`, returning its previous value.
    pub fn delete<Q>(&mut self, key: &Q) -> Result<Option<V>, LogError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.ensure_open()?;
        let entry = match self.map.get_key_value(key) {
            Some((key, _)) => encode_entry(OP_DELETE, &bincode::serialize(key)?, &[]),
            None => return Ok(None),
        };
        self.append(&entry)?;
        let old = self.map.remove(key);
        self.maybe_vacuum();
        Ok(old)
    }

    /// Flush and release the append handle. Reads keep working from memory.
    pub fn close(&mut self) -> Result<(), LogError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            debug!("Closed log {}", self.path.display());
        }
        Ok(())
    }

    /// Close the log and delete its file.
    pub fn destroy(mut self) -> Result<(), LogError> {
        self.file.take();
        fs::remove_file(&self.path)?;
        info!("Destroyed log {}", self.path.display());
        Ok(())
    }

    /// Rewrite the log with one entry per live key.
    ///
    /// On failure the original file, handle, map and entry counter are untouched.
    pub fn vacuum(&mut self) -> Result<(), LogError> {
        self.ensure_open()?;
        let tmp_path = vacuum_path(&self.path);

        let result = self.write_compacted(&tmp_path).and_then(|(file, bytes)| {
            self.fault(VacuumStep::Rename)?;
            fs::rename(&tmp_path, &self.path).map_err(|source| LogError::Vacuum {
                step: VacuumStep::Rename,
                source,
            })?;
            Ok((file, bytes))
        });

        match result {
            Ok((file, bytes)) => {
                if let Err(e) = sync_parent_dir(&self.path) {
                    warn!("Could not sync directory of {}: {}", self.path.display(), e);
                }
                let before = self.entries;
                // The temp handle follows its inode across the rename.
                self.file = Some(file);
                self.bytes = bytes;
                self.entries = self.map.len() as u64;
                info!(
                    "Vacuumed log {} ({} -> {} entries)",
                    self.path.display(),
                    before,
                    self.entries
                );
                Ok(())
            }
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&tmp_path) {
                    if remove_err.kind() != ErrorKind::NotFound {
                        debug!("Could not remove {}: {}", tmp_path.display(), remove_err);
                    }
                }
                Err(e)
            }
        }
    }

    fn write_compacted(&self, tmp_path: &Path) -> Result<(File, u64), LogError> {
        let failed = |step: VacuumStep| move |source: std::io::Error| LogError::Vacuum { step, source };

        self.fault(VacuumStep::CreateTemp)?;
        match fs::remove_file(tmp_path) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(failed(VacuumStep::CreateTemp)(e)),
            _ => {}
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(tmp_path)
            .map_err(failed(VacuumStep::CreateTemp))?;

        self.fault(VacuumStep::WriteEntries)?;
        let mut bytes = LOG_HEADER.len() as u64;
        {
            let mut writer = BufWriter::new(&mut file);
            writer
                .write_all(LOG_HEADER)
                .map_err(failed(VacuumStep::WriteEntries))?;
            for (key, value) in &self.map {
                let entry = encode_entry(OP_REPLACE, &bincode::serialize(key)?, &bincode::serialize(value)?);
                writer
                    .write_all(&entry)
                    .map_err(failed(VacuumStep::WriteEntries))?;
                bytes += entry.len() as u64;
            }
            writer.flush().map_err(failed(VacuumStep::WriteEntries))?;
        }

        self.fault(VacuumStep::Sync)?;
        file.sync_all().map_err(failed(VacuumStep::Sync))?;

        Ok((file, bytes))
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.file.is_none() {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    fn append(&mut self, entry: &[u8]) -> Result<(), LogError> {
        let file = self.file.as_mut().ok_or(LogError::Closed)?;

        let written = file.write_all(entry).and_then(|_| {
            if self.policy.sync_writes {
                file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            // Cut off whatever part of the entry reached the file so later appends
            // don't land behind garbage.
            if let Err(rollback) = file.set_len(self.bytes) {
                warn!(
                    "Could not roll back torn append to {}: {}; closing log",
                    self.path.display(),
                    rollback
                );
                self.file = None;
            }
            return Err(e.into());
        }

        self.bytes += entry.len() as u64;
        self.entries += 1;
        Ok(())
    }

    fn needs_vacuum(&self) -> bool {
        let live = self.map.len().max(1) as u64;
        self.entries > self.policy.min_entries && self.entries / live >= self.policy.bloat_ratio
    }

    fn maybe_vacuum(&mut self) {
        if !self.needs_vacuum() {
            return;
        }
        if let Err(e) = self.vacuum() {
            warn!("Vacuum of {} failed, keeping the uncompacted log: {}", self.path.display(), e);
        }
    }

    #[cfg(test)]
    fn fault(&self, step: VacuumStep) -> Result<(), LogError> {
        if self.fail_at == Some(step) {
            return Err(LogError::Vacuum {
                step,
                source: std::io::Error::new(ErrorKind::Other, "injected failure"),
            });
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn fault(&self, _step: VacuumStep) -> Result<(), LogError> {
        Ok(())
    }

    #[cfg(test)]
    fn fail_vacuum_at(&mut self, step: Option<VacuumStep>) {
        self.fail_at = step;
    }
}

/// Replay entries after the header. Returns the map, the number of entries and the
/// offset just past the last complete entry.
fn replay<K, V>(data: &[u8]) -> (HashMap<K, V>, u64, usize)
where
    K: DeserializeOwned + Eq + Hash,
    V: DeserializeOwned,
{
    let mut map = HashMap::new();
    let mut entries = 0;
    let mut pos = LOG_HEADER.len();
    while pos < data.len() {
        match decode_entry::<K, V>(&data[pos..]) {
            Some((Entry::Replace(key, value), used)) => {
                map.insert(key, value);
                pos += used;
            }
            Some((Entry::Delete(key), used)) => {
                map.remove(&key);
                pos += used;
            }
            None => break,
        }
        entries += 1;
    }
    (map, entries, pos)
}

/// Make a rename in the directory of `path` durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn vacuum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".vacuum");
    PathBuf::from(name)
}

fn encode_entry(op: char, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut entry = format!("{}:{}:{}\n", op, key.len(), value.len()).into_bytes();
    entry.reserve(key.len() + value.len());
    entry.extend_from_slice(key);
    entry.extend_from_slice(value);
    entry
}

/// Decode one entry from the front of `buf`, returning it with its encoded length.
/// `None` means the entry is torn or malformed.
fn decode_entry<K, V>(buf: &[u8]) -> Option<(Entry<K, V>, usize)>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let newline = buf.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&buf[..newline]).ok()?;
    let mut fields = line.splitn(3, ':');
    let op = fields.next()?;
    let key_len: usize = fields.next()?.parse().ok()?;
    let value_len: usize = fields.next()?.parse().ok()?;

    let key_start = newline + 1;
    let value_start = key_start.checked_add(key_len)?;
    let end = value_start.checked_add(value_len)?;
    if end > buf.len() {
        return None;
    }

    let key: K = bincode::deserialize(&buf[key_start..value_start]).ok()?;
    let entry = match op {
        "r" => Entry::Replace(key, bincode::deserialize(&buf[value_start..end]).ok()?),
        "d" if value_len == 0 => Entry::Delete(key),
        _ => return None,
    };
    Some((entry, end))
}
