//! # Shares
//!
//! A share is a folder synchronized with peers that hold its secret. Sessions reach a
//! share only through the [`Share`] trait and find it with a [`ShareResolver`], so the
//! protocol code never touches the filesystem directly.
//!
//! [`FolderShare`] is the on-disk implementation. Its records and version live in two
//! [`PersistentLog`]s under `<root>/.slyshare/`; incoming whole files are staged there
//! and renamed into place on commit.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncSeekExt;
use tracing::{debug, info, warn};

use crate::config::ShareConfig;
use crate::crypto::{content_hash, derive_share_key, generate_tls_identity, ShareKey, TlsIdentity};
use crate::manifest::{FileRecord, Manifest};
use crate::protocol::AccessLevel;
use crate::store::{PersistentLog, VacuumPolicy};

/// Directory inside a share root holding logs and staged downloads.
pub const METADATA_DIR: &str = ".slyshare";

const VERSION_KEY: &str = "version";

/// An open file to serve, with its size at open time.
pub struct FileReader {
    pub file: tokio::fs::File,
    pub size: u64,
}

/// What a session needs from a shared folder.
#[async_trait]
pub trait Share: Send + Sync {
    fn id(&self) -> &str;

    /// Peer id of this node as announced for the share.
    fn peer_id(&self) -> &str;

    /// Manifest version; increases on every local change.
    fn version(&self) -> u64;

    /// Level of the secret this node holds.
    fn held_access(&self) -> AccessLevel;

    /// Access granted to `peer_id`, never above [`Share::held_access`].
    fn access_level(&self, peer_id: &str) -> AccessLevel;

    /// Key for `level`, if this node can derive it.
    fn key(&self, level: AccessLevel) -> Option<ShareKey>;

    fn tls_identity(&self) -> &TlsIdentity;

    fn records(&self) -> Vec<FileRecord>;

    fn by_path(&self, path: &str) -> Option<FileRecord>;

    fn manifest(&self) -> Manifest {
        Manifest {
            peer_id: self.peer_id().to_string(),
            version: self.version(),
            files: self.records(),
        }
    }

    async fn read_file(&self, path: &str) -> Result<FileReader>;

    /// Writer into the existing file at `path`, positioned at `offset`.
    async fn write_file(&self, path: &str, offset: u64) -> Result<tokio::fs::File>;

    /// Writer for a whole incoming file. Nothing at `path` changes until the
    /// content is committed with [`Share::commit_record`].
    async fn stage_file(&self, path: &str) -> Result<tokio::fs::File>;

    /// Drop staged content for `path` after a failed transfer.
    async fn discard_staged(&self, path: &str) -> Result<()>;

    /// Adopt a remote record whose content was just written.
    async fn commit_record(&self, record: FileRecord) -> Result<()>;

    /// Apply a newer remote tombstone.
    async fn apply_deletion(&self, record: FileRecord) -> Result<()>;
}

/// Finds the share an initiator asks for.
pub trait ShareResolver: Send + Sync {
    fn lookup(&self, share_id: &str) -> Option<Arc<dyn Share>>;
}

/// The local node as seen by its peers.
pub trait LocalIdentity: Send + Sync {
    fn display_name(&self) -> String;

    /// Current time in Unix milliseconds.
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A [`LocalIdentity`] using the system clock.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub name: String,
}

impl LocalIdentity for LocalNode {
    fn display_name(&self) -> String {
        self.name.clone()
    }
}

/// Result of [`FolderShare::scan`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ScanSummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.modified == 0 && self.deleted == 0
    }
}

/// Version and records of a share as last persisted, read without taking the share
/// over. Safe to use while a daemon has the share open.
#[derive(Debug, Clone)]
pub struct ShareSnapshot {
    pub version: u64,
    pub records: Vec<FileRecord>,
}

impl ShareSnapshot {
    /// `None` when no node has opened the share at `root` yet.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let metadata = root.join(METADATA_DIR);
        let files_path = metadata.join("files.log");
        if !files_path.exists() {
            return Ok(None);
        }

        let files: PersistentLog<String, FileRecord> = PersistentLog::open_read_only(&files_path)?;
        let meta_path = metadata.join("meta.log");
        let version = if meta_path.exists() {
            let meta: PersistentLog<String, u64> = PersistentLog::open_read_only(&meta_path)?;
            meta.get(VERSION_KEY).copied().unwrap_or(0)
        } else {
            0
        };

        let mut records: Vec<FileRecord> = files.values().cloned().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Some(Self { version, records }))
    }
}

struct ShareState {
    files: PersistentLog<String, FileRecord>,
    meta: PersistentLog<String, u64>,
}

impl ShareState {
    fn version(&self) -> u64 {
        self.meta.get(VERSION_KEY).copied().unwrap_or(0)
    }

    fn bump_version(&mut self) -> Result<u64> {
        let version = self.version() + 1;
        self.meta.put(VERSION_KEY.to_string(), version)?;
        Ok(version)
    }
}

/// A share backed by a local directory.
pub struct FolderShare {
    id: String,
    name: String,
    root: PathBuf,
    peer_id: String,
    secret: [u8; 32],
    held: AccessLevel,
    default_peer_access: AccessLevel,
    peer_access: HashMap<String, AccessLevel>,
    tls: TlsIdentity,
    state: Mutex<ShareState>,
    /// Held by scans, commits and deletions for their whole duration.
    writes: tokio::sync::Mutex<()>,
}

impl FolderShare {
    pub fn open(config: &ShareConfig, peer_id: &str, policy: VacuumPolicy) -> Result<Self> {
        let root = config.path.clone();
        std::fs::create_dir_all(root.join(METADATA_DIR).join("incoming"))
            .with_context(|| format!("Failed to prepare share folder {}", root.display()))?;

        let files = PersistentLog::open_with(root.join(METADATA_DIR).join("files.log"), policy)?;
        let meta = PersistentLog::open_with(root.join(METADATA_DIR).join("meta.log"), policy)?;

        let tls = generate_tls_identity(&config.id)?;
        debug!("Opened share {} at {} ({} records)", config.id, root.display(), files.len());

        Ok(Self {
            id: config.id.clone(),
            name: config.display_name(),
            root,
            peer_id: peer_id.to_string(),
            secret: config.secret_bytes()?,
            held: config.access,
            default_peer_access: config.default_peer_access,
            peer_access: config.peer_access.clone(),
            tls,
            state: Mutex::new(ShareState { files, meta }),
            writes: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute location of a share-relative path. Rejects anything that could
    /// escape the root or reach the metadata directory, including paths running
    /// through a symlink.
    async fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let mut components = relative.components().peekable();
        if components.peek().is_none() {
            bail!("Empty path");
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("Path {} is not a plain relative path", path),
            }
        }
        if relative.starts_with(METADATA_DIR) {
            bail!("Path {} is reserved", path);
        }

        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component);
            match tokio::fs::symlink_metadata(&current).await {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    bail!("Path {} runs through a symlink", path)
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.root.join(relative))
    }

    fn incoming_path(&self, path: &str) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join("incoming")
            .join(blake3::hash(path.as_bytes()).to_hex().as_str())
    }

    /// Walk the folder and bring the records up to date: new and changed files get a
    /// fresh update-time, files that disappeared get a tombstone.
    pub async fn scan(&self) -> Result<ScanSummary> {
        let _writes = self.writes.lock().await;
        let mut found = Vec::new();
        self.walk(&mut found).await?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut summary = ScanSummary::default();
        let mut updates = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (relative, full, size, mtime, mode) in found {
            seen.insert(relative.clone());
            let existing = self.by_path(&relative);

            if let Some(record) = &existing {
                if !record.deleted && record.size == Some(size) && record.mtime == Some(mtime) {
                    continue;
                }
            }

            let content = match tokio::fs::read(&full).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed to read {}: {}", full.display(), e);
                    continue;
                }
            };
            let hash = content_hash(&content);

            let record = match existing {
                Some(record) if !record.deleted && record.hash == Some(hash) => {
                    // Touched but unchanged: refresh metadata, keep the update-time.
                    FileRecord {
                        size: Some(size),
                        mtime: Some(mtime),
                        mode: Some(mode),
                        ..record
                    }
                }
                existing => {
                    if existing.as_ref().map_or(true, |r| r.deleted) {
                        summary.added += 1;
                    } else {
                        summary.modified += 1;
                    }
                    FileRecord {
                        path: relative.clone(),
                        utime: now,
                        deleted: false,
                        size: Some(size),
                        mtime: Some(mtime),
                        mode: Some(mode),
                        hash: Some(hash),
                        id: existing
                            .map(|r| r.id)
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        key: Some(random_key()),
                    }
                }
            };
            updates.push(record);
        }

        for record in self.records() {
            if !record.deleted && !seen.contains(&record.path) {
                summary.deleted += 1;
                updates.push(record.tombstone(now));
            }
        }

        if !updates.is_empty() {
            let mut state = self.state.lock();
            for record in updates {
                state.files.put(record.path.clone(), record)?;
            }
            if !summary.is_empty() {
                let version = state.bump_version()?;
                info!(
                    "Share {} scanned: {} added, {} modified, {} deleted (version {})",
                    self.id, summary.added, summary.modified, summary.deleted, version
                );
            }
        }

        Ok(summary)
    }

    async fn walk(&self, found: &mut Vec<(String, PathBuf, u64, i64, u32)>) -> Result<()> {
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if dir != self.root => {
                    warn!("Failed to scan directory {}: {}", dir.display(), e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if dir == self.root && entry.file_name() == METADATA_DIR {
                        continue;
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    let metadata = entry.metadata().await?;
                    let relative = match path.strip_prefix(&self.root) {
                        Ok(relative) => relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/"),
                        Err(_) => continue,
                    };
                    found.push((
                        relative,
                        path.clone(),
                        metadata.len(),
                        modified_ms(&metadata),
                        file_mode(&metadata),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Apply a tombstone; the caller holds `writes`.
    async fn delete_locked(&self, record: FileRecord) -> Result<()> {
        let full = self.resolve(&record.path).await?;
        match self.by_path(&record.path) {
            Some(local) if !local.deleted && local.utime < record.utime => {}
            _ => {
                debug!("Ignoring stale deletion of {}", record.path);
                return Ok(());
            }
        }

        match tokio::fs::remove_file(&full).await {
            Ok(()) => info!("Deleted {} from share {}", record.path, self.id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let tombstone = FileRecord {
            deleted: true,
            size: None,
            mtime: None,
            mode: None,
            hash: None,
            key: None,
            ..record
        };
        let mut state = self.state.lock();
        state.files.put(tombstone.path.clone(), tombstone)?;
        state.bump_version()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.files.close()?;
        state.meta.close()?;
        Ok(())
    }
}

#[async_trait]
impl Share for FolderShare {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn version(&self) -> u64 {
        self.state.lock().version()
    }

    fn held_access(&self) -> AccessLevel {
        self.held
    }

    fn access_level(&self, peer_id: &str) -> AccessLevel {
        let configured = self
            .peer_access
            .get(peer_id)
            .copied()
            .unwrap_or(self.default_peer_access);
        configured.min(self.held)
    }

    fn key(&self, level: AccessLevel) -> Option<ShareKey> {
        derive_share_key(&self.secret, self.held, level)
    }

    fn tls_identity(&self) -> &TlsIdentity {
        &self.tls
    }

    fn records(&self) -> Vec<FileRecord> {
        let state = self.state.lock();
        let mut records: Vec<FileRecord> = state.files.values().cloned().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    fn by_path(&self, path: &str) -> Option<FileRecord> {
        self.state.lock().files.get(path).cloned()
    }

    async fn read_file(&self, path: &str) -> Result<FileReader> {
        let full = self.resolve(path).await?;
        let file = tokio::fs::File::open(&full)
            .await
            .with_context(|| format!("Failed to open {}", full.display()))?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", path);
        }
        Ok(FileReader {
            file,
            size: metadata.len(),
        })
    }

    async fn write_file(&self, path: &str, offset: u64) -> Result<tokio::fs::File> {
        let full = self.resolve(path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .with_context(|| format!("Cannot write range into {}", full.display()))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    async fn stage_file(&self, path: &str) -> Result<tokio::fs::File> {
        self.resolve(path).await?;
        Ok(tokio::fs::File::create(self.incoming_path(path)).await?)
    }

    async fn discard_staged(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.incoming_path(path)).await {
            Ok(()) => {
                debug!("Discarded staged content of {}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_record(&self, record: FileRecord) -> Result<()> {
        let _writes = self.writes.lock().await;
        if record.deleted {
            return self.delete_locked(record).await;
        }
        if !record.is_well_formed() {
            return Err(anyhow!("Refusing malformed record for {}", record.path));
        }

        let full = self.resolve(&record.path).await?;
        let staged = self.incoming_path(&record.path);
        if tokio::fs::try_exists(&staged).await? {
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&staged, &full).await?;
        }

        #[cfg(unix)]
        if let Some(mode) = record.mode {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(mode & 0o7777);
            if let Err(e) = tokio::fs::set_permissions(&full, permissions).await {
                warn!("Failed to set mode on {}: {}", full.display(), e);
            }
        }

        // Local mtime after the rename, so the next scan does not rehash the file.
        let mtime = tokio::fs::metadata(&full).await.map(|m| modified_ms(&m)).ok();
        let local = FileRecord {
            mtime: mtime.or(record.mtime),
            ..record
        };

        let mut state = self.state.lock();
        state.files.put(local.path.clone(), local)?;
        state.bump_version()?;
        Ok(())
    }

    async fn apply_deletion(&self, record: FileRecord) -> Result<()> {
        let _writes = self.writes.lock().await;
        self.delete_locked(record).await
    }
}

/// All shares this node serves, keyed by share id.
#[derive(Default)]
pub struct ShareRegistry {
    shares: RwLock<HashMap<String, Arc<FolderShare>>>,
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, share: Arc<FolderShare>) {
        self.shares.write().insert(share.id().to_string(), share);
    }

    pub fn get(&self, share_id: &str) -> Option<Arc<FolderShare>> {
        self.shares.read().get(share_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<FolderShare>> {
        self.shares.read().values().cloned().collect()
    }
}

impl ShareResolver for ShareRegistry {
    fn lookup(&self, share_id: &str) -> Option<Arc<dyn Share>> {
        self.get(share_id).map(|share| share as Arc<dyn Share>)
    }
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn modified_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_share_secret;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn open_share(dir: &Path, access: AccessLevel) -> FolderShare {
        let config = ShareConfig::new("share-1", dir.to_path_buf(), generate_share_secret(), access);
        FolderShare::open(&config, "local-peer", VacuumPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_scan_tracks_added_modified_deleted() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir_all(temp_dir.path().join("sub")).unwrap();
        std::fs::write(temp_dir.path().join("sub/b.txt"), b"beta").unwrap();

        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);
        let summary = share.scan().await.unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(share.version(), 1);

        let a = share.by_path("a.txt").unwrap();
        assert!(a.is_well_formed());
        assert_eq!(a.hash, Some(*blake3::hash(b"alpha").as_bytes()));
        assert!(share.by_path("sub/b.txt").is_some());
        assert!(share.records().iter().all(|r| !r.path.starts_with(METADATA_DIR)));

        // Nothing changed: no version bump.
        assert!(share.scan().await.unwrap().is_empty());
        assert_eq!(share.version(), 1);

        std::fs::write(temp_dir.path().join("a.txt"), b"alpha, longer").unwrap();
        std::fs::remove_file(temp_dir.path().join("sub/b.txt")).unwrap();
        let summary = share.scan().await.unwrap();
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(share.version(), 2);

        let modified = share.by_path("a.txt").unwrap();
        assert_eq!(modified.id, a.id);
        assert!(modified.utime >= a.utime);
        assert!(share.by_path("sub/b.txt").unwrap().deleted);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"alpha").unwrap();

        let config = ShareConfig::new(
            "share-1",
            temp_dir.path().to_path_buf(),
            generate_share_secret(),
            AccessLevel::ReadWrite,
        );
        {
            let share = FolderShare::open(&config, "me", VacuumPolicy::default()).unwrap();
            share.scan().await.unwrap();
            share.close().unwrap();
        }

        let share = FolderShare::open(&config, "me", VacuumPolicy::default()).unwrap();
        assert_eq!(share.version(), 1);
        assert!(share.by_path("a.txt").is_some());
    }

    #[tokio::test]
    async fn test_staged_write_is_committed_into_place() {
        let temp_dir = TempDir::new().unwrap();
        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);

        let content = b"remote content";
        let mut file = share.stage_file("dir/new.txt").await.unwrap();
        file.write_all(content).await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        assert!(!temp_dir.path().join("dir/new.txt").exists());

        let record = FileRecord {
            path: "dir/new.txt".to_string(),
            utime: 42,
            deleted: false,
            size: Some(content.len() as u64),
            mtime: Some(40),
            mode: Some(0o600),
            hash: Some(*blake3::hash(content).as_bytes()),
            id: "remote-id".to_string(),
            key: Some([1; 32]),
        };
        share.commit_record(record).await.unwrap();

        assert_eq!(std::fs::read(temp_dir.path().join("dir/new.txt")).unwrap(), content);
        let stored = share.by_path("dir/new.txt").unwrap();
        assert_eq!(stored.utime, 42);
        assert_eq!(stored.id, "remote-id");
        assert_eq!(share.version(), 1);

        // The committed file is not reported as a local change.
        assert!(share.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_deletion_respects_update_time() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"alpha").unwrap();
        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);
        share.scan().await.unwrap();
        let local = share.by_path("a.txt").unwrap();

        share.apply_deletion(local.tombstone(local.utime - 1)).await.unwrap();
        assert!(temp_dir.path().join("a.txt").exists());

        share.apply_deletion(local.tombstone(local.utime + 1)).await.unwrap();
        assert!(!temp_dir.path().join("a.txt").exists());
        assert!(share.by_path("a.txt").unwrap().deleted);
    }

    #[tokio::test]
    async fn test_paths_are_confined_to_root() {
        let temp_dir = TempDir::new().unwrap();
        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);

        assert!(share.read_file("../outside").await.is_err());
        assert!(share.read_file("/etc/passwd").await.is_err());
        assert!(share.write_file(".slyshare/files.log", 0).await.is_err());
        assert!(share.write_file("", 0).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_cannot_reach_outside_the_root() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"host file").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            temp_dir.path().join("direct.txt"),
        )
        .unwrap();

        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);
        share.scan().await.unwrap();
        assert!(share.records().is_empty());

        assert!(share.read_file("link/secret.txt").await.is_err());
        assert!(share.read_file("direct.txt").await.is_err());
        assert!(share.write_file("link/secret.txt", 0).await.is_err());
        assert!(share.stage_file("link/new.txt").await.is_err());

        let record = FileRecord {
            path: "link/planted.txt".to_string(),
            utime: 1,
            deleted: false,
            size: Some(0),
            mtime: Some(1),
            mode: Some(0o644),
            hash: Some(content_hash(b"")),
            id: "remote".to_string(),
            key: Some([0; 32]),
        };
        assert!(share.commit_record(record).await.is_err());
        assert!(!outside.path().join("planted.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_stage_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);

        let mut file = share.stage_file("partial.bin").await.unwrap();
        file.write_all(b"half of it").await.unwrap();
        drop(file);
        let staged = share.incoming_path("partial.bin");
        assert!(staged.exists());

        share.discard_staged("partial.bin").await.unwrap();
        assert!(!staged.exists());
        // Discarding twice is fine.
        share.discard_staged("partial.bin").await.unwrap();
        assert!(!temp_dir.path().join("partial.bin").exists());
    }

    #[tokio::test]
    async fn test_range_write_at_offset_zero_goes_in_place() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("data.bin"), b"0123456789").unwrap();
        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);

        let mut file = share.write_file("data.bin", 0).await.unwrap();
        file.write_all(b"ab").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        let mut file = share.write_file("data.bin", 8).await.unwrap();
        file.write_all(b"yz").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(std::fs::read(temp_dir.path().join("data.bin")).unwrap(), b"ab234567yz");
        assert!(!share.incoming_path("data.bin").exists());
        assert!(share.write_file("missing.bin", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_during_scan_is_not_tombstoned() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..2_000 {
            std::fs::write(temp_dir.path().join(format!("file-{}.txt", i)), i.to_string()).unwrap();
        }
        let share = Arc::new(open_share(temp_dir.path(), AccessLevel::ReadWrite));

        let content = b"arrived from a peer";
        let mut file = share.stage_file("incoming.txt").await.unwrap();
        file.write_all(content).await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        let record = FileRecord {
            path: "incoming.txt".to_string(),
            utime: 7,
            deleted: false,
            size: Some(content.len() as u64),
            mtime: Some(7),
            mode: Some(0o644),
            hash: Some(content_hash(content)),
            id: "remote".to_string(),
            key: Some([3; 32]),
        };

        let scanning = {
            let share = share.clone();
            tokio::spawn(async move { share.scan().await })
        };
        tokio::task::yield_now().await;
        share.commit_record(record).await.unwrap();
        let summary = scanning.await.unwrap().unwrap();
        assert_eq!(summary.deleted, 0);

        let stored = share.by_path("incoming.txt").unwrap();
        assert!(!stored.deleted);
        assert_eq!(stored.utime, 7);
        assert!(temp_dir.path().join("incoming.txt").exists());

        // A later scan leaves the committed file alone.
        assert_eq!(share.scan().await.unwrap().deleted, 0);
        assert!(!share.by_path("incoming.txt").unwrap().deleted);
    }

    #[tokio::test]
    async fn test_snapshot_reads_without_taking_over_the_logs() {
        let temp_dir = TempDir::new().unwrap();
        assert!(ShareSnapshot::load(temp_dir.path()).unwrap().is_none());

        std::fs::write(temp_dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(temp_dir.path().join("b.txt"), b"beta").unwrap();
        let share = open_share(temp_dir.path(), AccessLevel::ReadWrite);
        share.scan().await.unwrap();

        let snapshot = ShareSnapshot::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(snapshot.version, 1);
        let paths: Vec<_> = snapshot.records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);

        // The share keeps writing after the snapshot was taken.
        std::fs::remove_file(temp_dir.path().join("b.txt")).unwrap();
        share.scan().await.unwrap();
        let snapshot = ShareSnapshot::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(snapshot.version, 2);
        assert!(snapshot.records[1].deleted);
    }

    #[test]
    fn test_access_level_is_capped_by_held_level() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ShareConfig::new(
            "share-1",
            temp_dir.path().to_path_buf(),
            generate_share_secret(),
            AccessLevel::ReadOnly,
        );
        config.default_peer_access = AccessLevel::ReadWrite;
        config
            .peer_access
            .insert("stranger".to_string(), AccessLevel::Unknown);
        let share = FolderShare::open(&config, "me", VacuumPolicy::default()).unwrap();

        assert_eq!(share.access_level("anyone"), AccessLevel::ReadOnly);
        assert_eq!(share.access_level("stranger"), AccessLevel::Unknown);
        assert!(share.key(AccessLevel::ReadWrite).is_none());
        assert!(share.key(AccessLevel::ReadOnly).is_some());
    }

    #[test]
    fn test_registry_resolves_shares() {
        let temp_dir = TempDir::new().unwrap();
        let registry = ShareRegistry::new();
        registry.insert(Arc::new(open_share(temp_dir.path(), AccessLevel::ReadWrite)));

        assert!(registry.lookup("share-1").is_some());
        assert!(registry.lookup("missing").is_none());
    }
}
