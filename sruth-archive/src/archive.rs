use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sruth_core::{
    from_cbor, to_cbor, ArchivePath, ArchiveTime, FileId, FileInfo, Filter, PathError, Piece,
    PieceSpec, PieceSpecSet, HIDDEN_DIR, PIECE_SIZE,
};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::delay_queue::DelayedPathActionQueue;
use crate::disk_file::DiskFile;
use crate::watcher::ArchiveWatcher;
use crate::DELETION_QUEUE_FILE;

#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    /// Ceiling on simultaneously open disk files. Must be positive.
    pub active_file_cache_size: usize,
    /// Time-to-live given to newly observed files outside the admin
    /// subtree.
    pub default_ttl_seconds: i32,
    pub piece_size: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            active_file_cache_size: 512,
            default_ttl_seconds: 3600,
            piece_size: PIECE_SIZE,
        }
    }
}

/// A disk-backed archive of files broken into fixed-size pieces.
///
/// The archive exclusively owns the disk state under its root; callers are
/// loaned per-file handles guarded by per-file locks. Cheaply cloneable.
#[derive(Clone)]
pub struct Archive {
    inner: Arc<ArchiveInner>,
}

pub(crate) struct ArchiveInner {
    root: PathBuf,
    config: ArchiveConfig,
    disk_files: Mutex<DiskFileMap>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<FileInfo>>>,
    delay_queue: DelayedPathActionQueue,
}

/// Access-stamped map of the open disk files; the smallest stamp is the
/// least recently used entry.
#[derive(Default)]
struct DiskFileMap {
    entries: HashMap<ArchivePath, (u64, Arc<DiskFile>)>,
    tick: u64,
}

impl DiskFileMap {
    fn touch(&mut self, path: &ArchivePath) {
        self.tick += 1;
        if let Some((stamp, _)) = self.entries.get_mut(path) {
            *stamp = self.tick;
        }
    }

    fn insert(&mut self, path: ArchivePath, file: Arc<DiskFile>) {
        self.tick += 1;
        self.entries.insert(path, (self.tick, file));
    }

    /// Closes and removes the least recently used entry, skipping `keep`.
    fn remove_lru(&mut self, keep: Option<&ArchivePath>) -> Option<Arc<DiskFile>> {
        let victim = self
            .entries
            .iter()
            .filter(|(path, _)| Some(*path) != keep)
            .min_by_key(|(_, (stamp, _))| *stamp)
            .map(|(path, _)| path.clone())?;
        let (_, file) = self.entries.remove(&victim)?;
        if let Err(err) = file.close() {
            error!(file = %victim, %err, "couldn't close evicted file");
        }
        Some(file)
    }
}

fn is_too_many_open_files(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

impl Archive {
    /// Opens the archive rooted at `root`: creates the hidden directory,
    /// purges stale hidden state from a previous session (keeping the
    /// deletion journal), and starts the delayed-deletion task.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(root: impl Into<PathBuf>, config: ArchiveConfig) -> Result<Self> {
        if config.active_file_cache_size == 0 {
            bail!("active file cache size must be positive");
        }
        if config.piece_size == 0 {
            bail!("piece size must be positive");
        }
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("couldn't create archive root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("couldn't resolve archive root {}", root.display()))?;
        let hidden_dir = root.join(HIDDEN_DIR);
        std::fs::create_dir_all(&hidden_dir)?;
        let journal_path = hidden_dir.join(DELETION_QUEUE_FILE);
        purge_hidden_dir(&hidden_dir, &journal_path)?;
        let delay_queue = DelayedPathActionQueue::start(root.clone(), journal_path)?;
        Ok(Self {
            inner: Arc::new(ArchiveInner {
                root,
                config,
                disk_files: Mutex::new(DiskFileMap::default()),
                listeners: Mutex::new(Vec::new()),
                delay_queue,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.inner.config
    }

    pub fn resolve(&self, path: &ArchivePath) -> PathBuf {
        path.resolve(&self.inner.root)
    }

    pub fn relativize(&self, path: &Path) -> Result<ArchivePath, PathError> {
        ArchivePath::from_absolute(path, &self.inner.root)
    }

    /// The hidden (staging) form of an archive pathname.
    pub fn hidden_resolve(&self, path: &ArchivePath) -> PathBuf {
        let mut hidden = self.inner.root.join(HIDDEN_DIR);
        for segment in path.as_str().split('/') {
            hidden.push(segment);
        }
        hidden
    }

    /// Builds the FileInfo for an existing file, normalizing its
    /// modification time to millisecond resolution so that every later
    /// observation produces the identical identity. Returns `None` for
    /// paths outside the archive or under the hidden tree.
    pub fn file_info_at(&self, path: &Path) -> Result<Option<FileInfo>> {
        let Ok(archive_path) = self.relativize(path) else {
            return Ok(None);
        };
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Ok(None);
        }
        let time = ArchiveTime::from_path(path)?;
        time.apply_to(path)?;
        let ttl = if archive_path.is_admin() {
            -1
        } else {
            self.inner.config.default_ttl_seconds
        };
        let id = FileId::new(archive_path, time);
        Ok(Some(FileInfo::new(
            id,
            metadata.len(),
            self.inner.config.piece_size,
            ttl,
        )))
    }

    /// Writes a piece of data. Returns true when the file is complete. The
    /// piece is discarded (returning false) when a newer version of the
    /// file exists.
    pub fn put_piece(&self, piece: &Piece) -> Result<bool> {
        if !piece.is_consistent() {
            bail!("inconsistent piece: {piece:?}");
        }
        let Some(file) = self.disk_file(piece.info())? else {
            trace!(file = ?piece.info(), "newer file version exists");
            return Ok(false);
        };
        loop {
            match file.put_piece(piece) {
                Ok((complete, newly)) => {
                    if newly {
                        self.on_file_complete(piece.info());
                    }
                    return Ok(complete);
                }
                Err(err) if is_too_many_open_files(&err) => {
                    self.evict_for(piece.info().path(), err)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Returns a piece of data, or `None` when the piece is unavailable
    /// (never received, deleted, or superseded by a newer version).
    pub fn get_piece(&self, spec: &PieceSpec) -> Result<Option<Piece>> {
        let Some(file) = self.disk_file(&spec.info)? else {
            return Ok(None);
        };
        if !file.has_piece(spec.index) {
            return Ok(None);
        }
        loop {
            match file.get_piece(spec) {
                Ok(piece) => return Ok(Some(piece)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %spec.info.id(), "file vanished under read");
                    return Ok(None);
                }
                Err(err) if is_too_many_open_files(&err) => {
                    self.evict_for(spec.info.path(), err)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// True when the piece exists locally, or when a strictly newer version
    /// of the file supersedes it.
    pub fn exists(&self, spec: &PieceSpec) -> Result<bool> {
        let Some(file) = self.disk_file(&spec.info)? else {
            return Ok(true);
        };
        Ok(file.has_piece(spec.index))
    }

    fn on_file_complete(&self, info: &FileInfo) {
        if !info.never_expires() {
            let due = ArchiveTime::from_millis(
                ArchiveTime::now().millis() + i64::from(info.ttl_seconds()) * 1000,
            );
            let path = self.resolve(info.path());
            if let Err(err) = self.inner.delay_queue.schedule(path, due) {
                error!(file = %info.id(), %err, "couldn't schedule expiry");
            }
        }
        let mut listeners = self.inner.listeners.lock().expect("listener lock");
        listeners.retain(|listener| listener.send(info.clone()).is_ok());
    }

    /// Evicts the least recently used open file after an open failure;
    /// propagates the error when nothing is left to evict.
    fn evict_for(&self, keep: &ArchivePath, err: io::Error) -> Result<()> {
        let mut map = self.inner.disk_files.lock().expect("disk file map lock");
        if map.remove_lru(Some(keep)).is_none() {
            return Err(err).context("too many open files and nothing to evict");
        }
        Ok(())
    }

    /// Returns the open disk file for `info`, creating it if necessary.
    /// `None` means a strictly newer version of the file exists and the
    /// caller's data is obsolete.
    fn disk_file(&self, info: &FileInfo) -> Result<Option<Arc<DiskFile>>> {
        let mut map = self.inner.disk_files.lock().expect("disk file map lock");
        let path = info.path().clone();

        if let Some((_, resident)) = map.entries.get(&path) {
            let resident = resident.clone();
            if resident.time().newer_than(&info.time()) {
                return Ok(None);
            }
            if info.time().newer_than(&resident.time()) {
                if let Err(err) = resident.delete() {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!(file = %path, %err, "couldn't delete older version");
                    } else {
                        debug!(file = %path, "older file was deleted by another task");
                    }
                }
                map.entries.remove(&path);
            } else {
                map.touch(&path);
                return Ok(Some(resident));
            }
        } else if self.reconcile_on_disk(info)? {
            return Ok(None);
        }

        loop {
            match DiskFile::open(
                info.clone(),
                self.hidden_resolve(&path),
                self.resolve(&path),
            ) {
                Ok(file) => {
                    let file = Arc::new(file);
                    map.insert(path.clone(), file.clone());
                    while map.entries.len() > self.inner.config.active_file_cache_size {
                        if map.remove_lru(Some(&path)).is_none() {
                            break;
                        }
                    }
                    return Ok(Some(file));
                }
                Err(err) if is_too_many_open_files(&err) => {
                    if map.remove_lru(Some(&path)).is_none() {
                        return Err(err).context("too many open files and nothing to evict");
                    }
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("couldn't open archive file {path}"));
                }
            }
        }
    }

    /// Compares `info` against unloaded on-disk state for the same
    /// pathname, deleting older versions. Returns true when a newer version
    /// is already on disk and the caller's data is obsolete.
    fn reconcile_on_disk(&self, info: &FileInfo) -> Result<bool> {
        for path in [self.resolve(info.path()), self.hidden_resolve(info.path())] {
            if !path.is_file() {
                continue;
            }
            let disk_time = ArchiveTime::from_path(&path)?;
            if disk_time.newer_than(&info.time()) {
                return Ok(true);
            }
            if info.time().newer_than(&disk_time) {
                debug!(file = %info.path(), "replacing older on-disk version");
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(false)
    }

    /// Saves raw bytes in the archive: written into the hidden tree, then
    /// atomically renamed into view.
    pub fn save_bytes(&self, path: &ArchivePath, bytes: &[u8]) -> Result<()> {
        let hidden = self.hidden_resolve(path);
        if let Some(parent) = hidden.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&hidden, bytes)?;
        ArchiveTime::now().apply_to(&hidden)?;
        let visible = self.resolve(path);
        if let Some(parent) = visible.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(err) = std::fs::rename(&hidden, &visible) {
            let _ = std::fs::remove_file(&hidden);
            return Err(err.into());
        }
        Ok(())
    }

    /// Saves a serializable object in the archive (CBOR-encoded).
    pub fn save_object<T: Serialize>(&self, path: &ArchivePath, value: &T) -> Result<()> {
        self.save_bytes(path, &to_cbor(value)?)
    }

    /// Saves an object in the hidden tree only; it will not be distributed.
    pub fn hide_object<T: Serialize>(&self, path: &ArchivePath, value: &T) -> Result<()> {
        let hidden = self.hidden_resolve(path);
        if let Some(parent) = hidden.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&hidden, to_cbor(value)?)?;
        ArchiveTime::now().apply_to(&hidden)?;
        Ok(())
    }

    /// Moves a previously hidden file into view.
    pub fn reveal(&self, path: &ArchivePath) -> Result<()> {
        let hidden = self.hidden_resolve(path);
        let visible = self.resolve(path);
        if let Some(parent) = visible.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&hidden, &visible)?;
        Ok(())
    }

    /// Restores an object previously saved at a visible archive pathname.
    pub fn restore<T: DeserializeOwned>(&self, path: &ArchivePath) -> Result<T> {
        let bytes = std::fs::read(self.resolve(path))
            .with_context(|| format!("couldn't read archive file {path}"))?;
        Ok(from_cbor(&bytes).with_context(|| format!("corrupted archive file {path}"))?)
    }

    pub fn remove_hidden(&self, path: &ArchivePath) -> Result<()> {
        match std::fs::remove_file(self.hidden_resolve(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Modification time of a visible archive file.
    pub fn time_of(&self, path: &ArchivePath) -> Result<ArchiveTime> {
        Ok(ArchiveTime::from_path(&self.resolve(path))?)
    }

    /// Modification time of a hidden archive file.
    pub fn hidden_time(&self, path: &ArchivePath) -> Result<ArchiveTime> {
        Ok(ArchiveTime::from_path(&self.hidden_resolve(path))?)
    }

    /// Removes the file from both the visible and hidden trees. Returns
    /// true when something was actually removed.
    pub fn remove(&self, id: &FileId) -> Result<bool> {
        let mut map = self.inner.disk_files.lock().expect("disk file map lock");
        if let Some((_, file)) = map.entries.remove(id.path()) {
            match file.delete() {
                Ok(()) => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
                Err(err) => return Err(err.into()),
            }
        }
        drop(map);
        // Renaming is atomic, so the file is at one of its two homes; a
        // miss on both means it raced with a reveal.
        let visible = self.resolve(id.path());
        if remove_path(&visible)? {
            return Ok(true);
        }
        let hidden = self.hidden_resolve(id.path());
        if remove_path(&hidden)? {
            return Ok(true);
        }
        remove_path(&visible)
    }

    /// Recursively visits every visible regular file matching `filter`,
    /// producing a whole-file piece specification for each. Hidden state is
    /// skipped.
    pub fn walk(&self, filter: &Filter, consumer: &mut dyn FnMut(PieceSpecSet)) -> Result<()> {
        self.walk_dir(&self.inner.root.clone(), filter, consumer)
    }

    pub(crate) fn walk_dir(
        &self,
        dir: &Path,
        filter: &Filter,
        consumer: &mut dyn FnMut(PieceSpecSet),
    ) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if path == self.inner.root.join(HIDDEN_DIR) {
                    continue;
                }
                self.walk_dir(&path, filter, consumer)?;
            } else if file_type.is_file() {
                match self.file_info_at(&path) {
                    Ok(Some(info)) => {
                        if filter.matches(info.path()) {
                            trace!(path = %info.path(), "walk");
                            consumer(PieceSpecSet::whole_file(info));
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(path = %path.display(), %err, "couldn't stat file during walk");
                    }
                }
            }
        }
        Ok(())
    }

    /// Starts watching the file-tree for externally created and removed
    /// files.
    pub fn watch(&self) -> Result<ArchiveWatcher> {
        ArchiveWatcher::spawn(self.clone())
    }

    /// Registers a listener notified with the FileInfo of every file that
    /// completes. Listeners whose receiving half is dropped are pruned on
    /// the next notification.
    pub fn add_data_product_listener(&self, listener: mpsc::UnboundedSender<FileInfo>) {
        self.inner
            .listeners
            .lock()
            .expect("listener lock")
            .push(listener);
    }

    /// Number of currently open disk files.
    pub fn active_file_count(&self) -> usize {
        self.inner
            .disk_files
            .lock()
            .expect("disk file map lock")
            .entries
            .len()
    }

    /// Closes the archive: stops the deletion task and closes every open
    /// file, persisting partial-file bitmaps.
    pub fn close(&self) {
        self.inner.delay_queue.stop();
        let mut map = self.inner.disk_files.lock().expect("disk file map lock");
        for (path, (_, file)) in map.entries.drain() {
            if let Err(err) = file.close() {
                error!(file = %path, %err, "couldn't close archive file");
            }
        }
    }
}

/// Removes a file, or a directory tree, if it exists.
fn remove_path(path: &Path) -> Result<bool> {
    match std::fs::metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
        Ok(metadata) => {
            trace!(path = %path.display(), "removing file");
            if metadata.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
            Ok(true)
        }
    }
}

/// Deletes everything under the hidden directory except the deletion
/// journal: cleans up partial state left by a previous session.
fn purge_hidden_dir(hidden_dir: &Path, keep: &Path) -> Result<()> {
    for entry in std::fs::read_dir(hidden_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path == keep {
            continue;
        }
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("couldn't purge {}", path.display()))?;
        } else {
            std::fs::remove_file(&path)
                .with_context(|| format!("couldn't purge {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sruth_core::{
        ArchivePath, ArchiveTime, FileId, FileInfo, Filter, Piece, PieceSpec,
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::{Archive, ArchiveConfig};

    const PIECE: u32 = 8;

    fn config() -> ArchiveConfig {
        ArchiveConfig {
            active_file_cache_size: 4,
            default_ttl_seconds: 3600,
            piece_size: PIECE,
        }
    }

    fn info(name: &str, size: u64, millis: i64) -> FileInfo {
        let id = FileId::new(ArchivePath::new(name).unwrap(), ArchiveTime::from_millis(millis));
        FileInfo::new(id, size, PIECE, 3600)
    }

    fn piece(info: &FileInfo, index: u32, fill: u8) -> Piece {
        let data = vec![fill; info.piece_len(index) as usize];
        Piece::new(info.clone(), index, Bytes::from(data))
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), config()).unwrap();
        let info = info("a/b.bin", 12, 1_000);

        assert!(!archive.put_piece(&piece(&info, 0, 1)).unwrap());
        assert!(!archive.exists(&PieceSpec::new(info.clone(), 1)).unwrap());
        assert!(archive.exists(&PieceSpec::new(info.clone(), 0)).unwrap());
        assert!(archive.put_piece(&piece(&info, 1, 2)).unwrap());

        let got = archive
            .get_piece(&PieceSpec::new(info.clone(), 1))
            .unwrap()
            .unwrap();
        assert_eq!(got.data().as_ref(), &[2, 2, 2, 2]);
        assert!(root.path().join("a/b.bin").exists());
    }

    #[tokio::test]
    async fn older_piece_is_discarded_and_newer_replaces() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), config()).unwrap();
        let old = info("a/b.bin", 4, 1_000);
        let new = info("a/b.bin", 4, 2_000);

        assert!(archive.put_piece(&piece(&old, 0, 1)).unwrap());
        assert!(archive.get_piece(&PieceSpec::new(old.clone(), 0)).unwrap().is_some());

        // A newer version deletes the resident file.
        assert!(archive.put_piece(&piece(&new, 0, 9)).unwrap());

        // An older version arriving afterwards is dropped.
        assert!(!archive.put_piece(&piece(&old, 0, 1)).unwrap());
        let got = archive
            .get_piece(&PieceSpec::new(new.clone(), 0))
            .unwrap()
            .unwrap();
        assert_eq!(got.data().as_ref(), &[9, 9, 9, 9]);

        // The superseded version is gone.
        assert!(archive.get_piece(&PieceSpec::new(old, 0)).unwrap().is_none());
    }

    #[tokio::test]
    async fn newer_on_disk_version_discards_stale_piece() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), config()).unwrap();
        let new = info("a/b.bin", 4, 2_000);
        assert!(archive.put_piece(&piece(&new, 0, 9)).unwrap());
        // Drop residency so only the on-disk state remains.
        archive.close();

        let archive = Archive::open(root.path(), config()).unwrap();
        let old = info("a/b.bin", 4, 1_000);
        assert!(!archive.put_piece(&piece(&old, 0, 1)).unwrap());
        let got = archive
            .get_piece(&PieceSpec::new(new, 0))
            .unwrap()
            .unwrap();
        assert_eq!(got.data().as_ref(), &[9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn open_file_count_stays_bounded() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), config()).unwrap();
        for i in 0..16 {
            let info = info(&format!("f{i}.bin"), 4, 1_000);
            archive.put_piece(&piece(&info, 0, i as u8)).unwrap();
        }
        assert!(archive.active_file_count() <= config().active_file_cache_size);
    }

    #[tokio::test]
    async fn completion_notifies_listeners() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), config()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        archive.add_data_product_listener(tx);

        let info = info("x.bin", 4, 1_000);
        archive.put_piece(&piece(&info, 0, 5)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), info);
    }

    #[tokio::test]
    async fn walk_visits_matching_visible_files_only() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), config()).unwrap();
        std::fs::create_dir_all(root.path().join("a")).unwrap();
        std::fs::write(root.path().join("a/keep.txt"), b"data").unwrap();
        std::fs::write(root.path().join("drop.txt"), b"data").unwrap();
        std::fs::create_dir_all(root.path().join(".sruth/a")).unwrap();
        std::fs::write(root.path().join(".sruth/a/ignored"), b"x").unwrap();

        let mut seen = Vec::new();
        archive
            .walk(
                &Filter::Prefix(ArchivePath::new("a").unwrap()),
                &mut |specs| {
                    seen.extend(
                        specs
                            .files()
                            .iter()
                            .map(|file| file.info.path().to_string()),
                    );
                },
            )
            .unwrap();
        assert_eq!(seen, vec!["a/keep.txt".to_string()]);
    }

    #[tokio::test]
    async fn save_restore_and_hide() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), config()).unwrap();
        let path = ArchivePath::new("SRUTH/tracker/topology").unwrap();

        archive.save_object(&path, &vec![1u32, 2, 3]).unwrap();
        let restored: Vec<u32> = archive.restore(&path).unwrap();
        assert_eq!(restored, vec![1, 2, 3]);

        let hidden = ArchivePath::new("notes/secret").unwrap();
        archive.hide_object(&hidden, &"quiet".to_string()).unwrap();
        assert!(!root.path().join("notes/secret").exists());
        archive.reveal(&hidden).unwrap();
        assert!(root.path().join("notes/secret").exists());
    }

    #[tokio::test]
    async fn hidden_dir_is_purged_on_open_except_journal() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join(".sruth/stale")).unwrap();
        std::fs::write(root.path().join(".sruth/stale/partial"), b"x").unwrap();
        std::fs::write(root.path().join(".sruth/fileDeletionQueue"), b"").unwrap();

        let _archive = Archive::open(root.path(), config()).unwrap();
        assert!(!root.path().join(".sruth/stale").exists());
        assert!(root.path().join(".sruth/fileDeletionQueue").exists());
    }
}
