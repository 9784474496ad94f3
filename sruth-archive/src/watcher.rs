use std::path::Path;

use anyhow::{Context, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sruth_core::{ArchiveTime, FileId, Filter, PieceSpecSet, HIDDEN_DIR};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::archive::Archive;

/// Something the archive learned about its file-tree: data that became
/// available, or a file that went away.
#[derive(Clone, Debug)]
pub enum ArchiveEvent {
    Available(PieceSpecSet),
    Removed(FileId),
}

/// Watches the archive's file-tree for externally created and removed
/// files, reporting them as [`ArchiveEvent`]s. Hidden state is ignored.
///
/// When the OS watcher signals an overflow the whole tree is re-walked, so
/// bursts cannot silently lose files.
pub struct ArchiveWatcher {
    events: mpsc::UnboundedReceiver<ArchiveEvent>,
    task: JoinHandle<()>,
    // Dropping the OS watcher stops event delivery.
    _watcher: RecommendedWatcher,
}

impl ArchiveWatcher {
    pub(crate) fn spawn(archive: Archive) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            // Delivered on the notify backend thread; an unbounded channel
            // keeps the callback non-blocking.
            let _ = raw_tx.send(event);
        })
        .context("couldn't create filesystem watcher")?;
        watcher
            .watch(archive.root(), RecursiveMode::Recursive)
            .with_context(|| {
                format!("couldn't watch archive root {}", archive.root().display())
            })?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(translate(archive, raw_rx, event_tx));
        Ok(Self {
            events,
            task,
            _watcher: watcher,
        })
    }

    /// The next archive event; `None` once the watcher has stopped.
    pub async fn recv(&mut self) -> Option<ArchiveEvent> {
        self.events.recv().await
    }
}

impl Drop for ArchiveWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn translate(
    archive: Archive,
    mut raw: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    out: mpsc::UnboundedSender<ArchiveEvent>,
) {
    while let Some(result) = raw.recv().await {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                // The backend lost events; rescan so nothing stays missed.
                warn!(%err, "filesystem watcher error; rescanning archive");
                rescan(&archive, &out);
                continue;
            }
        };
        if event.need_rescan() {
            warn!("filesystem watcher overflow; rescanning archive");
            rescan(&archive, &out);
            continue;
        }
        match event.kind {
            EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Access(notify::event::AccessKind::Close(
                notify::event::AccessMode::Write,
            )) => {
                for path in &event.paths {
                    observe_path(&archive, path, &out);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    report_removed(&archive, path, &out);
                }
            }
            _ => {}
        }
    }
}

fn is_hidden(archive: &Archive, path: &Path) -> bool {
    path.strip_prefix(archive.root())
        .map(|relative| relative.starts_with(HIDDEN_DIR))
        .unwrap_or(true)
}

/// Classifies a created or renamed path: new regular files are announced
/// whole, new directories are walked for files that already exist, and a
/// path that no longer exists was renamed away.
fn observe_path(archive: &Archive, path: &Path, out: &mpsc::UnboundedSender<ArchiveEvent>) {
    if is_hidden(archive, path) {
        return;
    }
    let Ok(metadata) = std::fs::metadata(path) else {
        report_removed(archive, path, out);
        return;
    };
    if metadata.is_dir() {
        walk_subtree(archive, path, out);
        return;
    }
    if !metadata.is_file() {
        return;
    }
    match archive.file_info_at(path) {
        Ok(Some(info)) => {
            trace!(file = %info.path(), "new file in archive");
            let _ = out.send(ArchiveEvent::Available(PieceSpecSet::whole_file(info)));
        }
        Ok(None) => {}
        Err(err) => {
            debug!(path = %path.display(), %err, "new file was just deleted");
        }
    }
}

fn report_removed(
    archive: &Archive,
    path: &Path,
    out: &mpsc::UnboundedSender<ArchiveEvent>,
) {
    if is_hidden(archive, path) {
        return;
    }
    let Ok(archive_path) = archive.relativize(path) else {
        return;
    };
    debug!(file = %archive_path, "file removed from archive");
    let _ = out.send(ArchiveEvent::Removed(FileId::new(
        archive_path,
        ArchiveTime::now(),
    )));
}

fn walk_subtree(archive: &Archive, dir: &Path, out: &mpsc::UnboundedSender<ArchiveEvent>) {
    let result = archive.walk_dir(dir, &Filter::Everything, &mut |specs| {
        let _ = out.send(ArchiveEvent::Available(specs));
    });
    if let Err(err) = result {
        error!(dir = %dir.display(), %err, "couldn't walk new directory");
    }
}

fn rescan(archive: &Archive, out: &mpsc::UnboundedSender<ArchiveEvent>) {
    let result = archive.walk(&Filter::Everything, &mut |specs| {
        let _ = out.send(ArchiveEvent::Available(specs));
    });
    if let Err(err) = result {
        error!(%err, "couldn't rescan archive");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::ArchiveEvent;
    use crate::archive::{Archive, ArchiveConfig};

    async fn next_available(
        watcher: &mut super::ArchiveWatcher,
        path: &str,
    ) -> Option<ArchiveEvent> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
                .await
                .ok()??;
            match &event {
                ArchiveEvent::Available(specs)
                    if specs.files().iter().any(|f| f.info.path().as_str() == path) =>
                {
                    return Some(event)
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn reports_new_files_and_skips_hidden_tree() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), ArchiveConfig::default()).unwrap();
        let mut watcher = archive.watch().unwrap();

        std::fs::create_dir_all(root.path().join("a")).unwrap();
        std::fs::write(root.path().join("a/new.txt"), b"payload").unwrap();
        // Hidden writes must stay invisible.
        std::fs::create_dir_all(root.path().join(".sruth/x")).unwrap();
        std::fs::write(root.path().join(".sruth/x/staging"), b"hidden").unwrap();

        let event = next_available(&mut watcher, "a/new.txt").await;
        assert!(event.is_some(), "expected a notice for a/new.txt");
    }

    #[tokio::test]
    async fn reports_removed_files() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), ArchiveConfig::default()).unwrap();
        let target = root.path().join("gone.txt");
        std::fs::write(&target, b"payload").unwrap();

        let mut watcher = archive.watch().unwrap();
        std::fs::remove_file(&target).unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
                .await
                .expect("watcher timed out")
                .expect("watcher closed");
            if let ArchiveEvent::Removed(id) = event {
                assert_eq!(id.path().as_str(), "gone.txt");
                break;
            }
        }
    }
}
