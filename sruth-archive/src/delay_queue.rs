use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sruth_core::{from_cbor, to_cbor, ArchiveTime, HIDDEN_DIR};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A scheduled deletion: the path falls due at `due_millis`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
struct Entry {
    due_millis: i64,
    path: PathBuf,
}

/// Persistent priority queue of pathnames to delete at a future time.
///
/// Entries are journaled to `.sruth/fileDeletionQueue` and survive a
/// restart. Deleting a path also removes ancestor directories that became
/// empty, up to but excluding the archive root.
pub struct DelayedPathActionQueue {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    root: PathBuf,
    journal_path: PathBuf,
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
}

impl DelayedPathActionQueue {
    /// Loads the journal (if any) and starts the deletion task. Must be
    /// called within a tokio runtime.
    pub fn start(root: PathBuf, journal_path: PathBuf) -> io::Result<Self> {
        let mut heap = BinaryHeap::new();
        if journal_path.exists() {
            let bytes = std::fs::read(&journal_path)?;
            match from_cbor::<Vec<Entry>>(&bytes) {
                Ok(entries) => {
                    for entry in entries {
                        heap.push(Reverse(entry));
                    }
                }
                Err(err) => {
                    warn!(journal = %journal_path.display(), %err, "unreadable deletion journal; starting empty");
                }
            }
        }
        if !heap.is_empty() {
            info!(pending = heap.len(), "restored scheduled deletions");
        }
        let inner = Arc::new(Inner {
            root,
            journal_path,
            heap: Mutex::new(heap),
            notify: Notify::new(),
        });
        let task = tokio::spawn(run(inner.clone()));
        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// Schedules `path` for deletion at `due`.
    pub fn schedule(&self, path: PathBuf, due: ArchiveTime) -> io::Result<()> {
        trace!(path = %path.display(), %due, "scheduling deletion");
        {
            let mut heap = self.inner.heap.lock().expect("deletion queue lock");
            heap.push(Reverse(Entry {
                due_millis: due.millis(),
                path,
            }));
            self.inner.persist(&heap)?;
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.inner.heap.lock().expect("deletion queue lock").len()
    }

    /// Stops the deletion task. Scheduled entries stay journaled for the
    /// next session.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().expect("deletion queue lock").take() {
            task.abort();
        }
    }
}

impl Drop for DelayedPathActionQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn persist(&self, heap: &BinaryHeap<Reverse<Entry>>) -> io::Result<()> {
        let entries: Vec<&Entry> = heap.iter().map(|Reverse(entry)| entry).collect();
        let bytes = to_cbor(&entries)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let tmp = self.journal_path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.journal_path)?;
        Ok(())
    }

    fn pop_due(&self, now: i64) -> Result<Option<Entry>, io::Error> {
        let mut heap = self.heap.lock().expect("deletion queue lock");
        match heap.peek() {
            Some(Reverse(entry)) if entry.due_millis <= now => {
                let Reverse(entry) = heap.pop().expect("peeked entry");
                self.persist(&heap)?;
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }

    fn next_due(&self) -> Option<i64> {
        let heap = self.heap.lock().expect("deletion queue lock");
        heap.peek().map(|Reverse(entry)| entry.due_millis)
    }

    /// Deletes the path (falling back to its hidden form), then prunes
    /// newly empty ancestors up to but excluding the archive root.
    fn act(&self, path: &Path) {
        debug!(path = %path.display(), "deleting expired file");
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let hidden = self.root.join(HIDDEN_DIR).join(relative);
                    match std::fs::remove_file(&hidden) {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {
                            info!(path = %path.display(), "expired file no longer exists");
                        }
                        Err(err) => warn!(path = %hidden.display(), %err, "couldn't delete expired file"),
                    }
                }
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "couldn't delete expired file");
                return;
            }
        }
        let mut dir = path.parent();
        while let Some(parent) = dir {
            if parent == self.root || !parent.starts_with(&self.root) {
                break;
            }
            // remove_dir refuses non-empty directories, so a concurrent
            // file arrival simply stops the pruning.
            match std::fs::remove_dir(parent) {
                Ok(()) => dir = parent.parent(),
                Err(_) => break,
            }
        }
    }
}

async fn run(inner: Arc<Inner>) {
    loop {
        let now = ArchiveTime::now().millis();
        match inner.pop_due(now) {
            Ok(Some(entry)) => {
                inner.act(&entry.path);
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "couldn't persist deletion journal");
            }
        }
        match inner.next_due() {
            Some(due) => {
                let wait = Duration::from_millis((due - now).max(0) as u64);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = inner.notify.notified() => {}
                }
            }
            None => inner.notify.notified().await,
        }
    }
}
