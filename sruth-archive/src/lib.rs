mod archive;
mod delay_queue;
mod disk_file;
mod watcher;

pub use archive::{Archive, ArchiveConfig};
pub use delay_queue::DelayedPathActionQueue;
pub use watcher::{ArchiveEvent, ArchiveWatcher};

/// Name of the persistent deletion journal inside the hidden directory. The
/// only hidden entry that survives a restart.
pub const DELETION_QUEUE_FILE: &str = "fileDeletionQueue";
