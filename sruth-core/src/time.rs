use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Millisecond-resolution timestamp associated with an archive file.
///
/// Ordering is reverse-chronological: a newer time sorts before an older
/// one, so sorted structures place the freshest version first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveTime(i64);

impl ArchiveTime {
    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn from_system(time: SystemTime) -> Self {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        };
        Self(millis)
    }

    /// Reads the modification time of a file.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_system(metadata.modified()?))
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn as_system(&self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.0.unsigned_abs())
        }
    }

    /// Forces a file's modification time to this instance so that a restart
    /// or walk reconstructs the identical file identity.
    pub fn apply_to(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::open(path)?;
        file.set_modified(self.as_system())
    }

    pub fn newer_than(&self, other: &ArchiveTime) -> bool {
        self.0 > other.0
    }
}

impl Ord for ArchiveTime {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse-chronological: newer < older.
        other.0.cmp(&self.0)
    }
}

impl PartialOrd for ArchiveTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ArchiveTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl fmt::Display for ArchiveTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}s", self.0 / 1000, (self.0 % 1000).abs())
    }
}
