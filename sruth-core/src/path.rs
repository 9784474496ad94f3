use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the hidden state directory under the archive root. Files below it
/// are never distributed.
pub const HIDDEN_DIR: &str = ".sruth";

/// Name of the reserved administrative subtree. Files below it never expire.
pub const ADMIN_DIR: &str = "SRUTH";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("archive path is empty")]
    Empty,
    #[error("archive path is absolute: {0}")]
    Absolute(String),
    #[error("archive path contains a `.` or `..` segment: {0}")]
    DotSegment(String),
    #[error("archive path starts with the hidden directory: {0}")]
    Hidden(String),
    #[error("path {path} lies outside the archive rooted at {root}")]
    OutsideRoot { path: String, root: String },
    #[error("path is not valid UTF-8: {0}")]
    NotUtf8(String),
}

/// A canonicalized, slash-separated pathname relative to the archive root.
///
/// Never absolute, never contains `.` or `..` segments, and never begins
/// with [`HIDDEN_DIR`]. Compares and hashes as a plain value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchivePath(String);

impl ArchivePath {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        if path.starts_with('/') {
            return Err(PathError::Absolute(path));
        }
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(PathError::DotSegment(path));
            }
        }
        if path == HIDDEN_DIR || path.starts_with(&format!("{HIDDEN_DIR}/")) {
            return Err(PathError::Hidden(path));
        }
        Ok(Self(path))
    }

    /// Relativizes an absolute pathname against the archive root.
    pub fn from_absolute(path: &Path, root: &Path) -> Result<Self, PathError> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| PathError::OutsideRoot {
                path: path.display().to_string(),
                root: root.display().to_string(),
            })?;
        let mut joined = String::new();
        for component in relative.components() {
            let Component::Normal(segment) = component else {
                return Err(PathError::DotSegment(relative.display().to_string()));
            };
            let segment = segment
                .to_str()
                .ok_or_else(|| PathError::NotUtf8(relative.display().to_string()))?;
            if !joined.is_empty() {
                joined.push('/');
            }
            joined.push_str(segment);
        }
        Self::new(joined)
    }

    /// Resolves this pathname against a root directory.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.0.split('/') {
            path.push(segment);
        }
        path
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `prefix` names this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &ArchivePath) -> bool {
        self.0 == prefix.0
            || (self.0.len() > prefix.0.len()
                && self.0.starts_with(&prefix.0)
                && self.0.as_bytes()[prefix.0.len()] == b'/')
    }

    /// True when this path lies under the reserved administrative subtree.
    pub fn is_admin(&self) -> bool {
        self.0 == ADMIN_DIR || self.0.starts_with("SRUTH/")
    }

    pub fn join(&self, segment: &str) -> Result<Self, PathError> {
        Self::new(format!("{}/{}", self.0, segment))
    }
}

impl FromStr for ArchivePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ArchivePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ArchivePath> for String {
    fn from(path: ArchivePath) -> Self {
        path.0
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{ArchivePath, PathError};

    #[test]
    fn rejects_invalid_paths() {
        assert!(matches!(ArchivePath::new(""), Err(PathError::Empty)));
        assert!(matches!(
            ArchivePath::new("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            ArchivePath::new("a/../b"),
            Err(PathError::DotSegment(_))
        ));
        assert!(matches!(
            ArchivePath::new("./a"),
            Err(PathError::DotSegment(_))
        ));
        assert!(matches!(
            ArchivePath::new(".sruth/a"),
            Err(PathError::Hidden(_))
        ));
    }

    #[test]
    fn relativizes_against_root() {
        let path = ArchivePath::from_absolute(
            Path::new("/data/archive/a/b.txt"),
            Path::new("/data/archive"),
        )
        .unwrap();
        assert_eq!(path.as_str(), "a/b.txt");
        assert_eq!(
            path.resolve(Path::new("/data/archive")),
            Path::new("/data/archive/a/b.txt")
        );
    }

    #[test]
    fn prefix_matches_whole_segments_only() {
        let prefix = ArchivePath::new("a/b").unwrap();
        assert!(ArchivePath::new("a/b").unwrap().starts_with(&prefix));
        assert!(ArchivePath::new("a/b/c.txt").unwrap().starts_with(&prefix));
        assert!(!ArchivePath::new("a/bc.txt").unwrap().starts_with(&prefix));
    }

    #[test]
    fn admin_subtree() {
        assert!(ArchivePath::new("SRUTH/tracker/topology")
            .unwrap()
            .is_admin());
        assert!(!ArchivePath::new("SRUTHX/file").unwrap().is_admin());
    }
}
