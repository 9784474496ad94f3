use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::path::ArchivePath;

/// A compiled pathname pattern. Equality, ordering, and the serialized form
/// all use the source pattern string.
#[derive(Clone)]
pub struct PathPattern {
    pattern: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern)?;
        Ok(Self { pattern, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, path: &ArchivePath) -> bool {
        self.regex.is_match(path.as_str())
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for PathPattern {}

impl Hash for PathPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
    }
}

impl FromStr for PathPattern {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.pattern)
    }
}

impl Serialize for PathPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(pattern).map_err(D::Error::custom)
    }
}

/// A boolean criterion over archive pathnames, closed under intersection.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Filter {
    Everything,
    Nothing,
    Prefix(ArchivePath),
    Pattern(PathPattern),
    All(Vec<Filter>),
}

impl Filter {
    pub fn matches(&self, path: &ArchivePath) -> bool {
        match self {
            Self::Everything => true,
            Self::Nothing => false,
            Self::Prefix(prefix) => path.starts_with(prefix),
            Self::Pattern(pattern) => pattern.matches(path),
            Self::All(filters) => filters.iter().all(|filter| filter.matches(path)),
        }
    }

    /// Intersection of two filters, simplified where the result is exactly
    /// representable.
    pub fn reduce(self, other: Filter) -> Filter {
        match (self, other) {
            (Self::Everything, other) => other,
            (this, Self::Everything) => this,
            (Self::Nothing, _) | (_, Self::Nothing) => Self::Nothing,
            (Self::Prefix(a), Self::Prefix(b)) => {
                if a.starts_with(&b) {
                    Self::Prefix(a)
                } else if b.starts_with(&a) {
                    Self::Prefix(b)
                } else {
                    Self::Nothing
                }
            }
            (this, other) if this == other => this,
            (Self::All(mut these), Self::All(those)) => {
                these.extend(those);
                Self::All(these)
            }
            (Self::All(mut these), other) => {
                these.push(other);
                Self::All(these)
            }
            (this, Self::All(mut those)) => {
                those.insert(0, this);
                Self::All(those)
            }
            (this, other) => Self::All(vec![this, other]),
        }
    }

    /// True when the intersection with `other` provably matches nothing.
    /// Conservative: pattern filters are never pronounced disjoint.
    pub fn disjoint_with(&self, other: &Filter) -> bool {
        matches!(
            self.clone().reduce(other.clone()),
            Self::Nothing
        )
    }

    /// When the filter names exactly one file, that file's pathname.
    pub fn exact_path(&self) -> Option<&ArchivePath> {
        match self {
            Self::Prefix(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everything => write!(f, "EVERYTHING"),
            Self::Nothing => write!(f, "NOTHING"),
            Self::Prefix(prefix) => write!(f, "prefix:{prefix}"),
            Self::Pattern(pattern) => write!(f, "pattern:{}", pattern.as_str()),
            Self::All(filters) => {
                write!(f, "all:[")?;
                for (i, filter) in filters.iter().enumerate() {
                    if i > 0 {
                        write!(f, " & ")?;
                    }
                    write!(f, "{filter}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Filter, PathPattern};
    use crate::path::ArchivePath;

    fn path(s: &str) -> ArchivePath {
        ArchivePath::new(s).unwrap()
    }

    #[test]
    fn prefix_matching() {
        let filter = Filter::Prefix(path("data/model"));
        assert!(filter.matches(&path("data/model/run1.nc")));
        assert!(filter.matches(&path("data/model")));
        assert!(!filter.matches(&path("data/modelX")));
    }

    #[test]
    fn pattern_matching() {
        let filter = Filter::Pattern(PathPattern::new(r"\.nc$").unwrap());
        assert!(filter.matches(&path("data/run1.nc")));
        assert!(!filter.matches(&path("data/run1.txt")));
    }

    #[test]
    fn reduce_identities() {
        let prefix = Filter::Prefix(path("a/b"));
        assert_eq!(Filter::Everything.reduce(prefix.clone()), prefix);
        assert_eq!(prefix.clone().reduce(Filter::Nothing), Filter::Nothing);
        assert_eq!(
            prefix.clone().reduce(Filter::Prefix(path("a"))),
            prefix.clone()
        );
        assert_eq!(
            prefix.reduce(Filter::Prefix(path("c"))),
            Filter::Nothing
        );
    }

    #[test]
    fn reduce_falls_back_to_conjunction() {
        let prefix = Filter::Prefix(path("a"));
        let pattern = Filter::Pattern(PathPattern::new(r"\.nc$").unwrap());
        let reduced = prefix.clone().reduce(pattern.clone());
        assert_eq!(reduced, Filter::All(vec![prefix, pattern]));
        assert!(reduced.matches(&path("a/x.nc")));
        assert!(!reduced.matches(&path("b/x.nc")));
        assert!(!reduced.matches(&path("a/x.txt")));
    }
}
