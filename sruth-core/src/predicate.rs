use std::fmt;

use serde::{Deserialize, Serialize};

use crate::filter::Filter;
use crate::path::ArchivePath;

/// A node's declarative interest: the filters still wanted plus the filters
/// already satisfied. A satisfied filter is never re-requested.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Predicate {
    filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    satisfied: Vec<Filter>,
}

impl Predicate {
    /// Matches every pathname. Used by nodes that want all data.
    pub fn everything() -> Self {
        Self {
            filters: vec![Filter::Everything],
            satisfied: Vec::new(),
        }
    }

    /// Matches no pathname. Advertised by source nodes, which serve but do
    /// not request.
    pub fn nothing() -> Self {
        Self {
            filters: Vec::new(),
            satisfied: Vec::new(),
        }
    }

    pub fn new(filters: Vec<Filter>) -> Self {
        let filters = filters
            .into_iter()
            .filter(|filter| *filter != Filter::Nothing)
            .collect();
        Self {
            filters,
            satisfied: Vec::new(),
        }
    }

    /// True when some still-unsatisfied filter matches the pathname.
    pub fn matches(&self, path: &ArchivePath) -> bool {
        self.filters.iter().any(|filter| filter.matches(path))
    }

    pub fn matches_nothing(&self) -> bool {
        self.filters.is_empty()
    }

    /// Marks any filter that names exactly this file as satisfied. Returns
    /// true when the predicate narrowed.
    pub fn satisfied_by(&mut self, path: &ArchivePath) -> bool {
        let mut narrowed = false;
        let mut index = 0;
        while index < self.filters.len() {
            if self.filters[index].exact_path() == Some(path) {
                let filter = self.filters.remove(index);
                self.satisfied.push(filter);
                narrowed = true;
            } else {
                index += 1;
            }
        }
        narrowed
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// A single filter covering this predicate, for tracker queries. A
    /// predicate is a union of interests, so multiple filters
    /// over-approximate to the broadest one.
    pub fn as_filter(&self) -> Filter {
        match self.filters.len() {
            0 => Filter::Nothing,
            1 => self.filters[0].clone(),
            _ => Filter::Everything,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filters.is_empty() {
            return write!(f, "NOTHING");
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{filter}")?;
        }
        Ok(())
    }
}
