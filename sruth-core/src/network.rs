use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::filter::Filter;

/// Which servers serve which filter: the topology snapshot handed out by a
/// tracker and redistributed through the archive's admin subtree.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct FilterServerMap {
    entries: HashMap<Filter, BTreeSet<SocketAddr>>,
}

impl FilterServerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filter: Filter, server: SocketAddr) {
        self.entries.entry(filter).or_default().insert(server);
    }

    /// Drops a server from every entry, pruning entries left empty.
    pub fn remove_server(&mut self, server: &SocketAddr) {
        self.entries.retain(|_, servers| {
            servers.remove(server);
            !servers.is_empty()
        });
    }

    /// The entries relevant to `filter`: those whose own filter provably
    /// intersects it.
    pub fn subset(&self, filter: &Filter) -> FilterServerMap {
        let entries = self
            .entries
            .iter()
            .filter(|(entry, _)| !entry.disjoint_with(filter))
            .map(|(entry, servers)| (entry.clone(), servers.clone()))
            .collect();
        Self { entries }
    }

    /// All servers relevant to `filter`, deduplicated.
    pub fn servers_for(&self, filter: &Filter) -> BTreeSet<SocketAddr> {
        self.entries
            .iter()
            .filter(|(entry, _)| !entry.disjoint_with(filter))
            .flat_map(|(_, servers)| servers.iter().copied())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
