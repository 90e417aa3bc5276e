//! Read-only alias table.
//!
//! Writer connections may register an alias for the document they attach
//! to; a connection presenting the alias later is attached to that
//! document with writes disabled. The table is an in-memory map for the
//! process lifetime, never persisted and never evicted. Registration is
//! last-write-wins: re-registering an alias silently repoints it.

use dashmap::DashMap;

/// Alias → document id map. Shared across all connections.
#[derive(Default)]
pub struct AliasTable {
    entries: DashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or repoint) an alias for a document id.
    pub fn register(&self, alias: &str, doc_id: &str) {
        match self.entries.insert(alias.to_string(), doc_id.to_string()) {
            Some(previous) if previous != doc_id => {
                log::info!("alias {alias}: repointed {previous} -> {doc_id}");
            }
            Some(_) => {}
            None => log::info!("alias {alias}: registered for {doc_id}"),
        }
    }

    /// Resolve an alias to its document id.
    pub fn resolve(&self, alias: &str) -> Option<String> {
        self.entries.get(alias).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
