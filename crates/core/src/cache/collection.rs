//! Pending changes indexed by server path and by local path.

use std::collections::HashMap;

use crate::errors::ChangeCacheError;
use crate::models::PendingChange;

/// Canonical form of a server path: server paths are case-insensitive and
/// never end in a separator (except the root `$/`).
pub fn canonical_server_path(path: &str) -> String {
    let lower = path.to_lowercase();
    if lower.len() > 2 {
        lower.trim_end_matches('/').to_string()
    } else {
        lower
    }
}

/// Canonical form of a local path: no trailing separator.
pub fn canonical_local_path(path: &str) -> String {
    if path.len() > 1 {
        path.trim_end_matches(&['/', '\\'][..]).to_string()
    } else {
        path.to_string()
    }
}

fn is_same_or_child(path: &str, parent: &str, separators: &[char]) -> bool {
    match path.strip_prefix(parent) {
        Some("") => true,
        Some(rest) => {
            parent.ends_with(separators) || rest.starts_with(separators)
        }
        None => false,
    }
}

/// Key a change is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ChangeKey {
    Server(String),
    LocalOnly(String),
}

/// Value-type collection of pending changes. Point lookups by server or
/// local path are O(1).
#[derive(Debug, Clone, Default)]
pub struct PendingChangeCollection {
    changes: HashMap<ChangeKey, PendingChange>,
    by_local: HashMap<String, ChangeKey>,
}

impl PendingChangeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from a full server listing.
    pub fn from_changes(
        changes: impl IntoIterator<Item = PendingChange>,
    ) -> Result<Self, ChangeCacheError> {
        let mut collection = Self::new();
        for change in changes {
            collection.insert(change)?;
        }
        Ok(collection)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Insert or replace; returns the change previously stored for the same
    /// item.
    pub fn insert(&mut self, change: PendingChange) -> Result<Option<PendingChange>, ChangeCacheError> {
        let key = Self::key_for(&change)?;
        let old = self.remove(&change);
        if let Some(local) = &change.local_path {
            self.by_local.insert(canonical_local_path(local), key.clone());
        }
        self.changes.insert(key, change);
        Ok(old)
    }

    /// Remove the stored change matching `change`'s server path, then its
    /// rename source, then its local path.
    pub fn remove(&mut self, change: &PendingChange) -> Option<PendingChange> {
        let candidates = [
            change
                .server_path
                .as_deref()
                .map(|p| ChangeKey::Server(canonical_server_path(p))),
            change
                .source_server_path
                .as_deref()
                .map(|p| ChangeKey::Server(canonical_server_path(p))),
            change
                .local_path
                .as_deref()
                .and_then(|p| self.by_local.get(&canonical_local_path(p)).cloned()),
        ];

        let key = candidates
            .into_iter()
            .flatten()
            .find(|k| self.changes.contains_key(k))?;
        let removed = self.changes.remove(&key)?;
        if let Some(local) = &removed.local_path {
            self.by_local.remove(&canonical_local_path(local));
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.changes.clear();
        self.by_local.clear();
    }

    pub fn by_server_path(&self, server_path: &str) -> Option<&PendingChange> {
        self.changes
            .get(&ChangeKey::Server(canonical_server_path(server_path)))
    }

    pub fn by_local_path(&self, local_path: &str) -> Option<&PendingChange> {
        self.by_local
            .get(&canonical_local_path(local_path))
            .and_then(|key| self.changes.get(key))
    }

    /// The pending rename whose prior server path is `server_path`.
    pub fn rename_by_source(&self, server_path: &str) -> Option<&PendingChange> {
        let wanted = canonical_server_path(server_path);
        self.changes.values().find(|c| {
            c.source_server_path
                .as_deref()
                .is_some_and(|s| canonical_server_path(s) == wanted)
        })
    }

    pub fn under_server_path(&self, server_path: &str) -> Vec<&PendingChange> {
        let parent = canonical_server_path(server_path);
        self.changes
            .values()
            .filter(|c| {
                c.server_path
                    .as_deref()
                    .is_some_and(|p| is_same_or_child(&canonical_server_path(p), &parent, &['/']))
            })
            .collect()
    }

    pub fn under_local_path(&self, local_path: &str) -> Vec<&PendingChange> {
        let parent = canonical_local_path(local_path);
        self.by_local
            .iter()
            .filter(|(path, _)| is_same_or_child(path, &parent, &['/', '\\']))
            .filter_map(|(_, key)| self.changes.get(key))
            .collect()
    }

    /// All changes, ordered by server path then local path.
    pub fn values(&self) -> Vec<PendingChange> {
        let mut all: Vec<PendingChange> = self.changes.values().cloned().collect();
        all.sort_by(|a, b| {
            (a.server_path.as_deref(), a.local_path.as_deref())
                .cmp(&(b.server_path.as_deref(), b.local_path.as_deref()))
        });
        all
    }

    pub(crate) fn by_server_path_mut(&mut self, server_path: &str) -> Option<&mut PendingChange> {
        self.changes
            .get_mut(&ChangeKey::Server(canonical_server_path(server_path)))
    }

    pub(crate) fn by_local_path_mut(&mut self, local_path: &str) -> Option<&mut PendingChange> {
        let key = self.by_local.get(&canonical_local_path(local_path))?.clone();
        self.changes.get_mut(&key)
    }

    fn key_for(change: &PendingChange) -> Result<ChangeKey, ChangeCacheError> {
        match (&change.server_path, &change.local_path) {
            (Some(server), _) => Ok(ChangeKey::Server(canonical_server_path(server))),
            (None, Some(local)) => Ok(ChangeKey::LocalOnly(canonical_local_path(local))),
            (None, None) => Err(ChangeCacheError::InvalidChange(change.id)),
        }
    }
}
