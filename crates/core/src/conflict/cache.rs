//! Per-session cache of outstanding conflicts.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, instrument};

use super::record::{ConflictId, ConflictRecord};
use crate::errors::ServiceError;
use crate::listeners::{ListenerId, ListenerSet};
use crate::service::VersionControlService;

/// Notifications about the conflict set. All methods default to no-ops.
pub trait ConflictCacheListener: Send + Sync {
    fn on_conflicts_refreshed(&self, _count: usize) {}
    fn on_conflict_added(&self, _conflict: &ConflictRecord) {}
    fn on_conflict_removed(&self, _conflict: &ConflictRecord) {}
}

/// Outstanding conflicts for one session, keyed by conflict id.
///
/// Readers get copies; a resolution works on its own copy and hands the
/// result back through [`ConflictCache::commit`].
pub struct ConflictCache {
    service: Arc<dyn VersionControlService>,
    conflicts: RwLock<BTreeMap<ConflictId, ConflictRecord>>,
    listeners: ListenerSet<dyn ConflictCacheListener>,
}

impl ConflictCache {
    pub fn new(service: Arc<dyn VersionControlService>) -> Self {
        Self {
            service,
            conflicts: RwLock::new(BTreeMap::new()),
            listeners: ListenerSet::new(),
        }
    }

    /// Replace the cached set with the server's current conflicts. On error
    /// the previous set is kept.
    #[instrument(skip(self))]
    pub fn refresh(&self) -> Result<usize, ServiceError> {
        let fresh = self.service.refresh_conflicts()?;
        let map: BTreeMap<ConflictId, ConflictRecord> = fresh
            .into_iter()
            .filter(|c| !c.resolved)
            .map(|c| (c.id, c))
            .collect();
        let count = map.len();
        *self.write() = map;

        info!(count, "conflict cache refreshed");
        self.listeners.for_each(|l| l.on_conflicts_refreshed(count));
        Ok(count)
    }

    /// Add or replace a conflict.
    pub fn insert(&self, conflict: ConflictRecord) {
        debug!(conflict_id = %conflict.id, "caching conflict");
        self.write().insert(conflict.id, conflict.clone());
        self.listeners.for_each(|l| l.on_conflict_added(&conflict));
    }

    /// A copy of the conflict with the given id.
    pub fn get(&self, id: ConflictId) -> Option<ConflictRecord> {
        self.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<ConflictRecord> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn remove(&self, id: ConflictId) -> Option<ConflictRecord> {
        let removed = self.write().remove(&id);
        if let Some(conflict) = &removed {
            self.listeners.for_each(|l| l.on_conflict_removed(conflict));
        }
        removed
    }

    /// Write back a resolution's copy of a conflict. Resolved conflicts
    /// leave the cache; unresolved ones replace the cached value.
    pub fn commit(&self, conflict: ConflictRecord) {
        if conflict.resolved {
            debug!(conflict_id = %conflict.id, resolution = %conflict.resolution, "conflict resolved");
            self.remove(conflict.id);
        } else {
            self.write().insert(conflict.id, conflict);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ConflictCacheListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ConflictId, ConflictRecord>> {
        self.conflicts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ConflictId, ConflictRecord>> {
        self.conflicts.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ConflictCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictCache").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::VersionedItem;
    use crate::models::*;
    use std::sync::Mutex;

    struct StubService {
        conflicts: Mutex<Result<Vec<ConflictRecord>, String>>,
    }

    impl VersionControlService for StubService {
        fn refresh_changes(&self) -> Result<Vec<PendingChange>, ServiceError> {
            Ok(Vec::new())
        }
        fn refresh_conflicts(&self) -> Result<Vec<ConflictRecord>, ServiceError> {
            self.conflicts
                .lock()
                .unwrap()
                .clone()
                .map_err(ServiceError::Unavailable)
        }
        fn query_conflicts(&self, _paths: &[String]) -> Result<Vec<ConflictRecord>, ServiceError> {
            Ok(Vec::new())
        }
        fn resolve_conflict(&self, _record: &mut ConflictRecord) -> Result<(), ServiceError> {
            Ok(())
        }
        fn pend_edit(
            &self,
            _items: &[ItemSpec],
            _lock: LockLevel,
            _options: &PendOptions,
        ) -> Result<usize, ServiceError> {
            Ok(0)
        }
        fn get(&self, _r: &GetRequest, _o: &GetOptions) -> Result<GetResult, ServiceError> {
            Ok(GetResult::default())
        }
    }

    fn conflict(id: i64) -> ConflictRecord {
        ConflictRecord::new(
            ConflictId(id),
            VersionedItem::new(id, format!("$/p/{id}.txt"), 1),
            VersionedItem::new(id, format!("$/p/{id}.txt"), 2),
        )
    }

    #[test]
    fn test_refresh_replaces_and_skips_resolved() {
        let mut resolved = conflict(3);
        resolved.resolved = true;
        let service = Arc::new(StubService {
            conflicts: Mutex::new(Ok(vec![conflict(1), conflict(2), resolved])),
        });
        let cache = ConflictCache::new(service);
        cache.insert(conflict(9));

        assert_eq!(cache.refresh().unwrap(), 2);
        assert!(cache.get(ConflictId(9)).is_none());
        assert!(cache.get(ConflictId(1)).is_some());
    }

    #[test]
    fn test_failed_refresh_keeps_previous_set() {
        let service = Arc::new(StubService {
            conflicts: Mutex::new(Err("offline".into())),
        });
        let cache = ConflictCache::new(service);
        cache.insert(conflict(1));

        assert!(cache.refresh().is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_commit_removes_resolved() {
        let service = Arc::new(StubService {
            conflicts: Mutex::new(Ok(Vec::new())),
        });
        let cache = ConflictCache::new(service);
        cache.insert(conflict(1));

        let mut copy = cache.get(ConflictId(1)).unwrap();
        copy.merged_file = Some("/tmp/merged".into());
        cache.commit(copy);
        assert_eq!(
            cache.get(ConflictId(1)).unwrap().merged_file.as_deref(),
            Some("/tmp/merged")
        );

        let mut copy = cache.get(ConflictId(1)).unwrap();
        copy.resolved = true;
        cache.commit(copy);
        assert!(cache.is_empty());
    }
}
