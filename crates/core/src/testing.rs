//! In-memory collaborators shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::conflict::{ConflictId, ConflictRecord, ContentMergeSummary, ResolutionOutcome, VersionedItem};
use crate::errors::ServiceError;
use crate::events::EventEngine;
use crate::models::*;
use crate::session::Workspace;
use crate::watch::PathWatchManager;

pub struct FakeService {
    pub changes: Mutex<Vec<PendingChange>>,
    pub conflicts: Mutex<Vec<ConflictRecord>>,
    pub fail_changes: AtomicBool,
    pub fail_conflicts: AtomicBool,
    pub change_refreshes: AtomicUsize,
    /// Conflicts the server refuses to resolve.
    pub unresolvable: Mutex<HashSet<ConflictId>>,
    pub resolve_error: Mutex<Option<String>>,
    /// Held inside every resolve call.
    pub resolve_delay: Mutex<Option<Duration>>,
    pub resolved: Mutex<Vec<(ConflictId, ResolutionOutcome)>>,
    pub pend_count: Mutex<usize>,
    pub pended: Mutex<Vec<String>>,
    pub get_result: Mutex<GetResult>,
    pub get_error: Mutex<Option<String>>,
    pub queried: Mutex<Vec<ConflictRecord>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            changes: Mutex::new(Vec::new()),
            conflicts: Mutex::new(Vec::new()),
            fail_changes: AtomicBool::new(false),
            fail_conflicts: AtomicBool::new(false),
            change_refreshes: AtomicUsize::new(0),
            unresolvable: Mutex::new(HashSet::new()),
            resolve_error: Mutex::new(None),
            resolve_delay: Mutex::new(None),
            resolved: Mutex::new(Vec::new()),
            pend_count: Mutex::new(1),
            pended: Mutex::new(Vec::new()),
            get_result: Mutex::new(GetResult::default()),
            get_error: Mutex::new(None),
            queried: Mutex::new(Vec::new()),
        })
    }
}

impl crate::service::VersionControlService for FakeService {
    fn refresh_changes(&self) -> Result<Vec<PendingChange>, ServiceError> {
        self.change_refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail_changes.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("changes offline".into()));
        }
        Ok(self.changes.lock().unwrap().clone())
    }

    fn refresh_conflicts(&self) -> Result<Vec<ConflictRecord>, ServiceError> {
        if self.fail_conflicts.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("conflicts offline".into()));
        }
        Ok(self.conflicts.lock().unwrap().clone())
    }

    fn query_conflicts(&self, _paths: &[String]) -> Result<Vec<ConflictRecord>, ServiceError> {
        Ok(self.queried.lock().unwrap().clone())
    }

    fn resolve_conflict(&self, record: &mut ConflictRecord) -> Result<(), ServiceError> {
        let delay = *self.resolve_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = self.resolve_error.lock().unwrap().clone() {
            return Err(ServiceError::Rejected(message));
        }
        self.resolved.lock().unwrap().push((record.id, record.resolution));
        if self.unresolvable.lock().unwrap().contains(&record.id) {
            record.resolved = false;
            record.merge_summary = Some(ContentMergeSummary {
                yours_changed: 1,
                theirs_changed: 1,
                conflicting: 1,
            });
        } else {
            record.resolved = true;
        }
        Ok(())
    }

    fn pend_edit(
        &self,
        items: &[ItemSpec],
        _lock: LockLevel,
        _options: &PendOptions,
    ) -> Result<usize, ServiceError> {
        self.pended
            .lock()
            .unwrap()
            .extend(items.iter().map(|i| i.path.clone()));
        Ok(*self.pend_count.lock().unwrap())
    }

    fn get(&self, _request: &GetRequest, _options: &GetOptions) -> Result<GetResult, ServiceError> {
        if let Some(message) = self.get_error.lock().unwrap().clone() {
            return Err(ServiceError::Unavailable(message));
        }
        Ok(self.get_result.lock().unwrap().clone())
    }
}

pub fn key(name: &str) -> SessionKey {
    SessionKey::new("https://tfs.example.com/tfs", name)
}

pub fn workspace(
    name: &str,
    location: WorkspaceLocation,
    service: Arc<FakeService>,
    events: Arc<EventEngine>,
) -> Workspace {
    Workspace {
        binding: WorkspaceBinding::new(key(name), location, format!("/src/{name}")),
        service,
        events,
        watches: PathWatchManager::null(),
    }
}

pub fn conflict(id: i64, path: &str) -> ConflictRecord {
    ConflictRecord::new(
        ConflictId(id),
        VersionedItem::new(id, format!("$/proj{path}"), 3),
        VersionedItem::new(id, format!("$/proj{path}"), 5),
    )
    .with_local_paths(path, path)
}
