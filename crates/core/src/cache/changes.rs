//! The pending-change cache.
//!
//! [`ChangeCache`] is the authoritative local view of a session's pending
//! changes. It is bulk-refreshed from the server and incrementally updated
//! from [`CoreEvent`]s. Bulk work happens inside an update window announced
//! by `on_before_update` / `on_after_update`; per-item events are only
//! raised outside such a window.

use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, error, info, instrument, warn};

use super::collection::PendingChangeCollection;
use crate::errors::ChangeCacheError;
use crate::events::{CoreEvent, CoreEventListener, EventEngine, PendRequest};
use crate::listeners::{ListenerId, ListenerSet};
use crate::models::{ChangeType, ClientId, EventSource, PendingChange, SessionKey, ENCODING_UNCHANGED};
use crate::service::VersionControlService;

/// Notifications about the pending-change set. All methods default to
/// no-ops.
pub trait ChangeCacheListener: Send + Sync {
    /// An update window opened. Per-item events are suppressed until the
    /// matching `on_after_update`.
    fn on_before_update(&self) {}
    /// The outermost update window closed. `modified` is true if any change
    /// was added, modified, removed, or cleared inside it.
    fn on_after_update(&self, _modified: bool) {}
    fn on_change_added(&self, _change: &PendingChange) {}
    fn on_change_modified(&self, _old: &PendingChange, _new: &PendingChange) {}
    fn on_change_removed(&self, _change: &PendingChange) {}
    fn on_changes_cleared(&self) {}
}

/// A listener call recorded under the writer mutex.
enum Notice {
    BeforeUpdate,
    AfterUpdate(bool),
    Added(PendingChange),
    Modified(PendingChange, PendingChange),
    Removed(PendingChange),
    Cleared,
}

/// Notices delivered once the writer mutex is released, so listeners may
/// call back into the cache.
struct Pending {
    listeners: Vec<Arc<dyn ChangeCacheListener>>,
    notices: Vec<Notice>,
}

impl Pending {
    fn deliver(self) {
        for notice in &self.notices {
            for listener in &self.listeners {
                match notice {
                    Notice::BeforeUpdate => listener.on_before_update(),
                    Notice::AfterUpdate(modified) => listener.on_after_update(*modified),
                    Notice::Added(c) => listener.on_change_added(c),
                    Notice::Modified(old, new) => listener.on_change_modified(old, new),
                    Notice::Removed(c) => listener.on_change_removed(c),
                    Notice::Cleared => listener.on_changes_cleared(),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct UpdateWindow {
    depth: usize,
    modified: bool,
}

/// Pending changes for one session.
pub struct ChangeCache {
    workspace: SessionKey,
    client: ClientId,
    service: Arc<dyn VersionControlService>,
    changes: RwLock<PendingChangeCollection>,
    /// Serializes writers; readers only take the `changes` read lock.
    writer: Mutex<()>,
    window: Mutex<UpdateWindow>,
    listeners: ListenerSet<dyn ChangeCacheListener>,
    subscription: Mutex<Option<(Arc<EventEngine>, ListenerId)>>,
}

impl ChangeCache {
    pub fn new(
        workspace: SessionKey,
        client: ClientId,
        service: Arc<dyn VersionControlService>,
    ) -> Self {
        Self {
            workspace,
            client,
            service,
            changes: RwLock::new(PendingChangeCollection::new()),
            writer: Mutex::new(()),
            window: Mutex::new(UpdateWindow::default()),
            listeners: ListenerSet::new(),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to the event engine. A second call replaces the first
    /// subscription.
    pub fn attach(self: &Arc<Self>, events: &Arc<EventEngine>) {
        let adapter = Arc::new(EventAdapter {
            cache: Arc::downgrade(self),
        });
        let id = events.subscribe(adapter);
        let previous = lock(&self.subscription).replace((Arc::clone(events), id));
        if let Some((engine, old)) = previous {
            engine.unsubscribe(old);
        }
    }

    /// Unsubscribe from the event engine.
    pub fn dispose(&self) {
        if let Some((engine, id)) = lock(&self.subscription).take() {
            engine.unsubscribe(id);
            debug!(workspace = %self.workspace, "change cache detached from events");
        }
    }

    // -----------------------------------------------------------------------
    // Bulk refresh
    // -----------------------------------------------------------------------

    /// Replace the cached set with the server's current pending changes.
    ///
    /// The new collection is fully built before it is swapped in, so a
    /// failure leaves the previous snapshot untouched.
    #[instrument(skip(self), fields(workspace = %self.workspace))]
    pub fn refresh(&self) -> Result<usize, ChangeCacheError> {
        let fresh = self.service.refresh_changes()?;
        let collection = PendingChangeCollection::from_changes(fresh)?;
        let count = collection.len();

        let pending = {
            let _writer = lock(&self.writer);
            let mut pending = self.pending();
            self.open_window(&mut pending);
            let previous = std::mem::replace(&mut *self.write(), collection);
            if !previous.is_empty() || count > 0 {
                self.mark_modified();
            }
            pending.notices.push(Notice::Cleared);
            self.close_window(&mut pending);
            pending
        };
        pending.deliver();

        info!(count, "pending change cache refreshed");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Incremental mutation
    // -----------------------------------------------------------------------

    /// Add a change, or modify the cached change for the same item.
    pub fn add(&self, change: PendingChange) -> Result<(), ChangeCacheError> {
        let pending = {
            let _writer = lock(&self.writer);
            let mut pending = self.pending();
            self.add_locked(change, &mut pending)?;
            pending
        };
        pending.deliver();
        Ok(())
    }

    /// Alias of [`ChangeCache::add`] for callers that know the item exists.
    pub fn modify(&self, change: PendingChange) -> Result<(), ChangeCacheError> {
        self.add(change)
    }

    /// Remove the cached change for `change`'s item. Returns whether
    /// anything was removed.
    pub fn remove(&self, change: &PendingChange) -> bool {
        let (removed, pending) = {
            let _writer = lock(&self.writer);
            let mut pending = self.pending();
            (self.remove_locked(change, &mut pending), pending)
        };
        pending.deliver();
        removed
    }

    fn add_locked(&self, change: PendingChange, pending: &mut Pending) -> Result<(), ChangeCacheError> {
        let old = self.write().insert(change.clone())?;
        self.mark_modified();
        if self.in_window() {
            return Ok(());
        }
        pending.notices.push(match old {
            Some(old) => Notice::Modified(old, change),
            None => Notice::Added(change),
        });
        Ok(())
    }

    fn remove_locked(&self, change: &PendingChange, pending: &mut Pending) -> bool {
        let Some(removed) = self.write().remove(change) else {
            return false;
        };
        self.mark_modified();
        if !self.in_window() {
            pending.notices.push(Notice::Removed(removed));
        }
        true
    }

    fn pending(&self) -> Pending {
        Pending {
            listeners: self.listeners.snapshot(),
            notices: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn all(&self) -> Vec<PendingChange> {
        self.read().values()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn by_local_path(&self, local_path: &str) -> Option<PendingChange> {
        self.read().by_local_path(local_path).cloned()
    }

    pub fn by_server_path(&self, server_path: &str) -> Option<PendingChange> {
        self.read().by_server_path(server_path).cloned()
    }

    /// The pending rename whose prior server path is `server_path`.
    pub fn rename_by_source_server_path(&self, server_path: &str) -> Option<PendingChange> {
        self.read().rename_by_source(server_path).cloned()
    }

    pub fn under_server_path(&self, server_path: &str) -> Vec<PendingChange> {
        self.read()
            .under_server_path(server_path)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn under_local_path(&self, local_path: &str) -> Vec<PendingChange> {
        self.read()
            .under_local_path(local_path)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn has_changes_under(&self, local_path: &str) -> bool {
        !self.read().under_local_path(local_path).is_empty()
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn ChangeCacheListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // -----------------------------------------------------------------------
    // Update windows
    // -----------------------------------------------------------------------

    /// Open an update window; only the outermost one notifies.
    pub fn begin_update(&self) {
        let mut pending = self.pending();
        self.open_window(&mut pending);
        pending.deliver();
    }

    /// Close an update window opened with [`ChangeCache::begin_update`].
    pub fn end_update(&self) {
        let mut pending = self.pending();
        self.close_window(&mut pending);
        pending.deliver();
    }

    fn open_window(&self, pending: &mut Pending) {
        let mut window = lock(&self.window);
        if window.depth == 0 {
            window.modified = false;
            pending.notices.push(Notice::BeforeUpdate);
        }
        window.depth += 1;
    }

    fn close_window(&self, pending: &mut Pending) {
        let mut window = lock(&self.window);
        if window.depth == 0 {
            warn!(workspace = %self.workspace, "unbalanced end of pending change update");
            return;
        }
        window.depth -= 1;
        if window.depth == 0 {
            pending.notices.push(Notice::AfterUpdate(window.modified));
        }
    }

    fn in_window(&self) -> bool {
        lock(&self.window).depth > 0
    }

    fn mark_modified(&self) {
        lock(&self.window).modified = true;
    }

    // -----------------------------------------------------------------------
    // Core events
    // -----------------------------------------------------------------------

    fn concerns_me(&self, workspace: Option<&SessionKey>) -> bool {
        workspace == Some(&self.workspace)
    }

    fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::FolderContentChanged { client, .. } => {
                if *client == Some(self.client) {
                    self.refresh_logged("folder content changed");
                }
                return;
            }
            _ if !self.concerns_me(event.workspace()) => return,
            _ => {}
        }

        match event {
            CoreEvent::NewPendingChange { change, .. } => {
                if change.id == 0 {
                    return;
                }
                if change.change_type.is_empty() {
                    self.remove(change);
                } else if let Err(e) = self.add(change.clone()) {
                    warn!(error = %e, "ignoring new pending change");
                }
            }
            CoreEvent::UndonePendingChange { change, .. } => {
                if change.id == 0 {
                    return;
                }
                self.remove(change);
            }
            CoreEvent::Merging { change: Some(change), .. } => {
                if change.id == 0 {
                    return;
                }
                if let Err(e) = self.add(change.clone()) {
                    warn!(error = %e, "ignoring merged pending change");
                }
            }
            CoreEvent::Checkin {
                committed, undone, ..
            } => {
                if committed.is_empty() && undone.is_empty() {
                    return;
                }
                let pending = {
                    let _writer = lock(&self.writer);
                    let mut pending = self.pending();
                    self.open_window(&mut pending);
                    for change in undone.iter().chain(committed.iter()) {
                        self.remove_locked(change, &mut pending);
                    }
                    self.close_window(&mut pending);
                    pending
                };
                pending.deliver();
            }
            CoreEvent::OperationStarted { .. } => self.begin_update(),
            CoreEvent::OperationCompleted { pend_requests, .. } => {
                self.backfill_encodings(pend_requests);
                self.end_update();
            }
            CoreEvent::PendingChangesChanged { .. } => {
                self.refresh_logged("pending changes changed");
            }
            CoreEvent::GetCompleted { source, .. } | CoreEvent::LocalWorkspaceScan { source, .. } => {
                // Internal operations already reported their changes.
                if *source == EventSource::External {
                    self.refresh_logged("external workspace change");
                }
            }
            _ => {}
        }
    }

    /// Pend requests that set an explicit encoding leave the server's pending
    /// change with an "unchanged" encoding; copy the requested one in.
    fn backfill_encodings(&self, requests: &[PendRequest]) {
        let _writer = lock(&self.writer);
        let mut changes = self.write();
        for request in requests.iter().filter(|r| r.is_edit) {
            let Some(encoding) = request.encoding.filter(|e| *e != ENCODING_UNCHANGED) else {
                continue;
            };
            let cached = if request.path.starts_with("$/") {
                changes.by_server_path_mut(&request.path)
            } else {
                changes.by_local_path_mut(&request.path)
            };
            if let Some(change) = cached {
                if change.change_type.contains(ChangeType::ENCODING)
                    && change.encoding == ENCODING_UNCHANGED
                {
                    change.encoding = encoding;
                }
            }
        }
    }

    fn refresh_logged(&self, reason: &str) {
        if let Err(e) = self.refresh() {
            error!(workspace = %self.workspace, reason, error = %e, "error refreshing pending change cache");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PendingChangeCollection> {
        self.changes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PendingChangeCollection> {
        self.changes.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ChangeCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ChangeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCache")
            .field("workspace", &self.workspace)
            .field("len", &self.len())
            .finish()
    }
}

struct EventAdapter {
    cache: Weak<ChangeCache>,
}

impl CoreEventListener for EventAdapter {
    fn on_event(&self, event: &CoreEvent) {
        if let Some(cache) = self.cache.upgrade() {
            cache.handle_event(event);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
