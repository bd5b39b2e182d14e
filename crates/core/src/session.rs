//! A bound local/server workspace and its reconciliation caches.
//!
//! A [`Session`] owns the pending-change, conflict, and annotation caches of
//! one workspace binding, the watches on its local root, and a subscription
//! to the event engine that it translates into [`SessionUpdate`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{AnnotationCache, ChangeCache};
use crate::config::SessionConfig;
use crate::conflict::ConflictCache;
use crate::errors::{ChangeCacheError, RefreshStep, SessionError};
use crate::events::{CoreEvent, CoreEventListener, EventEngine};
use crate::listeners::{ListenerId, ListenerSet};
use crate::models::{ClientId, EventSource, SessionKey, WorkspaceBinding, WorkspaceLocation};
use crate::service::VersionControlService;
use crate::watch::PathWatchManager;

// ---------------------------------------------------------------------------
// Construction inputs
// ---------------------------------------------------------------------------

/// Everything a session binds to.
pub struct Workspace {
    pub binding: WorkspaceBinding,
    pub service: Arc<dyn VersionControlService>,
    pub events: Arc<EventEngine>,
    pub watches: PathWatchManager,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Server-originated events that concern this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    WorkspaceUpdated,
    FolderContentChanged { changeset: Option<i64> },
    GetCompleted { source: EventSource },
    LocalWorkspaceScan { source: EventSource },
}

pub trait SessionListener: Send + Sync {
    fn on_session_update(&self, session: &SessionKey, update: &SessionUpdate);
}

/// Progress of a refresh. Full refreshes report three steps, local ones one.
pub trait RefreshProgress: Send + Sync {
    fn begin(&self, _total_steps: usize) {}
    fn step_completed(&self, _step: RefreshStep) {}
}

/// Progress sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl RefreshProgress for NoProgress {}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Changes, conflicts, then annotations from the server.
    Full,
    /// Pending changes only, for local workspaces.
    Local,
}

/// How a refresh request was handled.
#[derive(Debug)]
pub enum RefreshOutcome {
    Completed,
    /// Local refresh of a server workspace: nothing to rescan.
    Skipped,
    /// Running on a blocking worker. Failures land in
    /// [`Session::last_refresh_error`].
    Scheduled(JoinHandle<()>),
}

/// The most recent refresh failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshFailure {
    pub step: RefreshStep,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    binding: WorkspaceBinding,
    service: Arc<dyn VersionControlService>,
    events: Arc<EventEngine>,
    config: SessionConfig,
    changes: Arc<ChangeCache>,
    conflicts: ConflictCache,
    annotations: AnnotationCache,
    watches: PathWatchManager,
    listeners: ListenerSet<dyn SessionListener>,
    subscription: Mutex<Option<ListenerId>>,
    last_error: Mutex<Option<RefreshFailure>>,
    closed: AtomicBool,
}

impl Session {
    /// Bind a workspace, subscribe to its events, and run the initial
    /// refresh.
    ///
    /// A synchronous initial refresh that fails closes the session before
    /// the error is returned.
    #[instrument(skip_all, fields(session = %workspace.binding.key))]
    pub fn open(workspace: Workspace, config: &SessionConfig) -> Result<Arc<Self>, SessionError> {
        let Workspace {
            binding,
            service,
            events,
            watches,
        } = workspace;

        let changes = Arc::new(ChangeCache::new(
            binding.key.clone(),
            binding.client,
            Arc::clone(&service),
        ));
        changes.attach(&events);

        let session = Arc::new(Self {
            conflicts: ConflictCache::new(Arc::clone(&service)),
            annotations: AnnotationCache::new(Arc::clone(&service)),
            binding,
            service,
            events,
            config: config.clone(),
            changes,
            watches,
            listeners: ListenerSet::new(),
            subscription: Mutex::new(None),
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        session.watches.watcher(&session.binding.local_root);
        let adapter = Arc::new(SessionEventAdapter {
            session: Arc::downgrade(&session),
            key: session.binding.key.clone(),
            client: session.binding.client,
        });
        *lock(&session.subscription) = Some(session.events.subscribe(adapter));

        if config.refresh_on_open {
            let mode = if session.binding.prefers_full_refresh() {
                RefreshMode::Full
            } else {
                RefreshMode::Local
            };
            if let Err(e) = session.dispatch(mode, config.background_refresh) {
                session.close();
                return Err(e);
            }
        }

        info!(location = ?session.binding.location, "session opened");
        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.binding.key
    }

    pub fn binding(&self) -> &WorkspaceBinding {
        &self.binding
    }

    pub fn client(&self) -> ClientId {
        self.binding.client
    }

    pub fn service(&self) -> &Arc<dyn VersionControlService> {
        &self.service
    }

    pub fn events(&self) -> &Arc<EventEngine> {
        &self.events
    }

    pub fn change_cache(&self) -> &Arc<ChangeCache> {
        &self.changes
    }

    pub fn conflict_cache(&self) -> &ConflictCache {
        &self.conflicts
    }

    pub fn annotation_cache(&self) -> &AnnotationCache {
        &self.annotations
    }

    pub fn watches(&self) -> &PathWatchManager {
        &self.watches
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The last refresh failure not yet cleared by a successful refresh.
    pub fn last_refresh_error(&self) -> Option<RefreshFailure> {
        lock(&self.last_error).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Full refresh. With `asynchronous` set and a tokio runtime available
    /// the work runs on a blocking worker and this returns immediately.
    pub fn refresh(self: &Arc<Self>, asynchronous: bool) -> Result<RefreshOutcome, SessionError> {
        self.dispatch(RefreshMode::Full, asynchronous)
    }

    /// Refresh the pending changes of a local workspace.
    pub fn refresh_local(
        self: &Arc<Self>,
        asynchronous: bool,
    ) -> Result<RefreshOutcome, SessionError> {
        self.dispatch(RefreshMode::Local, asynchronous)
    }

    /// Synchronous full refresh with progress reporting.
    pub fn refresh_with_progress(&self, progress: &dyn RefreshProgress) -> Result<(), SessionError> {
        self.run_refresh(RefreshMode::Full, progress)
    }

    fn dispatch(
        self: &Arc<Self>,
        mode: RefreshMode,
        asynchronous: bool,
    ) -> Result<RefreshOutcome, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.key().clone()));
        }
        if mode == RefreshMode::Local && self.binding.location != WorkspaceLocation::Local {
            debug!(session = %self.key(), "server workspace has nothing to rescan locally");
            return Ok(RefreshOutcome::Skipped);
        }

        if asynchronous {
            match Handle::try_current() {
                Ok(handle) => {
                    let session = Arc::clone(self);
                    let task = handle.spawn_blocking(move || {
                        // Failures are recorded in the last-error slot.
                        let _ = session.run_refresh(mode, &NoProgress);
                    });
                    return Ok(RefreshOutcome::Scheduled(task));
                }
                Err(_) => {
                    debug!(session = %self.key(), "no tokio runtime, refreshing inline");
                }
            }
        }

        self.run_refresh(mode, &NoProgress)?;
        Ok(RefreshOutcome::Completed)
    }

    #[instrument(skip(self, progress), fields(session = %self.binding.key))]
    fn run_refresh(&self, mode: RefreshMode, progress: &dyn RefreshProgress) -> Result<(), SessionError> {
        let result = match mode {
            RefreshMode::Full => self.refresh_full(progress),
            RefreshMode::Local => self.refresh_changes(progress),
        };

        match &result {
            Ok(()) => {
                lock(&self.last_error).take();
                debug!(?mode, "session refresh complete");
            }
            Err(e) => {
                let step = match e {
                    SessionError::Refresh { step, .. } => *step,
                    _ => RefreshStep::Changes,
                };
                error!(?mode, %step, error = %e, "session refresh failed");
                *lock(&self.last_error) = Some(RefreshFailure {
                    step,
                    message: e.to_string(),
                    at: Utc::now(),
                });
            }
        }
        result
    }

    fn refresh_full(&self, progress: &dyn RefreshProgress) -> Result<(), SessionError> {
        progress.begin(3);
        self.refresh_step_changes()?;
        progress.step_completed(RefreshStep::Changes);

        self.conflicts.refresh().map_err(|source| SessionError::Refresh {
            step: RefreshStep::Conflicts,
            source,
        })?;
        progress.step_completed(RefreshStep::Conflicts);

        self.annotations
            .refresh()
            .map_err(|source| SessionError::Refresh {
                step: RefreshStep::Annotations,
                source,
            })?;
        progress.step_completed(RefreshStep::Annotations);
        Ok(())
    }

    fn refresh_changes(&self, progress: &dyn RefreshProgress) -> Result<(), SessionError> {
        progress.begin(1);
        self.refresh_step_changes()?;
        progress.step_completed(RefreshStep::Changes);
        Ok(())
    }

    fn refresh_step_changes(&self) -> Result<(), SessionError> {
        match self.changes.refresh() {
            Ok(_) => Ok(()),
            Err(ChangeCacheError::Service(source)) => Err(SessionError::Refresh {
                step: RefreshStep::Changes,
                source,
            }),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop every watch and drop every event subscription. Safe to call more
    /// than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watches.stop_all();
        if let Some(id) = lock(&self.subscription).take() {
            self.events.unsubscribe(id);
        }
        self.changes.dispose();
        self.listeners.clear();
        info!(session = %self.key(), "session closed");
    }

    fn forward(&self, update: SessionUpdate) {
        if self.is_closed() {
            warn!(session = %self.key(), ?update, "dropping update for closed session");
            return;
        }
        self.listeners
            .for_each(|l| l.on_session_update(&self.binding.key, &update));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.binding.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Translates the four session-level event kinds, dropping events for
/// other workspaces or clients.
struct SessionEventAdapter {
    session: Weak<Session>,
    key: SessionKey,
    client: ClientId,
}

impl SessionEventAdapter {
    fn translate(&self, event: &CoreEvent) -> Option<SessionUpdate> {
        match event {
            CoreEvent::WorkspaceUpdated { workspace } if *workspace == self.key => {
                Some(SessionUpdate::WorkspaceUpdated)
            }
            CoreEvent::FolderContentChanged { client, changeset } if *client == Some(self.client) => {
                Some(SessionUpdate::FolderContentChanged {
                    changeset: *changeset,
                })
            }
            CoreEvent::GetCompleted { workspace, source } if *workspace == self.key => {
                Some(SessionUpdate::GetCompleted { source: *source })
            }
            CoreEvent::LocalWorkspaceScan { workspace, source } if *workspace == self.key => {
                Some(SessionUpdate::LocalWorkspaceScan { source: *source })
            }
            _ => None,
        }
    }
}

impl CoreEventListener for SessionEventAdapter {
    fn on_event(&self, event: &CoreEvent) {
        let Some(update) = self.translate(event) else {
            return;
        };
        if let Some(session) = self.session.upgrade() {
            session.forward(update);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
