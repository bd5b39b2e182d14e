//! The session registry.
//!
//! A client manages at most one session at a time. [`SessionRegistry`]
//! serializes every add, remove, and default change behind one mutex and
//! notifies [`RegistryListener`]s after the mutex is released. Sessions are
//! opened outside the mutex; the insert step re-checks and closes a freshly
//! opened session that lost a race.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::errors::RegistryError;
use crate::listeners::{ListenerId, ListenerSet};
use crate::models::SessionKey;
use crate::session::{Session, Workspace};

/// Structural registry changes. All methods default to no-ops.
///
/// Callbacks must not call back into the registry that raised them.
pub trait RegistryListener: Send + Sync {
    fn on_session_added(&self, _session: &Arc<Session>) {}
    fn on_session_removed(&self, _session: &Arc<Session>) {}
    fn on_default_changed(&self, _session: Option<&Arc<Session>>) {}
}

/// Whether `add` registered the session or already had it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    Added,
    AlreadyManaged,
}

/// Whether `get_or_create` opened a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOrCreateStatus {
    Created,
    Existing,
}

#[derive(Default)]
struct RegistryState {
    sessions: BTreeMap<SessionKey, Arc<Session>>,
    default: Option<SessionKey>,
}

impl RegistryState {
    fn default_session(&self) -> Option<Arc<Session>> {
        self.default
            .as_ref()
            .and_then(|key| self.sessions.get(key))
            .cloned()
    }

    /// The registered session other than `session`, if any.
    fn other_than(&self, session: &Arc<Session>) -> Option<&Arc<Session>> {
        self.sessions.values().find(|s| !Arc::ptr_eq(s, session))
    }
}

enum Notice {
    Added(Arc<Session>),
    Removed(Arc<Session>),
    DefaultChanged(Option<Arc<Session>>),
}

/// Notices recorded under the registry mutex, delivered after it is
/// released to the listeners registered at the time of the mutation.
struct Pending {
    listeners: Vec<Arc<dyn RegistryListener>>,
    notices: Vec<Notice>,
}

impl Pending {
    fn deliver(self) {
        for notice in &self.notices {
            for listener in &self.listeners {
                match notice {
                    Notice::Added(s) => listener.on_session_added(s),
                    Notice::Removed(s) => listener.on_session_removed(s),
                    Notice::DefaultChanged(s) => listener.on_default_changed(s.as_ref()),
                }
            }
        }
    }
}

pub struct SessionRegistry {
    config: SessionConfig,
    state: Mutex<RegistryState>,
    listeners: ListenerSet<dyn RegistryListener>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
            listeners: ListenerSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.lock().sessions.get(key).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn default_session(&self) -> Option<Arc<Session>> {
        self.lock().default_session()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Read the sessions and subscribe without missing a change in between.
    pub fn sessions_and_subscribe(
        &self,
        listener: Arc<dyn RegistryListener>,
    ) -> (Vec<Arc<Session>>, ListenerId) {
        let state = self.lock();
        let id = self.listeners.add(listener);
        (state.sessions.values().cloned().collect(), id)
    }

    /// Read the default session and subscribe without missing a change in
    /// between.
    pub fn default_and_subscribe(
        &self,
        listener: Arc<dyn RegistryListener>,
    ) -> (Option<Arc<Session>>, ListenerId) {
        let state = self.lock();
        let id = self.listeners.add(listener);
        (state.default_session(), id)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Register a session someone else opened.
    ///
    /// Adding the registered session again is a no-op. Adding any other
    /// session while one is registered fails with
    /// [`RegistryError::Conflict`]; the caller still owns the rejected
    /// session and must close it.
    pub fn add(&self, session: Arc<Session>) -> Result<AddStatus, RegistryError> {
        let pending = {
            let mut state = self.lock();
            if state
                .sessions
                .get(session.key())
                .is_some_and(|s| Arc::ptr_eq(s, &session))
            {
                debug!(session = %session.key(), "session already managed");
                return Ok(AddStatus::AlreadyManaged);
            }
            if state.other_than(&session).is_some() {
                warn!(session = %session.key(), "rejecting second session");
                return Err(RegistryError::Conflict {
                    key: session.key().clone(),
                });
            }
            self.insert_locked(&mut state, session)
        };
        pending.deliver();
        Ok(AddStatus::Added)
    }

    /// Return the session for `workspace`, opening one if none is
    /// registered.
    ///
    /// Fails with [`RegistryError::Conflict`] if a session for a different
    /// binding is registered, or with [`RegistryError::Session`] if opening
    /// fails. A session opened here and then rejected is closed before the
    /// error is returned.
    pub fn get_or_create(
        &self,
        workspace: Workspace,
    ) -> Result<(Arc<Session>, GetOrCreateStatus), RegistryError> {
        let key = workspace.binding.key.clone();
        {
            let state = self.lock();
            if let Some(existing) = state.sessions.get(&key) {
                return Ok((Arc::clone(existing), GetOrCreateStatus::Existing));
            }
            if !state.sessions.is_empty() {
                return Err(RegistryError::Conflict { key });
            }
        }

        let session = Session::open(workspace, &self.config)?;

        let pending = {
            let mut state = self.lock();
            if let Some(existing) = state.sessions.get(&key).cloned() {
                drop(state);
                debug!(session = %key, "lost open race, using existing session");
                session.close();
                return Ok((existing, GetOrCreateStatus::Existing));
            }
            if !state.sessions.is_empty() {
                drop(state);
                session.close();
                return Err(RegistryError::Conflict { key });
            }
            self.insert_locked(&mut state, Arc::clone(&session))
        };
        pending.deliver();
        Ok((session, GetOrCreateStatus::Created))
    }

    /// Make `workspace` the default, closing and removing any session for a
    /// different binding. Returns the existing session if it is already the
    /// default.
    pub fn set_default(&self, workspace: Workspace) -> Result<Arc<Session>, RegistryError> {
        if let Some(current) = self.default_session() {
            if current.key() == &workspace.binding.key {
                return Ok(current);
            }
        }
        let session = Session::open(workspace, &self.config)?;
        self.set_default_session(Arc::clone(&session));
        Ok(session)
    }

    /// Make an already opened session the default. Every other registered
    /// session is removed and closed.
    ///
    /// Listeners see `removed` for each replaced session, then `added`, then
    /// one `default_changed`.
    pub fn set_default_session(&self, session: Arc<Session>) {
        let (pending, replaced) = {
            let mut state = self.lock();
            let mut pending = self.pending();

            let managed = state
                .sessions
                .get(session.key())
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if managed {
                if state.default.as_ref() != Some(session.key()) {
                    state.default = Some(session.key().clone());
                    pending.notices.push(Notice::DefaultChanged(Some(Arc::clone(&session))));
                }
                (pending, Vec::new())
            } else {
                let replaced: Vec<Arc<Session>> =
                    std::mem::take(&mut state.sessions).into_values().collect();
                pending
                    .notices
                    .extend(replaced.iter().cloned().map(Notice::Removed));
                state.sessions.insert(session.key().clone(), Arc::clone(&session));
                state.default = Some(session.key().clone());
                pending.notices.push(Notice::Added(Arc::clone(&session)));
                pending.notices.push(Notice::DefaultChanged(Some(Arc::clone(&session))));
                (pending, replaced)
            }
        };

        for old in &replaced {
            info!(session = %old.key(), replacement = %session.key(), "replacing default session");
            old.close();
        }
        pending.deliver();
    }

    /// Unregister `session` without closing it. If it was the default, one
    /// of the remaining sessions (or none) becomes the default.
    pub fn remove(&self, session: &Arc<Session>) -> Result<(), RegistryError> {
        let pending = {
            let mut state = self.lock();
            let managed = state
                .sessions
                .get(session.key())
                .is_some_and(|s| Arc::ptr_eq(s, session));
            if !managed {
                return Err(RegistryError::NotManaged {
                    key: session.key().clone(),
                });
            }

            state.sessions.remove(session.key());
            let mut pending = self.pending();
            pending.notices.push(Notice::Removed(Arc::clone(session)));
            if state.default.as_ref() == Some(session.key()) {
                state.default = state.sessions.keys().next().cloned();
                pending
                    .notices
                    .push(Notice::DefaultChanged(state.default_session()));
            }
            pending
        };
        debug!(session = %session.key(), "session removed");
        pending.deliver();
        Ok(())
    }

    /// Unregister every session without closing them: one `removed` per
    /// session, then a single `default_changed(None)`.
    pub fn remove_all(&self) -> Vec<Arc<Session>> {
        let (pending, removed) = {
            let mut state = self.lock();
            let removed: Vec<Arc<Session>> =
                std::mem::take(&mut state.sessions).into_values().collect();
            state.default = None;

            let mut pending = self.pending();
            pending
                .notices
                .extend(removed.iter().cloned().map(Notice::Removed));
            pending.notices.push(Notice::DefaultChanged(None));
            (pending, removed)
        };
        pending.deliver();
        removed
    }

    fn insert_locked(&self, state: &mut RegistryState, session: Arc<Session>) -> Pending {
        let mut pending = self.pending();
        state.sessions.insert(session.key().clone(), Arc::clone(&session));
        pending.notices.push(Notice::Added(Arc::clone(&session)));
        if state.default.is_none() {
            state.default = Some(session.key().clone());
            pending.notices.push(Notice::DefaultChanged(Some(Arc::clone(&session))));
        }
        info!(session = %session.key(), "session registered");
        pending
    }

    fn pending(&self) -> Pending {
        Pending {
            listeners: self.listeners.snapshot(),
            notices: Vec::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionRegistry")
            .field("sessions", &state.sessions.keys().collect::<Vec<_>>())
            .field("default", &state.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEngine;
    use crate::models::WorkspaceLocation;
    use crate::testing::{self, FakeService};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl RegistryListener for Recorder {
        fn on_session_added(&self, s: &Arc<Session>) {
            self.0.lock().unwrap().push(format!("added:{}", s.key().workspace()));
        }
        fn on_session_removed(&self, s: &Arc<Session>) {
            self.0.lock().unwrap().push(format!("removed:{}", s.key().workspace()));
        }
        fn on_default_changed(&self, s: Option<&Arc<Session>>) {
            let name = s.map(|s| s.key().workspace().to_string());
            self.0
                .lock()
                .unwrap()
                .push(format!("default:{}", name.as_deref().unwrap_or("none")));
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            background_refresh: false,
            refresh_on_open: true,
        }
    }

    fn ws(name: &str) -> Workspace {
        testing::workspace(
            name,
            WorkspaceLocation::Server,
            FakeService::new(),
            Arc::new(EventEngine::new()),
        )
    }

    fn open(name: &str) -> Arc<Session> {
        Session::open(ws(name), &config()).unwrap()
    }

    fn recorded(registry: &SessionRegistry) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone());
        recorder
    }

    fn events(recorder: &Recorder) -> Vec<String> {
        recorder.0.lock().unwrap().clone()
    }

    #[test]
    fn test_add_identical_is_noop() {
        let registry = SessionRegistry::new(config());
        let recorder = recorded(&registry);
        let a = open("a");

        assert_eq!(registry.add(a.clone()).unwrap(), AddStatus::Added);
        assert_eq!(registry.add(a.clone()).unwrap(), AddStatus::AlreadyManaged);
        assert_eq!(events(&recorder), vec!["added:a", "default:a"]);
        assert!(Arc::ptr_eq(&registry.default_session().unwrap(), &a));
    }

    #[test]
    fn test_add_second_session_conflicts() {
        let registry = SessionRegistry::new(config());
        registry.add(open("a")).unwrap();

        let b = open("b");
        assert!(matches!(
            registry.add(b.clone()),
            Err(RegistryError::Conflict { .. })
        ));
        // A different object for the same binding is rejected too.
        assert!(registry.add(open("a")).is_err());
        assert_eq!(registry.len(), 1);
        assert!(!b.is_closed());
    }

    #[test]
    fn test_set_default_replaces_in_order() {
        let registry = SessionRegistry::new(config());
        let a = registry.set_default(ws("a")).unwrap();
        let recorder = recorded(&registry);

        let b = registry.set_default(ws("b")).unwrap();
        assert_eq!(events(&recorder), vec!["removed:a", "added:b", "default:b"]);
        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert_eq!(registry.sessions().len(), 1);
    }

    #[test]
    fn test_set_default_same_binding_returns_existing() {
        let registry = SessionRegistry::new(config());
        let a = registry.set_default(ws("a")).unwrap();
        let recorder = recorded(&registry);

        let again = registry.set_default(ws("A")).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(events(&recorder).is_empty());
    }

    #[test]
    fn test_get_or_create() {
        let registry = SessionRegistry::new(config());
        let (a, status) = registry.get_or_create(ws("a")).unwrap();
        assert_eq!(status, GetOrCreateStatus::Created);

        let (again, status) = registry.get_or_create(ws("a")).unwrap();
        assert_eq!(status, GetOrCreateStatus::Existing);
        assert!(Arc::ptr_eq(&a, &again));

        assert!(matches!(
            registry.get_or_create(ws("b")),
            Err(RegistryError::Conflict { .. })
        ));
    }

    #[test]
    fn test_get_or_create_propagates_open_failure() {
        let registry = SessionRegistry::new(config());
        let service = FakeService::new();
        service
            .fail_changes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let events = Arc::new(EventEngine::new());
        let ws = testing::workspace("a", WorkspaceLocation::Server, service, events.clone());

        assert!(matches!(
            registry.get_or_create(ws),
            Err(RegistryError::Session(_))
        ));
        assert!(registry.is_empty());
        assert_eq!(events.subscriber_count(), 0);
    }

    #[test]
    fn test_remove_and_remove_all() {
        let registry = SessionRegistry::new(config());
        let a = open("a");
        registry.add(a.clone()).unwrap();
        let recorder = recorded(&registry);

        assert!(matches!(
            registry.remove(&open("a")),
            Err(RegistryError::NotManaged { .. })
        ));
        registry.remove(&a).unwrap();
        assert_eq!(events(&recorder), vec!["removed:a", "default:none"]);
        assert!(!a.is_closed());

        registry.add(a.clone()).unwrap();
        recorder.0.lock().unwrap().clear();
        let removed = registry.remove_all();
        assert_eq!(removed.len(), 1);
        assert_eq!(events(&recorder), vec!["removed:a", "default:none"]);
        assert!(registry.default_session().is_none());
    }

    #[test]
    fn test_subscribe_atomically() {
        let registry = SessionRegistry::new(config());
        registry.add(open("a")).unwrap();

        let recorder = Arc::new(Recorder::default());
        let (sessions, id) = registry.sessions_and_subscribe(recorder.clone());
        assert_eq!(sessions.len(), 1);
        assert!(events(&recorder).is_empty());

        let (default, _) = registry.default_and_subscribe(Arc::new(Recorder::default()));
        assert_eq!(default.unwrap().key(), &testing::key("a"));
        assert!(registry.remove_listener(id));
    }
}
