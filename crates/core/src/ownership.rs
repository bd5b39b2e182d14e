//! Tracing objects back to the session that produced them.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use crate::models::SessionKey;
use crate::session::Session;

/// Bidirectional index between objects and their owning session.
///
/// An object has at most one owner; mapping it again moves it.
#[derive(Clone)]
pub struct ObjectOwnershipMap<T> {
    owners: HashMap<T, SessionKey>,
    sessions: BTreeMap<SessionKey, (Arc<Session>, Vec<T>)>,
}

impl<T: Eq + Hash + Clone> ObjectOwnershipMap<T> {
    pub fn new() -> Self {
        Self {
            owners: HashMap::new(),
            sessions: BTreeMap::new(),
        }
    }

    pub fn add_mappings(&mut self, session: &Arc<Session>, objects: impl IntoIterator<Item = T>) {
        let key = session.key().clone();
        // A reopened session has the same key but a new handle.
        if let Some((owner, _)) = self.sessions.get_mut(&key) {
            if !Arc::ptr_eq(owner, session) {
                *owner = Arc::clone(session);
            }
        }
        for object in objects {
            match self.owners.insert(object.clone(), key.clone()) {
                Some(previous) if previous == key => continue,
                Some(previous) => self.detach(&previous, &object),
                None => {}
            }
            self.sessions
                .entry(key.clone())
                .or_insert_with(|| (Arc::clone(session), Vec::new()))
                .1
                .push(object);
        }
    }

    pub fn owner(&self, object: &T) -> Option<&Arc<Session>> {
        let key = self.owners.get(object)?;
        self.sessions.get(key).map(|(session, _)| session)
    }

    /// Objects owned by `session`, in the order they were mapped.
    pub fn all_for_session(&self, session: &Session) -> &[T] {
        self.sessions
            .get(session.key())
            .map(|(_, objects)| objects.as_slice())
            .unwrap_or(&[])
    }

    /// Every mapped object, grouped by owner.
    pub fn all(&self) -> Vec<T> {
        self.sessions
            .values()
            .flat_map(|(_, objects)| objects.iter().cloned())
            .collect()
    }

    pub fn owners(&self) -> Vec<Arc<Session>> {
        self.sessions
            .values()
            .map(|(session, _)| Arc::clone(session))
            .collect()
    }

    /// A copy restricted to `objects`, keeping each one's owner. Unmapped
    /// objects are skipped.
    pub fn subset_for<'a>(&self, objects: impl IntoIterator<Item = &'a T>) -> Self
    where
        T: 'a,
    {
        let mut subset = Self::new();
        for object in objects {
            if let Some(owner) = self.owner(object) {
                let owner = Arc::clone(owner);
                subset.add_mappings(&owner, [object.clone()]);
            }
        }
        subset
    }

    /// Drop every mapping owned by `session`, returning its objects.
    pub fn remove_session(&mut self, session: &Session) -> Vec<T> {
        let Some((_, objects)) = self.sessions.remove(session.key()) else {
            return Vec::new();
        };
        for object in &objects {
            self.owners.remove(object);
        }
        objects
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    fn detach(&mut self, key: &SessionKey, object: &T) {
        if let Some((_, objects)) = self.sessions.get_mut(key) {
            objects.retain(|o| o != object);
            if objects.is_empty() {
                self.sessions.remove(key);
            }
        }
    }
}

impl<T: Eq + Hash + Clone> Default for ObjectOwnershipMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ObjectOwnershipMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.sessions.iter().map(|(key, (_, objects))| (key, objects)))
            .finish()
    }
}
