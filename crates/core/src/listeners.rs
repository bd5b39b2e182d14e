//! Ordered listener lists with snapshot dispatch.
//!
//! Every outward-facing notification in the engine (registry, session,
//! change cache, conflict cache, resolution status) goes through a
//! [`ListenerSet`]. Dispatch copies the list before iterating so a listener
//! may subscribe or unsubscribe from inside its own callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by [`ListenerSet::add`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An ordered list of typed callback handles.
pub struct ListenerSet<L: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId::next();
        self.lock().push((id, listener));
        id
    }

    /// Returns `true` if the listener was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Copy of the current list, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock().iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    /// Invoke `f` on every listener registered at the time of the call.
    /// The internal lock is not held while callbacks run.
    pub fn for_each(&self, mut f: impl FnMut(&L)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Arc<L>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    trait Ping: Send + Sync {
        fn ping(&self);
    }

    struct Counter(AtomicUsize);

    impl Ping for Counter {
        fn ping(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_remove_dispatch() {
        let set: ListenerSet<dyn Ping> = ListenerSet::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = set.add(counter.clone());

        set.for_each(|l| l.ping());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.for_each(|l| l.ping());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    struct SelfRemoving {
        set: Arc<ListenerSet<dyn Ping>>,
        id: Mutex<Option<ListenerId>>,
        calls: AtomicUsize,
    }

    impl Ping for SelfRemoving {
        fn ping(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.lock().unwrap().take() {
                self.set.remove(id);
            }
        }
    }

    #[test]
    fn test_listener_can_unsubscribe_during_dispatch() {
        let set: Arc<ListenerSet<dyn Ping>> = Arc::new(ListenerSet::new());
        let listener = Arc::new(SelfRemoving {
            set: set.clone(),
            id: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let other = Arc::new(Counter(AtomicUsize::new(0)));

        let id = set.add(listener.clone());
        *listener.id.lock().unwrap() = Some(id);
        set.add(other.clone());

        set.for_each(|l| l.ping());
        // The snapshot still delivers to every listener present at dispatch.
        assert_eq!(other.0.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);

        set.for_each(|l| l.ping());
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(other.0.load(Ordering::SeqCst), 2);
    }
}
