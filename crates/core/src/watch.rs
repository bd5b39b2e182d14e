//! Local file-system watches.
//!
//! OS integration lives outside the engine; a session only needs to start,
//! stop, and poll a watch per mapped local root. [`NullPathWatcher`] serves
//! batch front ends that never watch and rescan at most once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Result of polling a watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchPoll {
    /// Something under the watched path changed since the last poll.
    pub changed: bool,
    /// The caller should rescan the path instead of trusting `changed`.
    pub rescan: bool,
}

/// A watch on one local path.
pub trait PathWatcher: Send + Sync {
    fn path(&self) -> &str;
    fn start(&self);
    fn stop(&self);
    fn is_watching(&self) -> bool;
    fn poll(&self) -> WatchPoll;
}

/// A watcher that never observes anything. The first poll asks for one
/// rescan; later polls report nothing.
#[derive(Debug)]
pub struct NullPathWatcher {
    path: String,
    watching: AtomicBool,
    scanned: AtomicBool,
}

impl NullPathWatcher {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            watching: AtomicBool::new(false),
            scanned: AtomicBool::new(false),
        }
    }
}

impl PathWatcher for NullPathWatcher {
    fn path(&self) -> &str {
        &self.path
    }

    fn start(&self) {
        self.watching.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.watching.store(false, Ordering::SeqCst);
    }

    fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    fn poll(&self) -> WatchPoll {
        WatchPoll {
            changed: false,
            rescan: !self.scanned.swap(true, Ordering::SeqCst),
        }
    }
}

/// Builds a watcher for a path.
pub type WatcherFactory = Arc<dyn Fn(&str) -> Arc<dyn PathWatcher> + Send + Sync>;

/// The watches owned by one session.
pub struct PathWatchManager {
    factory: WatcherFactory,
    watchers: Mutex<BTreeMap<String, Arc<dyn PathWatcher>>>,
}

impl PathWatchManager {
    pub fn new(factory: WatcherFactory) -> Self {
        Self {
            factory,
            watchers: Mutex::new(BTreeMap::new()),
        }
    }

    /// A manager whose watches are all [`NullPathWatcher`]s.
    pub fn null() -> Self {
        Self::new(Arc::new(|path: &str| -> Arc<dyn PathWatcher> {
            Arc::new(NullPathWatcher::new(path))
        }))
    }

    /// The watcher for `path`, created and started on first use.
    pub fn watcher(&self, path: &str) -> Arc<dyn PathWatcher> {
        let mut watchers = self.lock();
        let watcher = watchers
            .entry(path.to_string())
            .or_insert_with(|| (self.factory)(path));
        if !watcher.is_watching() {
            debug!(path, "starting path watch");
            watcher.start();
        }
        Arc::clone(watcher)
    }

    pub fn poll(&self, path: &str) -> WatchPoll {
        self.watcher(path).poll()
    }

    /// Stop and forget every watch.
    pub fn stop_all(&self) {
        let watchers = std::mem::take(&mut *self.lock());
        for (path, watcher) in watchers {
            debug!(path = %path, "stopping path watch");
            watcher.stop();
        }
    }

    pub fn watched_paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<dyn PathWatcher>>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PathWatchManager {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Debug for PathWatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathWatchManager")
            .field("paths", &self.watched_paths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_watcher_scans_once() {
        let watcher = NullPathWatcher::new("/ws");
        assert_eq!(
            watcher.poll(),
            WatchPoll {
                changed: false,
                rescan: true
            }
        );
        assert_eq!(watcher.poll(), WatchPoll::default());
        assert_eq!(watcher.poll(), WatchPoll::default());
    }

    #[test]
    fn test_manager_starts_and_stops() {
        let manager = PathWatchManager::null();
        let watcher = manager.watcher("/ws");
        assert!(watcher.is_watching());
        assert!(Arc::ptr_eq(&watcher, &manager.watcher("/ws")));
        assert_eq!(manager.watched_paths(), vec!["/ws".to_string()]);

        manager.stop_all();
        assert!(!watcher.is_watching());
        assert!(manager.watched_paths().is_empty());
    }
}
