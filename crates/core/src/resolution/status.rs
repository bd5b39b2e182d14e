//! Resolution status and its transitions.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::conflict::ConflictId;
use crate::listeners::{ListenerId, ListenerSet};

/// Where a resolution is in its life cycle.
///
/// `NotStarted -> Running? -> terminal`. Only asynchronous strategies pass
/// through `Running`; nothing leaves a terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    #[default]
    NotStarted,
    Running,
    Failed,
    Cancelled,
    Success,
    SucceededWithConflicts,
}

impl ResolutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Success => "success",
            Self::SucceededWithConflicts => "succeeded_with_conflicts",
        };
        f.write_str(s)
    }
}

/// A status transition, as delivered to listeners and channel subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub conflict_id: ConflictId,
    pub previous: ResolutionStatus,
    pub status: ResolutionStatus,
    pub message: Option<String>,
}

pub trait ResolutionStatusListener: Send + Sync {
    fn on_status_changed(&self, change: &StatusChange);
}

#[derive(Debug, Default)]
struct TrackerState {
    started: bool,
    status: ResolutionStatus,
    message: Option<String>,
}

const CHANNEL_CAPACITY: usize = 16;

/// Owns a resolution's status. Every transition goes through one mutex, so
/// at most one caller moves the status out of `Running`.
pub struct StatusTracker {
    conflict_id: ConflictId,
    default_message: String,
    state: Mutex<TrackerState>,
    listeners: ListenerSet<dyn ResolutionStatusListener>,
    sender: broadcast::Sender<StatusChange>,
}

impl StatusTracker {
    pub fn new(conflict_id: ConflictId, default_message: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            conflict_id,
            default_message: default_message.into(),
            state: Mutex::new(TrackerState::default()),
            listeners: ListenerSet::new(),
            sender,
        }
    }

    pub fn status(&self) -> ResolutionStatus {
        self.lock().status
    }

    /// Message captured with a `Failed` or `SucceededWithConflicts` status.
    pub fn message(&self) -> Option<String> {
        self.lock().message.clone()
    }

    /// Claim the single start of the resolution. Only the first caller gets
    /// `true`.
    pub fn try_start(&self) -> bool {
        let mut state = self.lock();
        if state.started || state.status != ResolutionStatus::NotStarted {
            return false;
        }
        state.started = true;
        true
    }

    /// Move to `status`. Returns `false`, changing nothing, when the current
    /// status is terminal, equal to `status`, or `status` is `NotStarted`.
    ///
    /// Failures without a message get the default failure message.
    pub fn transition(&self, status: ResolutionStatus, message: Option<String>) -> bool {
        let change = {
            let mut state = self.lock();
            let previous = state.status;
            if previous.is_terminal() || previous == status || status == ResolutionStatus::NotStarted {
                trace!(conflict_id = %self.conflict_id, %previous, %status, "ignoring status transition");
                return false;
            }
            state.status = status;
            state.message = match status {
                ResolutionStatus::Failed => Some(message.unwrap_or_else(|| self.default_message.clone())),
                ResolutionStatus::SucceededWithConflicts | ResolutionStatus::Cancelled => message,
                _ => None,
            };
            StatusChange {
                conflict_id: self.conflict_id,
                previous,
                status,
                message: state.message.clone(),
            }
        };

        debug!(conflict_id = %self.conflict_id, previous = %change.previous, status = %change.status, "resolution status changed");
        self.listeners.for_each(|l| l.on_status_changed(&change));
        // No receivers is fine.
        let _ = self.sender.send(change);
        true
    }

    pub fn add_listener(&self, listener: Arc<dyn ResolutionStatusListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Receive status changes over a channel, for observers on another
    /// thread or task.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.sender.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("conflict_id", &self.conflict_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResolutionStatus::*;

    #[derive(Default)]
    struct Seen(Mutex<Vec<ResolutionStatus>>);

    impl ResolutionStatusListener for Seen {
        fn on_status_changed(&self, change: &StatusChange) {
            self.0.lock().unwrap().push(change.status);
        }
    }

    fn tracker() -> StatusTracker {
        StatusTracker::new(ConflictId(1), "conflicting content changes")
    }

    #[test]
    fn test_terminal_states() {
        assert!(!NotStarted.is_terminal());
        assert!(!Running.is_terminal());
        for status in [Failed, Cancelled, Success, SucceededWithConflicts] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let t = tracker();
        let seen = Arc::new(Seen::default());
        t.add_listener(seen.clone());

        assert!(t.transition(Running, None));
        assert!(!t.transition(Running, None));
        assert!(t.transition(Cancelled, None));
        assert!(!t.transition(Success, None));
        assert!(!t.transition(Failed, Some("late".into())));

        assert_eq!(*seen.0.lock().unwrap(), vec![Running, Cancelled]);
        assert_eq!(t.status(), Cancelled);
        assert!(t.message().is_none());
    }

    #[test]
    fn test_failure_message_defaults() {
        let t = tracker();
        t.transition(Failed, None);
        assert_eq!(t.message().as_deref(), Some("conflicting content changes"));

        let t = tracker();
        t.transition(Failed, Some("server refused".into()));
        assert_eq!(t.message().as_deref(), Some("server refused"));
    }

    #[test]
    fn test_listener_may_unsubscribe_during_dispatch() {
        struct Once {
            tracker: Arc<StatusTracker>,
            id: Mutex<Option<ListenerId>>,
        }
        impl ResolutionStatusListener for Once {
            fn on_status_changed(&self, _change: &StatusChange) {
                if let Some(id) = self.id.lock().unwrap().take() {
                    self.tracker.remove_listener(id);
                }
            }
        }

        let t = Arc::new(tracker());
        let once = Arc::new(Once {
            tracker: t.clone(),
            id: Mutex::new(None),
        });
        let id = t.add_listener(once.clone());
        *once.id.lock().unwrap() = Some(id);

        t.transition(Running, None);
        assert!(!t.remove_listener(id));
    }

    #[test]
    fn test_start_claimed_once() {
        let t = Arc::new(tracker());
        let winners: usize = (0..8)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || t.try_start())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert_eq!(t.status(), NotStarted);
    }

    #[tokio::test]
    async fn test_channel_delivery() {
        let t = tracker();
        let mut rx = t.subscribe();
        t.transition(Success, None);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.previous, NotStarted);
        assert_eq!(change.status, Success);
    }

    #[test]
    fn test_change_serializes_for_observers() {
        let change = StatusChange {
            conflict_id: ConflictId(12),
            previous: Running,
            status: SucceededWithConflicts,
            message: Some("1 conflict(s) could not be automerged".into()),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["conflict_id"], 12);
        assert_eq!(json["previous"], "running");
        assert_eq!(json["status"], "succeeded_with_conflicts");
    }
}
