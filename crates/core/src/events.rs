//! Version-control event engine.
//!
//! Collaborators (the service client, the local scanner, get/checkin
//! engines) fire [`CoreEvent`]s into an [`EventEngine`]; sessions and their
//! caches subscribe to it. Delivery is synchronous on the firing thread.

use std::sync::Arc;

use tracing::trace;

use crate::listeners::{ListenerId, ListenerSet};
use crate::models::{ClientId, EventSource, PendingChange, SessionKey};

/// A pend operation that completed, as reported by `OperationCompleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendRequest {
    /// Server or local path the request targeted.
    pub path: String,
    pub is_edit: bool,
    /// Encoding the request asked for, if any.
    pub encoding: Option<i32>,
}

/// Events raised by the version-control layer.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Binding metadata (working folders, owner, comment) changed.
    WorkspaceUpdated { workspace: SessionKey },
    /// Server folder content changed; scoped to a client, not a workspace.
    FolderContentChanged {
        client: Option<ClientId>,
        changeset: Option<i64>,
    },
    /// A get finished.
    GetCompleted {
        workspace: SessionKey,
        source: EventSource,
    },
    /// A local-workspace scan detected changes.
    LocalWorkspaceScan {
        workspace: SessionKey,
        source: EventSource,
    },
    /// The server recorded a new or updated pending change.
    NewPendingChange {
        workspace: SessionKey,
        change: PendingChange,
    },
    /// A pending change was undone.
    UndonePendingChange {
        workspace: SessionKey,
        change: PendingChange,
    },
    /// A merge touched a pending change.
    Merging {
        workspace: SessionKey,
        change: Option<PendingChange>,
    },
    /// A checkin committed or undid pending changes.
    Checkin {
        workspace: SessionKey,
        committed: Vec<PendingChange>,
        undone: Vec<PendingChange>,
    },
    /// A multi-item operation is starting.
    OperationStarted { workspace: SessionKey },
    /// A multi-item operation finished.
    OperationCompleted {
        workspace: SessionKey,
        pend_requests: Vec<PendRequest>,
    },
    /// The server's pending-change set changed wholesale.
    PendingChangesChanged { workspace: SessionKey },
}

impl CoreEvent {
    /// The workspace this event concerns, if it is workspace-scoped.
    pub fn workspace(&self) -> Option<&SessionKey> {
        match self {
            Self::FolderContentChanged { .. } => None,
            Self::WorkspaceUpdated { workspace }
            | Self::GetCompleted { workspace, .. }
            | Self::LocalWorkspaceScan { workspace, .. }
            | Self::NewPendingChange { workspace, .. }
            | Self::UndonePendingChange { workspace, .. }
            | Self::Merging { workspace, .. }
            | Self::Checkin { workspace, .. }
            | Self::OperationStarted { workspace }
            | Self::OperationCompleted { workspace, .. }
            | Self::PendingChangesChanged { workspace } => Some(workspace),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::WorkspaceUpdated { .. } => "workspace_updated",
            Self::FolderContentChanged { .. } => "folder_content_changed",
            Self::GetCompleted { .. } => "get_completed",
            Self::LocalWorkspaceScan { .. } => "local_workspace_scan",
            Self::NewPendingChange { .. } => "new_pending_change",
            Self::UndonePendingChange { .. } => "undone_pending_change",
            Self::Merging { .. } => "merging",
            Self::Checkin { .. } => "checkin",
            Self::OperationStarted { .. } => "operation_started",
            Self::OperationCompleted { .. } => "operation_completed",
            Self::PendingChangesChanged { .. } => "pending_changes_changed",
        }
    }
}

/// Receiver of [`CoreEvent`]s.
pub trait CoreEventListener: Send + Sync {
    fn on_event(&self, event: &CoreEvent);
}

/// Fan-out point for version-control events.
#[derive(Debug, Default)]
pub struct EventEngine {
    listeners: ListenerSet<dyn CoreEventListener>,
}

impl EventEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn CoreEventListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn fire(&self, event: CoreEvent) {
        trace!(event = event.name(), "dispatching core event");
        self.listeners.for_each(|l| l.on_event(&event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl CoreEventListener for Recorder {
        fn on_event(&self, event: &CoreEvent) {
            self.0.lock().unwrap().push(event.name());
        }
    }

    #[test]
    fn test_fire_and_unsubscribe() {
        let engine = EventEngine::new();
        let recorder = Arc::new(Recorder::default());
        let id = engine.subscribe(recorder.clone());

        let ws = SessionKey::new("https://tfs", "ws");
        engine.fire(CoreEvent::OperationStarted { workspace: ws.clone() });
        assert!(engine.unsubscribe(id));
        engine.fire(CoreEvent::OperationStarted { workspace: ws });

        assert_eq!(*recorder.0.lock().unwrap(), vec!["operation_started"]);
        assert_eq!(engine.subscriber_count(), 0);
    }

    #[test]
    fn test_folder_content_is_not_workspace_scoped() {
        let event = CoreEvent::FolderContentChanged {
            client: None,
            changeset: Some(12),
        };
        assert!(event.workspace().is_none());
    }
}
