//! Conflict resolution strategies.
//!
//! Every strategy implements [`ConflictResolution`]. The provided
//! [`ConflictResolution::resolve_conflict`] checks that the session and the
//! conflict still exist, runs the strategy's `work` on a copy of the record,
//! and turns any error into a `Failed` status with a message. Errors from
//! `work` never escape `resolve_conflict`.
//!
//! Strategies:
//! - [`CoreConflictResolution`]: one server-side resolve.
//! - [`WriteConflictResolution`]: two-phase delete/retry automerge for
//!   files made writable outside the client.
//! - [`ExternalConflictResolution`]: asynchronous external merge tool.

pub mod direct;
pub mod external;
pub mod resolver;
pub mod status;
pub mod write_conflict;

use std::sync::{Arc, Weak};

use tokio::sync::broadcast;
use tracing::{instrument, warn};

use crate::conflict::{ConflictId, ConflictRecord};
use crate::errors::{PreconditionError, ResolutionError};
use crate::listeners::ListenerId;
use crate::session::Session;

pub use direct::{CoreConflictResolution, CoreOptions};
pub use external::ExternalConflictResolution;
pub use resolver::{ConflictResolver, ServerConflictResolver};
pub use status::{ResolutionStatus, ResolutionStatusListener, StatusChange, StatusTracker};
pub use write_conflict::WriteConflictResolution;

/// What a strategy's `work` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOutput {
    pub status: ResolutionStatus,
    pub message: Option<String>,
}

impl WorkOutput {
    pub fn status(status: ResolutionStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    /// A failure; `None` falls back to the default failure message.
    pub fn failed(message: Option<String>) -> Self {
        Self {
            status: ResolutionStatus::Failed,
            message,
        }
    }
}

pub trait ConflictResolution: Send + Sync {
    fn conflict_id(&self) -> ConflictId;

    fn session(&self) -> &Weak<Session>;

    fn tracker(&self) -> &StatusTracker;

    /// Short name used in logs and errors.
    fn strategy(&self) -> &'static str;

    /// Strategy body. `record` is a private copy of the cached conflict.
    fn work(
        &self,
        session: &Arc<Session>,
        record: ConflictRecord,
    ) -> Result<WorkOutput, ResolutionError>;

    /// Run the resolution once. Returns the status after `work`; for an
    /// asynchronous strategy that is normally `Running`.
    #[instrument(skip(self), fields(conflict_id = %self.conflict_id(), strategy = self.strategy()))]
    fn resolve_conflict(&self) -> Result<ResolutionStatus, PreconditionError> {
        let session = self.session().upgrade().ok_or(PreconditionError::SessionGone)?;
        let id = self.conflict_id();
        let record = session
            .conflict_cache()
            .get(id)
            .ok_or(PreconditionError::ConflictMissing(id))?;
        if !self.tracker().try_start() {
            return Err(PreconditionError::AlreadyStarted);
        }

        let output = match self.work(&session, record) {
            Ok(output) => output,
            Err(ResolutionError::AlreadyRunning | ResolutionError::AlreadyCompleted) => {
                return Err(PreconditionError::AlreadyStarted);
            }
            Err(e) => {
                warn!(error = %e, "conflict resolution failed");
                WorkOutput::failed(Some(e.to_string()))
            }
        };
        self.tracker().transition(output.status, output.message);
        Ok(self.status())
    }

    fn status(&self) -> ResolutionStatus {
        self.tracker().status()
    }

    /// Failure (or residual-conflict) message, once terminal.
    fn message(&self) -> Option<String> {
        self.tracker().message()
    }

    /// Interrupt an in-flight asynchronous resolution. Returns whether this
    /// call cancelled it; synchronous strategies always return `false`.
    fn cancel(&self) -> bool {
        false
    }

    fn add_status_listener(&self, listener: Arc<dyn ResolutionStatusListener>) -> ListenerId {
        self.tracker().add_listener(listener)
    }

    fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.tracker().remove_listener(id)
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.tracker().subscribe()
    }
}
