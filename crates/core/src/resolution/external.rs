//! Resolution through an external three-way merge tool.
//!
//! `resolve_conflict` returns once the tool is launched, with the status at
//! `Running`. The merge engine's completion handler settles the status later,
//! on whatever thread the engine uses. `cancel` and the completion handler
//! race for the in-flight slot; only the winner sets a terminal status.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, instrument, warn};

use super::{ConflictResolution, ConflictResolver, ResolutionStatus, ServerConflictResolver, StatusTracker, WorkOutput};
use crate::config::ConflictConfig;
use crate::conflict::{ConflictId, ConflictRecord, ResolutionOutcome};
use crate::errors::{PreconditionError, ResolutionError};
use crate::merge::{CompletionHandler, MergeCompletion, MergeEngine, MergeProcess, ProcessOutcome};
use crate::session::Session;

const STRATEGY: &str = "external merge";

enum Flight {
    Idle,
    /// `begin_external_merge` has been called but has not returned.
    Launching,
    Running(Arc<dyn MergeProcess>),
    /// Completed or cancelled.
    Done,
}

struct Inner {
    session: Weak<Session>,
    conflict_id: ConflictId,
    engine: Arc<dyn MergeEngine>,
    resolver: Mutex<Arc<dyn ConflictResolver>>,
    tracker: StatusTracker,
    flight: Mutex<Flight>,
    /// Private copy of the record the tool works on.
    working: Mutex<Option<ConflictRecord>>,
}

pub struct ExternalConflictResolution {
    inner: Arc<Inner>,
}

impl ExternalConflictResolution {
    pub fn new(
        session: &Arc<Session>,
        conflict_id: ConflictId,
        engine: Arc<dyn MergeEngine>,
        config: &ConflictConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Arc::downgrade(session),
                conflict_id,
                engine,
                resolver: Mutex::new(Arc::new(ServerConflictResolver)),
                tracker: StatusTracker::new(conflict_id, config.default_failure_message.clone()),
                flight: Mutex::new(Flight::Idle),
                working: Mutex::new(None),
            }),
        }
    }

    /// Replace the resolver applied once the tool produced a merge.
    pub fn with_resolver(self, resolver: Arc<dyn ConflictResolver>) -> Self {
        *lock(&self.inner.resolver) = resolver;
        self
    }

    /// Whether a merge tool is currently running for this conflict.
    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.inner.flight), Flight::Running(_))
    }
}

impl ConflictResolution for ExternalConflictResolution {
    fn conflict_id(&self) -> ConflictId {
        self.inner.conflict_id
    }

    fn session(&self) -> &Weak<Session> {
        &self.inner.session
    }

    fn tracker(&self) -> &StatusTracker {
        &self.inner.tracker
    }

    fn strategy(&self) -> &'static str {
        STRATEGY
    }

    #[instrument(skip_all, fields(conflict_id = %record.id))]
    fn work(
        &self,
        _session: &Arc<Session>,
        record: ConflictRecord,
    ) -> Result<WorkOutput, ResolutionError> {
        {
            let mut flight = lock(&self.inner.flight);
            match *flight {
                Flight::Done => return Err(ResolutionError::AlreadyCompleted),
                Flight::Launching | Flight::Running(_) => return Err(ResolutionError::AlreadyRunning),
                Flight::Idle => *flight = Flight::Launching,
            }
        }
        *lock(&self.inner.working) = Some(record.clone());

        // Running must be set before the engine can complete, which may
        // happen before begin_external_merge returns.
        self.inner.tracker.transition(ResolutionStatus::Running, None);

        let inner = Arc::clone(&self.inner);
        let completion: CompletionHandler = Box::new(move |c| inner.complete(c));

        match self.inner.engine.begin_external_merge(&record, completion) {
            Ok(process) => {
                let cancelled = {
                    let mut flight = lock(&self.inner.flight);
                    if matches!(*flight, Flight::Launching) {
                        debug!(pid = ?process.pid(), "merge tool running");
                        *flight = Flight::Running(Arc::clone(&process));
                        false
                    } else {
                        matches!(*flight, Flight::Done)
                    }
                };
                // Cancelled while launching.
                if cancelled && !process.is_finished() {
                    process.interrupt();
                }
                Ok(WorkOutput::status(ResolutionStatus::Running))
            }
            Err(e) => {
                let mut flight = lock(&self.inner.flight);
                if matches!(*flight, Flight::Launching) {
                    *flight = Flight::Done;
                    return Err(e.into());
                }
                Ok(WorkOutput::status(ResolutionStatus::Running))
            }
        }
    }

    fn cancel(&self) -> bool {
        let process = {
            let mut flight = lock(&self.inner.flight);
            match std::mem::replace(&mut *flight, Flight::Done) {
                Flight::Running(process) => Some(process),
                Flight::Launching => None,
                other => {
                    *flight = other;
                    return false;
                }
            }
        };
        info!(conflict_id = %self.inner.conflict_id, "external merge cancelled");
        self.inner.tracker.transition(ResolutionStatus::Cancelled, None);
        if let Some(process) = process {
            process.interrupt();
        }
        true
    }
}

impl Inner {
    fn complete(&self, completion: MergeCompletion) {
        {
            let mut flight = lock(&self.flight);
            if matches!(*flight, Flight::Done) {
                debug!(conflict_id = %self.conflict_id, outcome = ?completion.outcome, "ignoring completion after cancel");
                return;
            }
            *flight = Flight::Done;
        }
        let (status, message) = self.settle(&completion);
        self.tracker.transition(status, message);
    }

    fn settle(&self, completion: &MergeCompletion) -> (ResolutionStatus, Option<String>) {
        let failed = |message: String| (ResolutionStatus::Failed, Some(message));
        match &completion.outcome {
            ProcessOutcome::LaunchFailed(detail) => {
                return failed(format!("merge tool failed to start: {detail}"));
            }
            ProcessOutcome::Abnormal(detail) => {
                return failed(format!("merge tool exited abnormally: {detail}"));
            }
            ProcessOutcome::Interrupted => return failed("merge tool was interrupted".to_string()),
            ProcessOutcome::Exited { .. } => {}
        }

        let Some(mut working) = lock(&self.working).take() else {
            return failed(PreconditionError::ConflictMissing(self.conflict_id).to_string());
        };
        let accepted = self.engine.end_external_merge(
            completion.process.as_ref(),
            &mut working,
            &completion.state,
            &completion.outcome,
        );
        if !accepted {
            info!(conflict_id = %self.conflict_id, outcome = ?completion.outcome, "merge abandoned");
            return (ResolutionStatus::Cancelled, None);
        }

        let Some(session) = self.session.upgrade() else {
            return failed(PreconditionError::SessionGone.to_string());
        };
        let Some(mut record) = session.conflict_cache().get(self.conflict_id) else {
            return failed(PreconditionError::ConflictMissing(self.conflict_id).to_string());
        };
        // The resolver commits on success; a refusal leaves the cache as it was.
        record.merged_file = working.merged_file;
        record.resolution = ResolutionOutcome::AcceptMerge;

        let resolver = Arc::clone(&*lock(&self.resolver));
        match resolver.resolve(&session, record) {
            Ok(()) => {
                info!(conflict_id = %self.conflict_id, "external merge resolved");
                (ResolutionStatus::Success, None)
            }
            Err(e) => {
                warn!(conflict_id = %self.conflict_id, error = %e, "merged result was not accepted");
                failed(e.to_string())
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
