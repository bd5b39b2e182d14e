//! Resolution by a single server-side resolve.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

use super::{ConflictResolution, ResolutionStatus, StatusTracker, WorkOutput};
use crate::config::ConflictConfig;
use crate::conflict::{ConflictId, ConflictRecord, ResolutionOutcome};
use crate::errors::ResolutionError;
use crate::session::Session;

const STRATEGY: &str = "server resolution";

/// Which optional settings a [`CoreConflictResolution`] accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreOptions {
    pub allow_rename: bool,
    pub allow_encoding: bool,
}

#[derive(Debug, Default)]
struct Requested {
    new_path: Option<String>,
    encoding: Option<i32>,
}

/// Asks the server to apply one [`ResolutionOutcome`].
pub struct CoreConflictResolution {
    session: Weak<Session>,
    conflict_id: ConflictId,
    outcome: ResolutionOutcome,
    options: CoreOptions,
    requested: Mutex<Requested>,
    tracker: StatusTracker,
}

impl CoreConflictResolution {
    pub fn new(
        session: &Arc<Session>,
        conflict_id: ConflictId,
        outcome: ResolutionOutcome,
        options: CoreOptions,
        config: &ConflictConfig,
    ) -> Self {
        Self {
            session: Arc::downgrade(session),
            conflict_id,
            outcome,
            options,
            requested: Mutex::new(Requested::default()),
            tracker: StatusTracker::new(conflict_id, config.default_failure_message.clone()),
        }
    }

    pub fn outcome(&self) -> ResolutionOutcome {
        self.outcome
    }

    /// Resolve to a new server path. Fails unless renames were allowed.
    pub fn set_new_path(&self, path: impl Into<String>) -> Result<(), ResolutionError> {
        if !self.options.allow_rename {
            return Err(ResolutionError::UnsupportedOption {
                strategy: STRATEGY,
                option: "a new path",
            });
        }
        self.lock().new_path = Some(path.into());
        Ok(())
    }

    /// Resolve with an explicit encoding. Fails unless encodings were
    /// allowed.
    pub fn set_encoding(&self, encoding: i32) -> Result<(), ResolutionError> {
        if !self.options.allow_encoding {
            return Err(ResolutionError::UnsupportedOption {
                strategy: STRATEGY,
                option: "an encoding",
            });
        }
        self.lock().encoding = Some(encoding);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Requested> {
        self.requested.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConflictResolution for CoreConflictResolution {
    fn conflict_id(&self) -> ConflictId {
        self.conflict_id
    }

    fn session(&self) -> &Weak<Session> {
        &self.session
    }

    fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    fn strategy(&self) -> &'static str {
        STRATEGY
    }

    fn work(
        &self,
        session: &Arc<Session>,
        mut record: ConflictRecord,
    ) -> Result<WorkOutput, ResolutionError> {
        record.resolution = self.outcome;
        {
            let requested = self.lock();
            if let Some(path) = &requested.new_path {
                record.new_path = Some(path.clone());
            }
            if let Some(encoding) = requested.encoding {
                record.encoding = Some(encoding);
            }
        }

        session.service().resolve_conflict(&mut record)?;

        if !record.resolved {
            // Typically a failed automerge; the summary says why.
            let message = record
                .merge_summary
                .filter(|s| s.has_conflicting_content())
                .map(|s| format!("{} conflicting content change(s)", s.conflicting));
            debug!(conflict_id = %record.id, ?message, "server left conflict unresolved");
            record.resolution = ResolutionOutcome::Unresolved;
            session.conflict_cache().commit(record);
            return Ok(WorkOutput::failed(message));
        }

        info!(conflict_id = %record.id, outcome = %self.outcome, "conflict resolved");
        session.conflict_cache().commit(record);
        Ok(WorkOutput::status(ResolutionStatus::Success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::errors::PreconditionError;
    use crate::events::EventEngine;
    use crate::models::WorkspaceLocation;
    use crate::testing::{self, FakeService};

    fn session_with(service: &Arc<FakeService>) -> Arc<Session> {
        service.conflicts.lock().unwrap().push(testing::conflict(1, "/a/f.txt"));
        let ws = testing::workspace(
            "ws",
            WorkspaceLocation::Server,
            Arc::clone(service),
            Arc::new(EventEngine::new()),
        );
        let config = SessionConfig {
            background_refresh: false,
            refresh_on_open: true,
        };
        Session::open(ws, &config).unwrap()
    }

    fn resolution(session: &Arc<Session>, options: CoreOptions) -> CoreConflictResolution {
        CoreConflictResolution::new(
            session,
            ConflictId(1),
            ResolutionOutcome::AcceptTheirs,
            options,
            &ConflictConfig::default(),
        )
    }

    #[test]
    fn test_success_removes_conflict() {
        let service = FakeService::new();
        let session = session_with(&service);
        let r = resolution(&session, CoreOptions::default());

        assert_eq!(r.resolve_conflict().unwrap(), ResolutionStatus::Success);
        assert!(session.conflict_cache().is_empty());
        assert_eq!(
            *service.resolved.lock().unwrap(),
            vec![(ConflictId(1), ResolutionOutcome::AcceptTheirs)]
        );
        assert!(r.message().is_none());
    }

    #[test]
    fn test_unresolved_captures_content_message() {
        let service = FakeService::new();
        service.unresolvable.lock().unwrap().insert(ConflictId(1));
        let session = session_with(&service);
        let r = resolution(&session, CoreOptions::default());

        assert_eq!(r.resolve_conflict().unwrap(), ResolutionStatus::Failed);
        assert_eq!(r.message().as_deref(), Some("1 conflicting content change(s)"));
        let cached = session.conflict_cache().get(ConflictId(1)).unwrap();
        assert_eq!(cached.resolution, ResolutionOutcome::Unresolved);
    }

    #[test]
    fn test_service_error_becomes_failure() {
        let service = FakeService::new();
        let session = session_with(&service);
        *service.resolve_error.lock().unwrap() = Some("item locked".into());
        let r = resolution(&session, CoreOptions::default());

        assert_eq!(r.resolve_conflict().unwrap(), ResolutionStatus::Failed);
        assert!(r.message().unwrap().contains("item locked"));
        assert!(matches!(r.resolve_conflict(), Err(PreconditionError::AlreadyStarted)));
    }

    #[test]
    fn test_concurrent_calls_resolve_once() {
        let service = FakeService::new();
        let session = session_with(&service);
        *service.resolve_delay.lock().unwrap() = Some(std::time::Duration::from_millis(100));
        let r = resolution(&session, CoreOptions::default());

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2).map(|_| s.spawn(|| r.resolve_conflict())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.contains(&Ok(ResolutionStatus::Success)));
        assert!(results.contains(&Err(PreconditionError::AlreadyStarted)));
        assert_eq!(service.resolved.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_options_need_capability() {
        let service = FakeService::new();
        let session = session_with(&service);

        let r = resolution(&session, CoreOptions::default());
        assert!(r.set_new_path("$/proj/renamed.txt").is_err());
        assert!(r.set_encoding(65001).is_err());

        let r = resolution(
            &session,
            CoreOptions {
                allow_rename: true,
                allow_encoding: true,
            },
        );
        r.set_new_path("$/proj/renamed.txt").unwrap();
        r.set_encoding(65001).unwrap();
        assert_eq!(r.resolve_conflict().unwrap(), ResolutionStatus::Success);
    }

    #[test]
    fn test_preconditions() {
        let service = FakeService::new();
        let session = session_with(&service);
        let missing = CoreConflictResolution::new(
            &session,
            ConflictId(404),
            ResolutionOutcome::AcceptYours,
            CoreOptions::default(),
            &ConflictConfig::default(),
        );
        assert_eq!(
            missing.resolve_conflict(),
            Err(PreconditionError::ConflictMissing(ConflictId(404)))
        );
        assert_eq!(missing.status(), ResolutionStatus::NotStarted);

        let orphan = resolution(&session, CoreOptions::default());
        drop(session);
        assert_eq!(orphan.resolve_conflict(), Err(PreconditionError::SessionGone));
    }
}
