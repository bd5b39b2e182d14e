//! Two-phase automerge for writable-file conflicts.
//!
//! A file made writable outside the client has no pending edit, so the
//! server cannot merge it in place. The resolution drops the conflict, pends
//! an edit, gets their version again to produce ordinary version conflicts,
//! and accept-merges each of those.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, instrument, warn};

use super::{ConflictResolution, ResolutionStatus, StatusTracker, WorkOutput};
use crate::config::ConflictConfig;
use crate::conflict::{ConflictId, ConflictRecord, ResolutionOutcome};
use crate::errors::ResolutionError;
use crate::models::{GetOptions, GetRequest, ItemSpec, LockLevel, PendOptions};
use crate::session::Session;

const STRATEGY: &str = "write-conflict automerge";

pub struct WriteConflictResolution {
    session: Weak<Session>,
    conflict_id: ConflictId,
    residual: Mutex<Vec<ConflictRecord>>,
    tracker: StatusTracker,
}

impl WriteConflictResolution {
    pub fn new(session: &Arc<Session>, conflict_id: ConflictId, config: &ConflictConfig) -> Self {
        Self {
            session: Arc::downgrade(session),
            conflict_id,
            residual: Mutex::new(Vec::new()),
            tracker: StatusTracker::new(conflict_id, config.default_failure_message.clone()),
        }
    }

    /// Always fails: a two-phase automerge keeps the item's path.
    pub fn set_new_path(&self, _path: impl Into<String>) -> Result<(), ResolutionError> {
        Err(ResolutionError::UnsupportedOption {
            strategy: STRATEGY,
            option: "a new path",
        })
    }

    /// Always fails: a two-phase automerge keeps the item's encoding.
    pub fn set_encoding(&self, _encoding: i32) -> Result<(), ResolutionError> {
        Err(ResolutionError::UnsupportedOption {
            strategy: STRATEGY,
            option: "an encoding",
        })
    }

    /// Conflicts the retried get produced that could not be automerged.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.residual
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn drop_conflict(session: &Session, mut record: ConflictRecord) -> Result<(), ResolutionError> {
        let id = record.id;
        record.resolution = ResolutionOutcome::DeleteConflict;
        session.service().resolve_conflict(&mut record)?;
        if !record.resolved {
            return Err(ResolutionError::ServerUnresolved(id));
        }
        session.conflict_cache().commit(record);
        Ok(())
    }

    fn pend_edit(session: &Session, path: &str) -> Result<(), ResolutionError> {
        let options = PendOptions {
            force_checkout_local_version: true,
            encoding: None,
        };
        let pended = session
            .service()
            .pend_edit(&[ItemSpec::new(path)], LockLevel::Unchanged, &options)?;
        if pended < 1 {
            return Err(ResolutionError::PendFailed(path.to_string()));
        }
        Ok(())
    }

    /// Get their version again. Returns the number of new conflicts.
    fn retry_get(session: &Session, path: &str, version: i64) -> Result<usize, ResolutionError> {
        let request = GetRequest {
            item: ItemSpec::new(path),
            version,
        };
        let options = GetOptions {
            overwrite: false,
            get_all: true,
        };
        let result = session.service().get(&request, &options)?;
        if result.cancelled {
            return Err(ResolutionError::GetCancelled(path.to_string()));
        }
        if !result.failures.is_empty() {
            let detail = result
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.path, f.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ResolutionError::GetFailed {
                path: path.to_string(),
                detail,
            });
        }
        Ok(result.conflict_count)
    }

    /// Accept-merge every conflict under `path`; returns those the server
    /// left unresolved.
    fn automerge(session: &Session, path: &str) -> Result<Vec<ConflictRecord>, ResolutionError> {
        let produced = session.service().query_conflicts(&[path.to_string()])?;
        let mut residual = Vec::new();
        for mut conflict in produced {
            conflict.resolution = ResolutionOutcome::AcceptMerge;
            match session.service().resolve_conflict(&mut conflict) {
                Ok(()) if conflict.resolved => {
                    debug!(conflict_id = %conflict.id, "automerged");
                    session.conflict_cache().commit(conflict);
                }
                Ok(()) => {
                    conflict.resolution = ResolutionOutcome::Unresolved;
                    session.conflict_cache().insert(conflict.clone());
                    residual.push(conflict);
                }
                Err(e) => {
                    warn!(conflict_id = %conflict.id, error = %e, "automerge request failed");
                    conflict.resolution = ResolutionOutcome::Unresolved;
                    session.conflict_cache().insert(conflict.clone());
                    residual.push(conflict);
                }
            }
        }
        Ok(residual)
    }
}

impl ConflictResolution for WriteConflictResolution {
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

    #[instrument(skip_all, fields(conflict_id = %record.id))]
    fn work(
        &self,
        session: &Arc<Session>,
        record: ConflictRecord,
    ) -> Result<WorkOutput, ResolutionError> {
        let path = record
            .local_path()
            .ok_or_else(|| ResolutionError::PendFailed(record.display_name().to_string()))?
            .to_string();
        let their_version = record.theirs.version;

        Self::drop_conflict(session, record)?;
        Self::pend_edit(session, &path)?;

        let produced = Self::retry_get(session, &path, their_version)?;
        if produced == 0 {
            info!(path = %path, "retried get produced no conflicts");
            return Ok(WorkOutput::status(ResolutionStatus::Success));
        }

        let residual = Self::automerge(session, &path)?;
        let count = residual.len();
        *self.residual.lock().unwrap_or_else(|e| e.into_inner()) = residual;

        if count == 0 {
            info!(path = %path, "write conflict automerged");
            Ok(WorkOutput::status(ResolutionStatus::Success))
        } else {
            info!(path = %path, count, "write conflict left residual conflicts");
            Ok(WorkOutput {
                status: ResolutionStatus::SucceededWithConflicts,
                message: Some(format!("{count} conflict(s) could not be automerged")),
            })
        }
    }
}
