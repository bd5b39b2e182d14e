//! Applies a chosen outcome to a conflict on the server.

use std::sync::Arc;

use tracing::{error, warn};

use crate::conflict::ConflictRecord;
use crate::errors::ResolutionError;
use crate::session::Session;

/// Resolves a record whose `resolution` has already been chosen.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, session: &Arc<Session>, record: ConflictRecord) -> Result<(), ResolutionError>;
}

/// Sends the resolution to the session's service and commits the result to
/// its conflict cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerConflictResolver;

impl ConflictResolver for ServerConflictResolver {
    fn resolve(&self, session: &Arc<Session>, mut record: ConflictRecord) -> Result<(), ResolutionError> {
        if let Err(e) = session.service().resolve_conflict(&mut record) {
            error!(conflict_id = %record.id, error = %e, "resolve request failed");
            return Err(e.into());
        }
        if !record.resolved {
            warn!(conflict_id = %record.id, outcome = %record.resolution, "server left conflict unresolved");
            return Err(ResolutionError::ServerUnresolved(record.id));
        }
        session.conflict_cache().commit(record);
        Ok(())
    }
}
