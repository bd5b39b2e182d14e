//! The version-control service seam.
//!
//! The wire protocol is out of scope; the engine talks to the server through
//! this trait and treats every call as fallible.

use crate::conflict::ConflictRecord;
use crate::errors::ServiceError;
use crate::models::{
    Annotation, GetOptions, GetRequest, GetResult, ItemSpec, LockLevel, PendOptions,
    PendingChange,
};

/// Client for one workspace on a version-control server.
pub trait VersionControlService: Send + Sync {
    /// Current pending changes for the workspace.
    fn refresh_changes(&self) -> Result<Vec<PendingChange>, ServiceError>;

    /// Every outstanding conflict for the workspace.
    fn refresh_conflicts(&self) -> Result<Vec<ConflictRecord>, ServiceError>;

    /// Outstanding conflicts under the given paths.
    fn query_conflicts(&self, paths: &[String]) -> Result<Vec<ConflictRecord>, ServiceError>;

    /// Ask the server to apply `record.resolution`. The server updates the
    /// record in place: `resolved`, the merge summary, and the outcome.
    fn resolve_conflict(&self, record: &mut ConflictRecord) -> Result<(), ServiceError>;

    /// Pend edits and return the number of items pended.
    fn pend_edit(
        &self,
        items: &[ItemSpec],
        lock: LockLevel,
        options: &PendOptions,
    ) -> Result<usize, ServiceError>;

    fn get(&self, request: &GetRequest, options: &GetOptions) -> Result<GetResult, ServiceError>;

    /// Item annotations refreshed as the last step of a full refresh.
    fn query_annotations(&self) -> Result<Vec<Annotation>, ServiceError> {
        Ok(Vec::new())
    }
}
