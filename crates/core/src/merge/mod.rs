//! The merge capability used by external-tool conflict resolution.
//!
//! A [`MergeEngine`] starts a three-way merge for a conflict and reports
//! back through a [`CompletionHandler`] once the merge process ends. The
//! handler may run on any thread, possibly before `begin_external_merge`
//! has returned.

pub mod tool;

use std::path::PathBuf;
use std::sync::Arc;

use crate::conflict::ConflictRecord;
use crate::errors::MergeError;

pub use tool::ToolMergeEngine;

/// How a merge process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own with `code`.
    Exited { code: i32 },
    /// The process was interrupted before it finished.
    Interrupted,
    /// The process ended without an exit code, or could not be waited on.
    Abnormal(String),
    /// The process never started.
    LaunchFailed(String),
}

/// Files involved in one external merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeState {
    pub base_file: PathBuf,
    pub their_file: PathBuf,
    pub your_file: PathBuf,
    /// Where the merge writes its result.
    pub merged_file: PathBuf,
    /// The in-process automerge produced the result; no tool ran.
    pub automerged: bool,
}

/// Handle on a running merge process.
pub trait MergeProcess: Send + Sync {
    /// OS process id, if a process was launched.
    fn pid(&self) -> Option<u32>;
    /// Ask the process to stop. The completion handler then sees
    /// [`ProcessOutcome::Interrupted`] unless the process already ended.
    fn interrupt(&self);
    fn is_finished(&self) -> bool;
}

/// Everything the completion handler receives.
pub struct MergeCompletion {
    pub process: Arc<dyn MergeProcess>,
    pub state: MergeState,
    pub outcome: ProcessOutcome,
}

impl std::fmt::Debug for MergeCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCompletion")
            .field("pid", &self.process.pid())
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Called exactly once when a merge started by `begin_external_merge`
/// ends.
pub type CompletionHandler = Box<dyn FnOnce(MergeCompletion) + Send + 'static>;

pub trait MergeEngine: Send + Sync {
    /// Start merging `record` and return immediately. `completion` is
    /// invoked once when the merge ends, unless this returns an error.
    fn begin_external_merge(
        &self,
        record: &ConflictRecord,
        completion: CompletionHandler,
    ) -> Result<Arc<dyn MergeProcess>, MergeError>;

    /// Decide whether a finished merge produced a usable result. On success
    /// the merged file name is recorded on `record`.
    fn end_external_merge(
        &self,
        process: &dyn MergeProcess,
        record: &mut ConflictRecord,
        state: &MergeState,
        outcome: &ProcessOutcome,
    ) -> bool;
}
