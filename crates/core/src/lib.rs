//! Reconcile core library.
//!
//! Client-side state for centrally versioned workspaces: the registry of
//! open sessions, each session's pending-change, conflict and annotation
//! caches, the event engine that keeps them current, and the conflict
//! resolution strategies with their status tracking.

pub mod cache;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod events;
pub mod listeners;
pub mod logging;
pub mod merge;
pub mod models;
pub mod ownership;
pub mod registry;
pub mod resolution;
pub mod service;
pub mod session;
pub mod watch;

#[cfg(test)]
mod testing;

// Re-exports for convenience.
pub use cache::{AnnotationCache, ChangeCache, ChangeCacheListener};
pub use config::EngineConfig;
pub use conflict::{ConflictCache, ConflictId, ConflictRecord, ResolutionOutcome};
pub use errors::CoreError;
pub use events::{CoreEvent, EventEngine};
pub use merge::{MergeEngine, ToolMergeEngine};
pub use ownership::ObjectOwnershipMap;
pub use registry::SessionRegistry;
pub use resolution::{
    ConflictResolution, CoreConflictResolution, ExternalConflictResolution, ResolutionStatus,
    WriteConflictResolution,
};
pub use service::VersionControlService;
pub use session::{Session, Workspace};
