//! Error types for the reconciliation engine.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::conflict::ConflictId;
use crate::models::SessionKey;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    ChangeCache(#[from] ChangeCacheError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

/// Errors from the session registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another session already occupies the registry. The caller owns the
    /// rejected session and must close it.
    #[error("a different session is already registered (rejected '{key}')")]
    Conflict { key: SessionKey },

    /// The session passed to `remove` is not the one registered for its key.
    #[error("session '{key}' is not managed by this registry")]
    NotManaged { key: SessionKey },

    /// Building a session for `get_or_create` / `set_default` failed.
    #[error("failed to open session: {0}")]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Errors from a bound session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was closed and can no longer be used.
    #[error("session '{0}' is closed")]
    Closed(SessionKey),

    /// One step of a refresh failed.
    #[error("refresh step '{step}' failed: {source}")]
    Refresh {
        step: RefreshStep,
        #[source]
        source: ServiceError,
    },

    /// The change cache rejected the refreshed data.
    #[error(transparent)]
    ChangeCache(#[from] ChangeCacheError),
}

/// The step of a full refresh that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStep {
    Changes,
    Conflicts,
    Annotations,
}

impl std::fmt::Display for RefreshStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Changes => write!(f, "changes"),
            Self::Conflicts => write!(f, "conflicts"),
            Self::Annotations => write!(f, "annotations"),
        }
    }
}

// ---------------------------------------------------------------------------
// Version-control service errors
// ---------------------------------------------------------------------------

/// Errors reported by a [`crate::service::VersionControlService`]
/// implementation.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The server could not be reached.
    #[error("version control server unavailable: {0}")]
    Unavailable(String),

    /// The server refused the request.
    #[error("request rejected by server: {0}")]
    Rejected(String),

    /// Anything else raised by the collaborator.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Change cache errors
// ---------------------------------------------------------------------------

/// Errors from the pending-change cache.
#[derive(Debug, Error)]
pub enum ChangeCacheError {
    /// A pending change carried neither a local nor a server path.
    #[error("pending change {0} has neither a local nor a server path")]
    InvalidChange(i64),

    /// Querying the server for pending changes failed.
    #[error("failed to query pending changes: {0}")]
    Service(#[from] ServiceError),
}

// ---------------------------------------------------------------------------
// Conflict resolution errors
// ---------------------------------------------------------------------------

/// A programming error: the resolution has nothing to resolve against.
///
/// Kept separate from [`ResolutionError`] so callers never retry it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreconditionError {
    /// The owning session has been dropped.
    #[error("the session owning this conflict no longer exists")]
    SessionGone,

    /// The conflict is not present in the session's conflict cache.
    #[error("conflict {0} is not present in the session")]
    ConflictMissing(ConflictId),

    /// `resolve_conflict` was already called on this resolution.
    #[error("this resolution has already been started")]
    AlreadyStarted,
}

/// Failures raised by a resolution strategy's work. These become a
/// `Failed` status and never escape `resolve_conflict`.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// A rename target or encoding was set on a strategy that does not
    /// support it.
    #[error("{strategy} does not support setting {option}")]
    UnsupportedOption {
        strategy: &'static str,
        option: &'static str,
    },

    /// The server left the conflict unresolved.
    #[error("the server did not resolve conflict {0}")]
    ServerUnresolved(ConflictId),

    /// Pending an edit on the conflicting item pended nothing.
    #[error("could not pend an edit on '{0}'")]
    PendFailed(String),

    /// The retried get reported failures.
    #[error("get of '{path}' failed: {detail}")]
    GetFailed { path: String, detail: String },

    /// The retried get was cancelled.
    #[error("get of '{0}' was cancelled")]
    GetCancelled(String),

    /// An external merge is already in flight for this resolution.
    #[error("an external merge is already running for this conflict")]
    AlreadyRunning,

    /// The resolution already reached a terminal status.
    #[error("this resolution has already completed")]
    AlreadyCompleted,

    /// The external merge tool could not be started.
    #[error(transparent)]
    Launch(#[from] MergeError),

    /// A version-control call failed outright.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the merge capability.
#[derive(Debug, Error)]
pub enum MergeError {
    /// No merge tool is configured for the conflicting file.
    #[error("no external merge tool is configured for '{0}'")]
    ToolNotConfigured(String),

    /// The conflict lacks the inputs a three-way merge needs.
    #[error("conflict {0} has no merge inputs")]
    MissingInputs(ConflictId),

    /// The merge tool process could not be started.
    #[error("failed to launch merge tool '{command}': {detail}")]
    LaunchFailed { command: String, detail: String },

    /// Launching a process needs a tokio runtime.
    #[error("no tokio runtime is available to monitor the merge tool")]
    NoRuntime,

    /// Generic I/O wrapper.
    #[error("merge I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
