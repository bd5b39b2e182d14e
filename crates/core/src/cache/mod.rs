//! Per-session caches of server state.

pub mod annotations;
pub mod changes;
pub mod collection;

pub use annotations::AnnotationCache;
pub use changes::{ChangeCache, ChangeCacheListener};
pub use collection::{canonical_local_path, canonical_server_path, PendingChangeCollection};
