//! Domain model types used throughout the engine.
//!
//! These types bridge the session, the caches, and the version-control
//! service collaborator.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Binding identity
// ---------------------------------------------------------------------------

/// Identity of a local/server binding: the server plus the workspace name.
///
/// Two bindings with the same key are the same logical session. Server URLs
/// ignore a trailing slash and workspace names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    server: String,
    workspace: String,
}

impl SessionKey {
    pub fn new(server: impl AsRef<str>, workspace: impl AsRef<str>) -> Self {
        Self {
            server: server.as_ref().trim_end_matches('/').to_ascii_lowercase(),
            workspace: workspace.as_ref().to_ascii_lowercase(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{};{}", self.workspace, self.server)
    }
}

/// Identity of the version-control client a binding talks through.
///
/// Folder-content events are scoped to a client rather than a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the authoritative workspace state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceLocation {
    /// The server tracks every pending change; nothing to rescan locally.
    Server,
    /// The client detects changes by scanning the local file system.
    Local,
}

/// Description of one local/server binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceBinding {
    pub key: SessionKey,
    pub client: ClientId,
    pub location: WorkspaceLocation,
    /// Root of the mapped local tree.
    pub local_root: String,
    /// Whether a live server connection is established.
    pub connected: bool,
}

impl WorkspaceBinding {
    pub fn new(key: SessionKey, location: WorkspaceLocation, local_root: impl Into<String>) -> Self {
        Self {
            key,
            client: ClientId::new(),
            location,
            local_root: local_root.into(),
            connected: false,
        }
    }

    pub fn with_client(mut self, client: ClientId) -> Self {
        self.client = client;
        self
    }

    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// A full refresh contacts the server; only do that when the server is
    /// authoritative or reachable.
    pub fn prefers_full_refresh(&self) -> bool {
        self.location == WorkspaceLocation::Server || self.connected
    }
}

// ---------------------------------------------------------------------------
// Pending changes
// ---------------------------------------------------------------------------

bitflags! {
    /// Kinds of uncommitted change on an item. Not mutually exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ChangeType: u32 {
        const ADD = 1 << 0;
        const EDIT = 1 << 1;
        const ENCODING = 1 << 2;
        const RENAME = 1 << 3;
        const DELETE = 1 << 4;
        const UNDELETE = 1 << 5;
        const BRANCH = 1 << 6;
        const MERGE = 1 << 7;
        const LOCK = 1 << 8;
        const PROPERTY = 1 << 9;
    }
}

/// Sentinel encoding meaning "leave the encoding as it is".
pub const ENCODING_UNCHANGED: i32 = -2;

/// A single file or folder's uncommitted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Server-assigned id; 0 means the change was never recorded.
    pub id: i64,
    pub item_id: i64,
    pub local_path: Option<String>,
    pub server_path: Option<String>,
    /// Prior server path for renames.
    pub source_server_path: Option<String>,
    pub change_type: ChangeType,
    pub encoding: i32,
    #[serde(default)]
    pub properties: Vec<(String, String)>,
}

impl PendingChange {
    pub fn new(id: i64, server_path: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            id,
            item_id: id,
            local_path: None,
            server_path: Some(server_path.into()),
            source_server_path: None,
            change_type,
            encoding: ENCODING_UNCHANGED,
            properties: Vec::new(),
        }
    }

    pub fn with_local_path(mut self, local_path: impl Into<String>) -> Self {
        self.local_path = Some(local_path.into());
        self
    }

    pub fn with_source(mut self, source_server_path: impl Into<String>) -> Self {
        self.source_server_path = Some(source_server_path.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Service requests
// ---------------------------------------------------------------------------

/// Lock requested when pending a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    #[default]
    Unchanged,
    None,
    Checkin,
    CheckOut,
}

/// An item path plus recursion, as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSpec {
    pub path: String,
    pub recursive: bool,
}

impl ItemSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
        }
    }
}

/// Options for pending an edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendOptions {
    /// Skip the server-side "is this file writable" check.
    pub force_checkout_local_version: bool,
    /// Explicit encoding to pend, or `None` to leave it.
    pub encoding: Option<i32>,
}

/// A get of one item to a specific version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub item: ItemSpec,
    pub version: i64,
}

/// Options for a get.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Overwrite writable local files that have no pending change.
    pub overwrite: bool,
    /// Fetch even if the local version already matches.
    pub get_all: bool,
}

/// One item the get could not process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetFailure {
    pub path: String,
    pub message: String,
}

/// The outcome of a get.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResult {
    /// Number of new conflicts the get produced.
    pub conflict_count: usize,
    pub failures: Vec<GetFailure>,
    pub cancelled: bool,
}

/// Whether an event originated from this engine or from another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Internal,
    External,
}

/// A server-side annotation (item metadata) refreshed with the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub server_path: String,
    pub name: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_normalizes() {
        let a = SessionKey::new("https://tfs.example.com/tfs/", "Dev-WS");
        let b = SessionKey::new("https://TFS.example.com/tfs", "dev-ws");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "dev-ws;https://tfs.example.com/tfs");
    }

    #[test]
    fn test_prefers_full_refresh() {
        let key = SessionKey::new("https://tfs", "ws");
        let local = WorkspaceBinding::new(key.clone(), WorkspaceLocation::Local, "/src");
        assert!(!local.prefers_full_refresh());
        assert!(local.clone().connected(true).prefers_full_refresh());

        let server = WorkspaceBinding::new(key, WorkspaceLocation::Server, "/src");
        assert!(server.prefers_full_refresh());
    }

    #[test]
    fn test_change_type_is_a_bit_set() {
        let ct = ChangeType::EDIT | ChangeType::RENAME;
        assert!(ct.contains(ChangeType::EDIT));
        assert!(ct.contains(ChangeType::RENAME));
        assert!(!ct.contains(ChangeType::DELETE));
        assert!(ChangeType::empty().is_empty());
    }
}
