//! Conflict records as reported by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ChangeType;

/// Server-assigned conflict id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(pub i64);

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The disposition requested from the server-side resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    #[default]
    Unresolved,
    DeleteConflict,
    AcceptYours,
    AcceptTheirs,
    AcceptMerge,
    AcceptYoursRenameTheirs,
    OverwriteLocal,
}

impl std::fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::DeleteConflict => write!(f, "delete_conflict"),
            Self::AcceptYours => write!(f, "accept_yours"),
            Self::AcceptTheirs => write!(f, "accept_theirs"),
            Self::AcceptMerge => write!(f, "accept_merge"),
            Self::AcceptYoursRenameTheirs => write!(f, "accept_yours_rename_theirs"),
            Self::OverwriteLocal => write!(f, "overwrite_local"),
        }
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedItem {
    pub item_id: i64,
    pub server_path: String,
    pub version: i64,
    pub change_type: Option<ChangeType>,
}

impl VersionedItem {
    pub fn new(item_id: i64, server_path: impl Into<String>, version: i64) -> Self {
        Self {
            item_id,
            server_path: server_path.into(),
            version,
            change_type: None,
        }
    }
}

/// Region counts from a three-way content merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMergeSummary {
    /// Regions changed only in your version.
    pub yours_changed: usize,
    /// Regions changed only in their version.
    pub theirs_changed: usize,
    /// Overlapping regions the merge could not reconcile.
    pub conflicting: usize,
}

impl ContentMergeSummary {
    pub fn has_conflicting_content(&self) -> bool {
        self.conflicting > 0
    }
}

/// Files a three-way merge runs over. Your file is the conflict's target
/// local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInputs {
    pub base_file: String,
    pub their_file: String,
}

/// A detected divergence between your version and their version of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub yours: VersionedItem,
    pub theirs: VersionedItem,
    /// Local path the resolution writes to.
    pub target_local_path: Option<String>,
    /// Local path the conflicting item came from.
    pub source_local_path: Option<String>,
    pub resolution: ResolutionOutcome,
    pub resolved: bool,
    pub merge_summary: Option<ContentMergeSummary>,
    /// Rename target for `AcceptYoursRenameTheirs` or a merge to a new name.
    pub new_path: Option<String>,
    /// Explicit encoding for the resolved item.
    pub encoding: Option<i32>,
    /// Merged output produced by a merge tool.
    pub merged_file: Option<String>,
    pub merge_inputs: Option<MergeInputs>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(id: ConflictId, yours: VersionedItem, theirs: VersionedItem) -> Self {
        Self {
            id,
            yours,
            theirs,
            target_local_path: None,
            source_local_path: None,
            resolution: ResolutionOutcome::Unresolved,
            resolved: false,
            merge_summary: None,
            new_path: None,
            encoding: None,
            merged_file: None,
            merge_inputs: None,
            detected_at: Utc::now(),
        }
    }

    pub fn with_local_paths(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.source_local_path = Some(source.into());
        self.target_local_path = Some(target.into());
        self
    }

    /// The path a retry should act on: the source local path, falling back
    /// to the target local path.
    pub fn local_path(&self) -> Option<&str> {
        self.source_local_path
            .as_deref()
            .or(self.target_local_path.as_deref())
    }

    /// Name shown to merge tools and in log lines.
    pub fn display_name(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.target_local_path.as_deref())
            .unwrap_or(&self.yours.server_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConflictRecord {
        ConflictRecord::new(
            ConflictId(1),
            VersionedItem::new(10, "$/proj/a.txt", 3),
            VersionedItem::new(10, "$/proj/a.txt", 5),
        )
    }

    #[test]
    fn test_new_record_is_unresolved() {
        let r = record();
        assert_eq!(r.resolution, ResolutionOutcome::Unresolved);
        assert!(!r.resolved);
    }

    #[test]
    fn test_local_path_prefers_source() {
        let r = record().with_local_paths("/ws/old.txt", "/ws/a.txt");
        assert_eq!(r.local_path(), Some("/ws/old.txt"));

        let mut r = record();
        r.target_local_path = Some("/ws/a.txt".into());
        assert_eq!(r.local_path(), Some("/ws/a.txt"));
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut r = record();
        assert_eq!(r.display_name(), "$/proj/a.txt");
        r.target_local_path = Some("/ws/a.txt".into());
        assert_eq!(r.display_name(), "/ws/a.txt");
        r.new_path = Some("/ws/b.txt".into());
        assert_eq!(r.display_name(), "/ws/b.txt");
    }
}
