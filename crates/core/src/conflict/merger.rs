//! In-process three-way content merge.
//!
//! Uses the `diffy` crate to merge a base, "yours" (local), and "theirs"
//! (server) version of a file and to count the regions each side changed.

use tracing::{debug, info};

use super::record::ContentMergeSummary;

const CONFLICT_START_MARKER: &str = "<<<<<<<";

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    /// The merged content. Contains conflict markers when
    /// `summary.conflicting > 0`.
    pub merged_content: String,
    pub summary: ContentMergeSummary,
}

impl MergeOutput {
    pub fn is_clean(&self) -> bool {
        !self.summary.has_conflicting_content()
    }
}

/// Stateless three-way merge engine.
pub struct ContentMerger;

impl ContentMerger {
    /// Merge `yours` and `theirs` against `base`.
    ///
    /// Always returns merged content; overlapping edits are emitted with
    /// `<<<<<<<` / `=======` / `>>>>>>>` markers and counted as conflicting.
    pub fn merge(base: &str, yours: &str, theirs: &str) -> MergeOutput {
        info!("performing three-way content merge");

        let yours_changed = diffy::create_patch(base, yours).hunks().len();
        let theirs_changed = diffy::create_patch(base, theirs).hunks().len();

        // Fast paths: one side untouched, or both sides identical.
        if yours == base || theirs == base || yours == theirs {
            let merged = if yours == base { theirs } else { yours };
            debug!("trivial merge, no overlapping edits");
            return MergeOutput {
                merged_content: merged.to_string(),
                summary: ContentMergeSummary {
                    yours_changed,
                    theirs_changed,
                    conflicting: 0,
                },
            };
        }

        match diffy::merge(base, yours, theirs) {
            Ok(merged) => {
                debug!("clean three-way merge");
                MergeOutput {
                    merged_content: merged,
                    summary: ContentMergeSummary {
                        yours_changed,
                        theirs_changed,
                        conflicting: 0,
                    },
                }
            }
            Err(with_markers) => {
                let conflicting = count_conflict_regions(&with_markers);
                debug!(conflicting, "three-way merge left conflicting regions");
                MergeOutput {
                    merged_content: with_markers,
                    summary: ContentMergeSummary {
                        yours_changed,
                        theirs_changed,
                        conflicting,
                    },
                }
            }
        }
    }

    /// Region counts only, without keeping the merged text.
    pub fn summarize(base: &str, yours: &str, theirs: &str) -> ContentMergeSummary {
        Self::merge(base, yours, theirs).summary
    }
}

/// Count conflict blocks in marker-annotated merge output.
pub fn count_conflict_regions(content: &str) -> usize {
    content
        .lines()
        .filter(|line| line.starts_with(CONFLICT_START_MARKER))
        .count()
}
