//! Conflict records, the per-session conflict cache, and content merging.
//!
//! The conflict subsystem is responsible for:
//! 1. **Records** -- the server's view of a divergence between your version
//!    and their version of an item.
//! 2. **Caching** -- the set of outstanding conflicts for a session.
//! 3. **Merging** -- in-process three-way merges and merge summaries.

pub mod cache;
pub mod merger;
pub mod record;

pub use cache::{ConflictCache, ConflictCacheListener};
pub use merger::{ContentMerger, MergeOutput};
pub use record::{
    ConflictId, ConflictRecord, ContentMergeSummary, MergeInputs, ResolutionOutcome,
    VersionedItem,
};
