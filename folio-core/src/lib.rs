//! Folio Core Library
//!
//! Core functionality for the offline-first page store:
//! - Content-addressed object model (pieces, file indexes, digests)
//! - Storage abstraction over a transactional KV substrate
//! - Immutable commit DAG with head tracking
//! - Journals (transactions) and merge resolution
//! - Page eviction guided by sync status

pub mod commit;
pub mod encode;
pub mod error;
pub mod eviction;
pub mod graph;
pub mod journal;
pub mod merge;
pub mod object;
pub mod page;
pub mod store;
pub mod tree;

pub use commit::{Commit, CommitId};
pub use encode::{decode_key, encode_key};
pub use error::{Error, Result};
pub use eviction::{EvictionDelegate, PageEvictionManager, OPEN_SENTINEL};
pub use graph::CommitGraph;
pub use journal::{Journal, JournalKind};
pub use merge::{
    ConflictResolver, ContentDiffStrategy, CustomStrategy, LastOneWinsStrategy, MergeManager,
    MergeOutcome, MergeStrategy, PageMergeResolver, ResolverState,
};
pub use object::{FileIndex, IndexChild, ObjectDigest, ObjectPriority};
pub use page::{PageId, PageRef};
pub use store::{FjallDb, MemoryDb, ObjectStore, PageDb, WriteBatch};
pub use tree::{PageTree, TreeEntry};
