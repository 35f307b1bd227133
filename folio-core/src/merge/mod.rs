//! Merge resolution: strategies, the per-page resolver, and the
//! manager that owns every resolver.

pub mod resolver;
pub mod strategy;

pub use resolver::{MergeOutcome, PageMergeResolver, ResolverState};
pub use strategy::{
    three_way, Conflict, ConflictResolver, ContentDiffStrategy, CustomStrategy,
    LastOneWinsStrategy, MergeInput, MergeStrategy, Resolution,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::graph::CommitGraph;
use crate::page::PageId;
use crate::store::ObjectStore;

/// Owns all per-page merge resolvers.
///
/// The manager holds the only authoritative map; resolvers reference
/// their page by id, never by pointer, so there are no lifetime rules
/// beyond keeping the manager alive.
pub struct MergeManager {
    default_strategy: Arc<dyn MergeStrategy>,
    resolvers: Mutex<HashMap<PageId, Arc<PageMergeResolver>>>,
}

impl MergeManager {
    pub fn new(default_strategy: Arc<dyn MergeStrategy>) -> Self {
        Self {
            default_strategy,
            resolvers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the resolver for a page, creating it with the default
    /// strategy if it does not exist yet.
    pub fn get_or_create(
        &self,
        page: PageId,
        graph: Arc<CommitGraph>,
        objects: Arc<ObjectStore>,
    ) -> Arc<PageMergeResolver> {
        let mut resolvers = self.resolvers.lock().expect("resolver map lock poisoned");
        resolvers
            .entry(page)
            .or_insert_with(|| {
                Arc::new(PageMergeResolver::new(
                    page,
                    graph,
                    objects,
                    self.default_strategy.clone(),
                ))
            })
            .clone()
    }

    /// Look up an existing resolver.
    pub fn get(&self, page: &PageId) -> Option<Arc<PageMergeResolver>> {
        self.resolvers
            .lock()
            .expect("resolver map lock poisoned")
            .get(page)
            .cloned()
    }

    /// Drop a page's resolver, e.g. when the page is evicted.
    pub fn remove(&self, page: &PageId) {
        self.resolvers
            .lock()
            .expect("resolver map lock poisoned")
            .remove(page);
    }
}
