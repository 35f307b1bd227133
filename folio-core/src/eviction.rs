//! Page eviction: bounds local disk usage by discarding the local
//! storage of pages that are closed and fully synced to the remote.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::page::PageRef;
use crate::store::PageDb;

/// Last-used value meaning "currently open"; such a page is never
/// eligible for eviction.
pub const OPEN_SENTINEL: i64 = 0;

const LAST_USED_KEY: &[u8] = b"evict/last_used";

/// The capabilities the eviction manager needs from its owner: a synced
/// check against the sync engine and the actual storage removal.
#[async_trait]
pub trait EvictionDelegate: Send + Sync {
    /// Whether every local commit of the page has reached the remote.
    async fn page_is_synced(&self, page: &PageRef) -> Result<bool>;

    /// Remove the page's local-only storage.
    async fn evict_page_storage(&self, page: &PageRef) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LastUsedMap {
    entries: Vec<(PageRef, i64)>,
}

/// Tracks page last-used times and runs cleanup passes.
pub struct PageEvictionManager {
    db: Arc<dyn PageDb>,
    last_used: Mutex<HashMap<PageRef, i64>>,
}

impl PageEvictionManager {
    /// Open the manager, loading persisted last-used state.
    pub async fn open(db: Arc<dyn PageDb>) -> Result<Self> {
        let last_used = match db.get(LAST_USED_KEY).await? {
            Some(bytes) => {
                let map: LastUsedMap = serde_json::from_slice(&bytes).unwrap_or_default();
                map.entries.into_iter().collect()
            }
            None => HashMap::new(),
        };
        Ok(Self {
            db,
            last_used: Mutex::new(last_used),
        })
    }

    async fn persist(&self, map: &HashMap<PageRef, i64>) -> Result<()> {
        let snapshot = LastUsedMap {
            entries: map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| crate::error::Error::Internal(format!("Serialize last-used: {}", e)))?;
        self.db.put(LAST_USED_KEY, &bytes).await
    }

    /// Mark a page as open. Open pages carry the sentinel timestamp and
    /// are never evicted.
    pub async fn on_page_opened(&self, page: &PageRef) -> Result<()> {
        let mut map = self.last_used.lock().await;
        map.insert(page.clone(), OPEN_SENTINEL);
        self.persist(&map).await
    }

    /// Mark a page as closed, stamping it with the current time.
    pub async fn on_page_closed(&self, page: &PageRef) -> Result<()> {
        let mut map = self.last_used.lock().await;
        map.insert(page.clone(), chrono::Utc::now().timestamp_millis());
        self.persist(&map).await
    }

    /// Last-used timestamp of a page, if tracked.
    pub async fn last_used(&self, page: &PageRef) -> Option<i64> {
        self.last_used.lock().await.get(page).copied()
    }

    /// Scan closed pages oldest-first and evict those that are fully
    /// synced. A failed synced-state read skips that page; it is never
    /// evicted on uncertainty. Returns the number of pages evicted.
    pub async fn try_clean_up(&self, delegate: &dyn EvictionDelegate) -> Result<usize> {
        let candidates: Vec<(PageRef, i64)> = {
            let map = self.last_used.lock().await;
            let mut closed: Vec<(PageRef, i64)> = map
                .iter()
                .filter(|(_, ts)| **ts != OPEN_SENTINEL)
                .map(|(page, ts)| (page.clone(), *ts))
                .collect();
            closed.sort_by_key(|(page, ts)| (*ts, page.clone()));
            closed
        };

        let mut evicted = 0;
        for (page, _) in candidates {
            let synced = match delegate.page_is_synced(&page).await {
                Ok(synced) => synced,
                Err(e) => {
                    warn!(page = %page, error = %e, "synced check failed, skipping page");
                    continue;
                }
            };
            if !synced {
                debug!(page = %page, "page not fully synced, keeping");
                continue;
            }
            if let Err(e) = delegate.evict_page_storage(&page).await {
                warn!(page = %page, error = %e, "eviction failed, keeping page");
                continue;
            }
            let mut map = self.last_used.lock().await;
            map.remove(&page);
            self.persist(&map).await?;
            evicted += 1;
            debug!(page = %page, "evicted page storage");
        }
        Ok(evicted)
    }
}
