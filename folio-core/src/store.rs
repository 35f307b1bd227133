//! Storage substrate and content-addressed object store.
//!
//! `PageDb` is the generic transactional key/value interface the rest of
//! the page store is written against: point reads/writes, ordered prefix
//! iteration, and atomic multi-key batches. Two implementations are
//! provided: an in-memory database for tests and fakes, and a persistent
//! database backed by the Fjall LSM-tree.
//!
//! `ObjectStore` sits on top of a `PageDb` and provides content-addressed
//! piece/index storage with automatic deduplication and chunking.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::object::{FileIndex, IndexChild, ObjectDigest};

/// A single operation inside a write batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered set of operations applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Generic transactional key/value interface.
///
/// The physical engine behind this trait is out of scope; all page store
/// state goes through it.
#[async_trait]
pub trait PageDb: Send + Sync {
    /// Get a value by key.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Put a single key/value pair.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Ordered iteration over all keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Apply a multi-key batch atomically.
    async fn apply_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// In-memory database for tests and fakes.
#[derive(Default)]
pub struct MemoryDb {
    map: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PageDb for MemoryDb {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map
            .write()
            .await
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let map = self.map.read().await;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }

    async fn apply_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write().await;
        for op in batch.ops() {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k.clone(), Bytes::copy_from_slice(v));
                }
                BatchOp::Delete(k) => {
                    map.remove(k);
                }
            }
        }
        Ok(())
    }
}

/// Persistent database backed by the Fjall LSM-tree.
pub struct FjallDb {
    db: fjall::Database,
    data: fjall::Keyspace,
}

impl FjallDb {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let db = fjall::Database::builder(path)
            .open()
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        let data = db
            .keyspace("data", || fjall::KeyspaceCreateOptions::default())
            .map_err(|e| Error::Storage(format!("Failed to open data keyspace: {}", e)))?;

        Ok(Self { db, data })
    }

    /// Flush all pending writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.db
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| Error::Storage(format!("Failed to persist: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl PageDb for FjallDb {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.data
            .get(key)
            .map_err(|e| Error::Storage(format!("Get failed: {}", e)))
            .map(|opt| opt.map(|v| Bytes::from(v.to_vec())))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data
            .insert(key, value)
            .map_err(|e| Error::Storage(format!("Put failed: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.data
            .remove(key)
            .map_err(|e| Error::Storage(format!("Delete failed: {}", e)))?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        for guard in self.data.prefix(prefix) {
            let (k, v) = guard
                .into_inner()
                .map_err(|e| Error::Storage(format!("Scan failed: {}", e)))?;
            out.push((Bytes::from(k.to_vec()), Bytes::from(v.to_vec())));
        }
        Ok(out)
    }

    async fn apply_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut fjall_batch = self.db.batch();
        for op in batch.ops() {
            match op {
                BatchOp::Put(k, v) => fjall_batch.insert(&self.data, k.as_slice(), v.as_slice()),
                BatchOp::Delete(k) => fjall_batch.remove(&self.data, k.as_slice()),
            }
        }
        fjall_batch
            .commit()
            .map_err(|e| Error::Storage(format!("Batch commit failed: {}", e)))?;
        self.persist()
    }
}

/// Chunk threshold: blobs larger than this are split into an index of
/// pieces.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Value-byte tag for stored pieces.
const KIND_PIECE: u8 = 0;
/// Value-byte tag for stored file indexes.
const KIND_INDEX: u8 = 1;

fn object_key(digest: &ObjectDigest) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 32);
    key.extend_from_slice(b"obj/");
    key.extend_from_slice(digest.as_bytes());
    key
}

/// Content-addressed storage of opaque byte blobs.
///
/// Identical content always yields the identical digest, so storing the
/// same bytes twice returns the cached object without rewriting it.
pub struct ObjectStore {
    db: Arc<dyn PageDb>,
}

impl ObjectStore {
    pub fn new(db: Arc<dyn PageDb>) -> Self {
        Self { db }
    }

    /// Store leaf content, returning its digest.
    pub async fn new_piece(&self, data: &[u8]) -> Result<ObjectDigest> {
        let digest = ObjectDigest::from_data(data);
        let key = object_key(&digest);
        if self.db.get(&key).await?.is_some() {
            debug!(digest = %digest, "piece already stored, dedup hit");
            return Ok(digest);
        }
        let mut value = Vec::with_capacity(1 + data.len());
        value.push(KIND_PIECE);
        value.extend_from_slice(data);
        self.db.put(&key, &value).await?;
        Ok(digest)
    }

    /// Store a file index over ordered (digest, size) children.
    pub async fn new_index(&self, children: Vec<IndexChild>) -> Result<ObjectDigest> {
        let index = FileIndex::new(children);
        let serialized = index.to_bytes();
        let digest = ObjectDigest::from_data(&serialized);
        let key = object_key(&digest);
        if self.db.get(&key).await?.is_some() {
            debug!(digest = %digest, "index already stored, dedup hit");
            return Ok(digest);
        }
        let mut value = Vec::with_capacity(1 + serialized.len());
        value.push(KIND_INDEX);
        value.extend_from_slice(&serialized);
        self.db.put(&key, &value).await?;
        Ok(digest)
    }

    /// Whether an object is present locally.
    pub async fn exists(&self, digest: &ObjectDigest) -> Result<bool> {
        Ok(self.db.get(&object_key(digest)).await?.is_some())
    }

    /// Read an object's full content. Indexes are resolved recursively.
    pub async fn read(&self, digest: &ObjectDigest) -> Result<Bytes> {
        let value = self
            .db
            .get(&object_key(digest))
            .await?
            .ok_or_else(|| Error::NotFound(format!("Object {}", digest)))?;
        if value.is_empty() {
            return Err(Error::Storage(format!("Empty object record for {}", digest)));
        }
        match value[0] {
            KIND_PIECE => Ok(value.slice(1..)),
            KIND_INDEX => {
                let index = FileIndex::from_bytes(&value[1..])?;
                // Child sizes are unverified until each chunk is read;
                // cap the pre-allocation accordingly.
                let mut out = Vec::with_capacity((index.total_size() as usize).min(MAX_CHUNK_SIZE));
                for child in index.children() {
                    let chunk = Box::pin(self.read(&child.digest)).await?;
                    if chunk.len() as u64 != child.size {
                        return Err(Error::Storage(format!(
                            "Chunk {} has size {}, index says {}",
                            child.digest,
                            chunk.len(),
                            child.size
                        )));
                    }
                    out.extend_from_slice(&chunk);
                }
                Ok(Bytes::from(out))
            }
            kind => Err(Error::Storage(format!(
                "Unknown object kind {} for {}",
                kind, digest
            ))),
        }
    }

    /// Read the raw serialized form of an object (piece bytes or index
    /// bytes) together with its kind tag. Used by sync to ship objects
    /// without reassembling them.
    pub async fn read_raw(&self, digest: &ObjectDigest) -> Result<Bytes> {
        self.db
            .get(&object_key(digest))
            .await?
            .ok_or_else(|| Error::NotFound(format!("Object {}", digest)))
    }

    /// Store a raw object record as received from the remote, verifying
    /// that its content matches the digest it was advertised under.
    pub async fn put_raw(&self, digest: &ObjectDigest, record: &[u8]) -> Result<()> {
        if record.is_empty() {
            return Err(Error::InvalidArgument("Empty object record".to_string()));
        }
        let computed = ObjectDigest::from_data(&record[1..]);
        if computed != *digest {
            return Err(Error::InvalidArgument(format!(
                "Object content hashes to {}, expected {}",
                computed, digest
            )));
        }
        self.db.put(&object_key(digest), record).await
    }

    /// Store an arbitrary blob, chunking it if it exceeds the chunk
    /// threshold. Returns the digest of the root object (a piece for
    /// small blobs, an index otherwise).
    pub async fn write_blob(&self, data: &[u8]) -> Result<ObjectDigest> {
        if data.len() <= MAX_CHUNK_SIZE {
            return self.new_piece(data).await;
        }
        let mut children = Vec::with_capacity(data.len() / MAX_CHUNK_SIZE + 1);
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            let digest = self.new_piece(chunk).await?;
            children.push(IndexChild {
                digest,
                size: chunk.len() as u64,
            });
        }
        self.new_index(children).await
    }

    /// Digests referenced by an object: empty for pieces, the children
    /// for indexes. Used by sync to walk the object graph.
    pub async fn references(&self, digest: &ObjectDigest) -> Result<Vec<ObjectDigest>> {
        let value = self.read_raw(digest).await?;
        if value.is_empty() {
            return Err(Error::Storage(format!("Empty object record for {}", digest)));
        }
        match value[0] {
            KIND_PIECE => Ok(Vec::new()),
            KIND_INDEX => {
                let index = FileIndex::from_bytes(&value[1..])?;
                Ok(index.children().iter().map(|c| c.digest).collect())
            }
            kind => Err(Error::Storage(format!(
                "Unknown object kind {} for {}",
                kind, digest
            ))),
        }
    }
}
