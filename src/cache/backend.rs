//! Key -> (payload, metadata) persistence

use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use object_store::{ObjectStore, PutPayload, path::Path as StoragePath};
use prost::Message;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::metadata::CacheEnvelope;
use crate::error::CacheError;

pub type Result<T> = std::result::Result<T, CacheError>;

/// A stored cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub payload: Bytes,
    pub metadata: Bytes,
}

/// Persistence capability used by the cache store.
/// A `put` must be atomic: readers see the old record or the new one.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>>;
    async fn put(&self, key: &str, record: CacheRecord) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Fjall keyspace with one partition for payloads and one for metadata
#[derive(Clone)]
pub struct FjallCacheBackend {
    keyspace: Keyspace,
    payloads: PartitionHandle,
    metadata: PartitionHandle,
}

impl FjallCacheBackend {
    /// Open or create the cache keyspace at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening cache store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Backend(e.to_string()))?;
        }

        let keyspace = Config::new(path).open()?;
        let payloads = keyspace.open_partition("payloads", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            payloads,
            metadata,
        })
    }

    /// Flush all writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FjallCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let Some(payload) = self.payloads.get(key)? else {
            return Ok(None);
        };
        let Some(metadata) = self.metadata.get(key)? else {
            return Ok(None);
        };
        Ok(Some(CacheRecord {
            payload: Bytes::copy_from_slice(&payload),
            metadata: Bytes::copy_from_slice(&metadata),
        }))
    }

    async fn put(&self, key: &str, record: CacheRecord) -> Result<()> {
        // Both halves land in one batch so no reader sees a torn entry
        let mut batch = self.keyspace.batch();
        batch.insert(&self.payloads, key, record.payload.as_ref());
        batch.insert(&self.metadata, key, record.metadata.as_ref());
        batch.commit()?;
        debug!(key, "Cache entry written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut batch = self.keyspace.batch();
        batch.remove(&self.payloads, key);
        batch.remove(&self.metadata, key);
        batch.commit()?;
        debug!(key, "Cache entry removed");
        Ok(())
    }
}

/// Any object_store backend, one object per entry
#[derive(Clone)]
pub struct ObjectCacheBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectCacheBackend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Process-local store for tests and `backend = "memory"`
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), "cache")
    }

    fn object_path(&self, key: &str) -> StoragePath {
        StoragePath::from(format!("{}/{}", self.prefix, key))
    }
}

#[async_trait]
impl CacheBackend for ObjectCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let bytes = match self.store.get(&self.object_path(key)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let envelope = CacheEnvelope::decode(bytes).map_err(|_| CacheError::InvalidData)?;
        Ok(Some(CacheRecord {
            payload: Bytes::from(envelope.payload),
            metadata: Bytes::from(envelope.metadata),
        }))
    }

    async fn put(&self, key: &str, record: CacheRecord) -> Result<()> {
        let envelope = CacheEnvelope {
            payload: record.payload.to_vec(),
            metadata: record.metadata.to_vec(),
        };
        let size = envelope.payload.len();
        self.store
            .put(
                &self.object_path(key),
                PutPayload::from(envelope.encode_to_vec()),
            )
            .await?;
        debug!(key, size, "Cache object written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match self.store.delete(&self.object_path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
