//! Response cache
//!
//! Entries are addressed by a SHA-256 digest of the request identity
//! (method, effective base URL, path and filtered arguments) and judged
//! against the request's current [`CachePolicy`] on every load. Entries that
//! are expired or no longer match are deleted as soon as they are seen.

mod backend;
mod metadata;

pub use backend::{CacheBackend, CacheRecord, FjallCacheBackend, ObjectCacheBackend};
pub use metadata::{CacheEnvelope, CacheMetadata};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use prost::Message;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::{CacheBackendKind, CacheSettings};
use crate::error::CacheError;
use crate::request::{CachePolicy, Method, ResponsePayload, ResponseSerializer};

pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache store shared by every request of a manager
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    app_version: Arc<str>,
    write_async: bool,
    pending: Arc<Mutex<HashMap<String, PendingWrite>>>,
    generation: Arc<AtomicU64>,
}

struct PendingWrite {
    generation: u64,
    done: watch::Receiver<bool>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, app_version: impl Into<String>) -> Self {
        Self {
            backend,
            app_version: Arc::from(app_version.into()),
            write_async: true,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the backend selected by `settings`
    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        let backend: Arc<dyn CacheBackend> = match settings.backend {
            CacheBackendKind::Fjall => Arc::new(FjallCacheBackend::open(&settings.path)?),
            CacheBackendKind::Memory => Arc::new(ObjectCacheBackend::in_memory()),
        };
        Ok(Self::new(backend, settings.app_version.clone()).with_write_async(settings.write_async))
    }

    pub fn in_memory(app_version: impl Into<String>) -> Self {
        Self::new(Arc::new(ObjectCacheBackend::in_memory()), app_version)
    }

    pub fn with_write_async(mut self, write_async: bool) -> Self {
        self.write_async = write_async;
        self
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    /// Whether saves for `policy` go off the completion path
    pub fn writes_async(&self, policy: &CachePolicy) -> bool {
        policy.write_async.unwrap_or(self.write_async)
    }

    /// Deterministic, file-system safe identifier of a request's entry
    pub fn key(method: Method, base_url: Option<&str>, path: &str, arguments: Option<&Value>) -> String {
        let arguments = arguments.map(Value::to_string).unwrap_or_default();
        let identity = format!(
            "Method:{} Host:{} Url:{} Argument:{}",
            method,
            base_url.unwrap_or_default(),
            path,
            arguments
        );
        hex::encode(Sha256::digest(identity.as_bytes()))
    }

    /// Load and validate the entry at `key`
    pub async fn load(
        &self,
        key: &str,
        policy: &CachePolicy,
        serializer: ResponseSerializer,
    ) -> Result<Arc<ResponsePayload>> {
        if policy.ttl_secs < 0 {
            return Err(CacheError::InvalidTtl);
        }

        self.wait_for_write(key).await;

        let record = self.backend.get(key).await?.ok_or(CacheError::InvalidData)?;
        let metadata = CacheMetadata::decode(record.metadata.clone())
            .map_err(|_| CacheError::InvalidMetadata)?;

        if let Err(e) = metadata.check(policy, &self.app_version, Utc::now()) {
            if e.invalidates_entry() {
                debug!(key, reason = %e, "Removing stale cache entry");
                if let Err(remove_err) = self.backend.remove(key).await {
                    warn!(key, error = %remove_err, "Failed to remove stale cache entry");
                }
            }
            return Err(e);
        }

        let payload = ResponsePayload::from_cache(record.payload, metadata.string_encoding);
        let decodes = match serializer {
            ResponseSerializer::Raw => true,
            ResponseSerializer::Text => payload.text().is_some(),
            ResponseSerializer::Json => payload.json().is_some(),
        };
        if !decodes {
            return Err(CacheError::InvalidData);
        }

        Ok(Arc::new(payload))
    }

    /// Persist `payload` under `key`. No-op when caching is disabled for
    /// `policy` or the payload itself came from the cache.
    pub async fn save(&self, key: &str, policy: &CachePolicy, payload: &ResponsePayload) -> Result<()> {
        if policy.ttl_secs <= 0 || payload.is_from_cache() {
            return Ok(());
        }
        let metadata = CacheMetadata::stamp(policy, payload.encoding(), &self.app_version);
        self.write_entry(key, payload.data().clone(), &metadata).await
    }

    /// Run [`save`](Self::save) in the background. Loads of the same key wait
    /// for it to land.
    pub fn save_in_background(&self, key: String, policy: CachePolicy, payload: Arc<ResponsePayload>) {
        if policy.ttl_secs <= 0 || payload.is_from_cache() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);
        // Writes to one key land in the order they were issued
        let previous = self
            .pending
            .lock()
            .insert(
                key.clone(),
                PendingWrite {
                    generation,
                    done: done_rx,
                },
            )
            .map(|write| write.done);

        let store = self.clone();
        tokio::spawn(async move {
            if let Some(mut previous) = previous {
                let _ = previous.wait_for(|finished| *finished).await;
            }
            if let Err(e) = store.save(&key, &policy, &payload).await {
                error!(key, error = %e, "Background cache write failed");
            }
            done_tx.send_replace(true);

            let mut pending = store.pending.lock();
            if pending.get(&key).is_some_and(|w| w.generation == generation) {
                pending.remove(&key);
            }
        });
    }

    /// Low-level write with caller-supplied metadata
    pub async fn write_entry(&self, key: &str, payload: Bytes, metadata: &CacheMetadata) -> Result<()> {
        let record = CacheRecord {
            payload,
            metadata: Bytes::from(metadata.encode_to_vec()),
        };
        self.backend.put(key, record).await
    }

    /// Stored metadata of `key`, without validation
    pub async fn read_metadata(&self, key: &str) -> Result<Option<CacheMetadata>> {
        match self.backend.get(key).await? {
            Some(record) => CacheMetadata::decode(record.metadata)
                .map(Some)
                .map_err(|_| CacheError::InvalidMetadata),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(key).await
    }

    /// Wait until every write to `key` started so far has finished
    pub async fn wait_for_write(&self, key: &str) {
        let done = self.pending.lock().get(key).map(|w| w.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}
