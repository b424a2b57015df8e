use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

use crate::error::AppError;

use super::store::BlobStore;
use super::types::StoreKey;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    #[instrument(skip(self, blob), fields(key = %key, size = blob.len()))]
    async fn save(&self, key: &StoreKey, blob: Vec<u8>) -> Result<(), AppError> {
        trace!("Saving blob");
        let mut state = self.inner.write().await;
        state.insert(key.as_str().to_string(), blob);

        debug!(total_blobs = state.len(), "Blob saved");

        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn load(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, AppError> {
        trace!("Loading blob");
        let state = self.inner.read().await;
        let blob = state.get(key.as_str()).cloned();

        if let Some(ref bytes) = blob {
            debug!(size = bytes.len(), "Blob found");
        } else {
            debug!("No blob found");
        }

        Ok(blob)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &StoreKey) -> Result<(), AppError> {
        trace!("Deleting blob");
        let removed = self.inner.write().await.remove(key.as_str()).is_some();
        debug!(removed, "Blob deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<StoreKey>, AppError> {
        trace!("Listing blobs");
        let state = self.inner.read().await;
        let keys: Vec<StoreKey> = state
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| StoreKey::from_raw(key.clone()))
            .collect();

        debug!(count = keys.len(), "Blobs listed");

        Ok(keys)
    }
}
