use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;

use super::types::StoreKey;

/// Durable key to binary-blob storage. Implementations are opaque to the rest
/// of the server; any store that can put, get, delete and prefix-list blobs
/// will do.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(&self, key: &StoreKey, blob: Vec<u8>) -> Result<(), AppError>;

    async fn load(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, AppError>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &StoreKey) -> Result<(), AppError>;

    /// Keys starting with `prefix`, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<StoreKey>, AppError>;
}

pub type SharedStore = Arc<dyn BlobStore>;
