//! Narrow raw byte-level I/O shared by the lock manager, change log, and
//! statistics registry — none of these go through the entity path scheme
//! or the gzip codec (their bodies are small and always plain JSON), but
//! all three need the same read/write/list/delete primitive shape that
//! [`crate::storage::StoragePrimitives`] exposes at the entity level.
//! Every adapter implements this once and reuses it for all three.

use async_trait::async_trait;

use crate::error::StorageError;

#[async_trait]
pub trait RawObjectIo: Send + Sync {
    async fn read_raw(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn write_raw(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn remove_raw(&self, path: &str) -> Result<(), StorageError>;
    async fn list_raw(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
