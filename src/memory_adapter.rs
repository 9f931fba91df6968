//! In-memory adapter: the fourth member of the closed adapter set
//! (`{Memory, Filesystem, ObjectStore, Historical}`, spec §9). Used by
//! this crate's own tests and by embedders who want a storage engine
//! with no durability.
//!
//! Grounded in the teacher's `concurrent_memory.rs` (a `DashMap`-backed
//! store behind `RwLock`-free atomics and dirty tracking), simplified
//! here to a flat key/value map since there is no dirty-to-disk flush
//! to track.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::codec::{Codec, CodecConfig};
use crate::error::StorageError;
use crate::model::StorageStatus;
use crate::raw_io::RawObjectIo;
use crate::storage::{EntityStore, StoragePrimitives};

/// A process-local, non-durable store. Compression is disabled by
/// default (there is no physical file to save bytes on) but the codec
/// is still exercised so behavior matches the durable adapters.
pub struct MemoryAdapter {
    objects: DashMap<String, Vec<u8>>,
    codec: Codec,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            codec: Codec::new(CodecConfig {
                compression: false,
                compression_level: 6,
            }),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawObjectIo for MemoryAdapter {
    async fn read_raw(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.objects.get(path).map(|v| v.clone()))
    }

    async fn write_raw(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.objects.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove_raw(&self, path: &str) -> Result<(), StorageError> {
        self.objects.remove(path);
        Ok(())
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

impl crate::lock::LockSubstrate for MemoryAdapter {
    fn lock_path(&self, key: &str) -> String {
        crate::path::PathScheme::object_lock(key)
    }
}

#[async_trait]
impl StoragePrimitives for MemoryAdapter {
    fn codec(&self) -> &Codec {
        &self.codec
    }

    async fn write_object(&self, logical_path: &str, value: &Value) -> Result<(), StorageError> {
        let bytes = self.codec.encode(value)?;
        self.objects.insert(logical_path.to_string(), bytes);
        Ok(())
    }

    async fn read_object(&self, logical_path: &str) -> Result<Option<Value>, StorageError> {
        match self.objects.get(logical_path) {
            Some(bytes) => Ok(Some(self.codec.decode(logical_path, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_object(&self, logical_path: &str) -> Result<(), StorageError> {
        self.objects.remove(logical_path);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut paths: Vec<String> = self
            .objects
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.objects.clear();
        Ok(())
    }

    async fn storage_status(&self) -> Result<StorageStatus, StorageError> {
        Ok(StorageStatus {
            healthy: true,
            read_only: false,
            cow_enabled: false,
            detail: "in-memory, non-durable".to_string(),
        })
    }
}

impl EntityStore for MemoryAdapter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityId, LevelConnections, Noun, NounType};

    fn sample_noun(id: &str) -> Noun {
        Noun {
            id: id.to_string(),
            vector: vec![0.1, 0.2, 0.3],
            connections: LevelConnections::new(),
            level: 0,
        }
    }

    #[tokio::test]
    async fn round_trips_a_noun() {
        let store = MemoryAdapter::new();
        let noun = sample_noun("ab1234");
        store.save_noun(NounType::Person, &noun).await.unwrap();
        let id = EntityId::parse("ab1234").unwrap();
        let fetched = store.get_noun(NounType::Person, &id).await.unwrap().unwrap();
        assert_eq!(fetched, noun);
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let store = MemoryAdapter::new();
        let noun = sample_noun("ab1234");
        let id = EntityId::parse("ab1234").unwrap();
        store.save_noun(NounType::Person, &noun).await.unwrap();
        store.delete_noun(NounType::Person, &id).await.unwrap();
        assert!(store.get_noun(NounType::Person, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_of_missing_id_is_idempotent() {
        let store = MemoryAdapter::new();
        let id = EntityId::parse("ffffff").unwrap();
        assert!(store.delete_noun(NounType::Person, &id).await.is_ok());
        assert!(store.delete_noun(NounType::Person, &id).await.is_ok());
    }

    #[tokio::test]
    async fn paginates_a_type_bucket() {
        let store = MemoryAdapter::new();
        for i in 0..5 {
            let id = format!("ab{i:04}");
            store.save_noun(NounType::Task, &sample_noun(&id)).await.unwrap();
        }
        let page1 = store.get_nouns_by_type(NounType::Task, None, Some(2)).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert!(page1.has_more);
        let page2 = store
            .get_nouns_by_type(NounType::Task, page1.next_cursor.as_deref(), Some(10))
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 3);
        assert!(!page2.has_more);
    }

    #[tokio::test]
    async fn metadata_batch_skips_corrupt_entries_instead_of_failing() {
        use crate::model::NounMetadata;

        let store = MemoryAdapter::new();
        let good_id = EntityId::parse("ab0001").unwrap();
        let bad_id = EntityId::parse("ab0002").unwrap();
        let meta = NounMetadata {
            noun: "person".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            service: None,
            confidence: None,
            weight: None,
            created_by: None,
            data: None,
            custom: Default::default(),
        };
        store.save_noun_metadata(NounType::Person, &good_id, &meta).await.unwrap();

        let bad_path = crate::path::PathScheme::entity_path(
            crate::model::EntityKind::Noun,
            NounType::Person.as_tag(),
            crate::path::ObjectCategory::Metadata,
            &bad_id,
        );
        store.write_raw(&bad_path, b"not json").await.unwrap();

        let batch = store
            .get_noun_metadata_batch(NounType::Person, &[good_id.clone(), bad_id])
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, good_id);
    }

    #[tokio::test]
    async fn clear_wipes_everything() {
        let store = MemoryAdapter::new();
        store.save_noun(NounType::Person, &sample_noun("ab1234")).await.unwrap();
        store.clear().await.unwrap();
        let id = EntityId::parse("ab1234").unwrap();
        assert!(store.get_noun(NounType::Person, &id).await.unwrap().is_none());
    }
}
