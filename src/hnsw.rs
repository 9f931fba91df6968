//! HNSW Persistence Surface (spec §4.12, §9 "HNSW algorithm is out of
//! scope"): this crate stores and serves the *graph connections* an
//! HNSW index needs to rebuild itself, and serializes concurrent
//! read-modify-write updates to a single id's connection set. It does
//! not run the nearest-neighbor search algorithm.
//!
//! Grounded in the teacher's `hnsw_container.rs`/`hnsw_persistence.rs`
//! (a per-node lock map plus a single global-state lock), generalized
//! to the spec's noun/verb split and to any [`EntityStore`] backend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::model::{EntityId, EntityKind, HnswRecord, HnswSystemRecord};
use crate::storage::{merge_hnsw_connection, EntityStore};

/// Serializes HNSW read-modify-write cycles. Two independent locking
/// domains: one mutex per entity id (so unrelated nodes never block
/// each other) and one mutex for the single global entry-point/max-level
/// record (spec §4.12 "two mutex domains").
pub struct HnswCoordinator<S: EntityStore> {
    store: Arc<S>,
    node_locks: DashMap<String, Arc<Mutex<()>>>,
    system_lock: Mutex<()>,
}

impl<S: EntityStore> HnswCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            node_locks: DashMap::new(),
            system_lock: Mutex::new(()),
        }
    }

    fn node_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.node_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reads the current record for `id`, without taking its lock —
    /// safe because a single JSON read is already atomic at the storage
    /// layer (spec §4.7 "Atomicity").
    pub async fn get(&self, kind: EntityKind, type_tag: &str, id: &EntityId) -> Result<Option<HnswRecord>, StorageError> {
        self.store.get_hnsw_data(kind, type_tag, id).await
    }

    /// Adds a bidirectional edge between `id` and `peer_id` at `level`,
    /// holding `id`'s node lock for the whole read-modify-write cycle so
    /// concurrent callers for the same id serialize instead of racing
    /// on a stale read (spec §4.12, scenario S6).
    pub async fn link(
        &self,
        kind: EntityKind,
        type_tag: &str,
        id: &EntityId,
        peer_id: &str,
        level: u32,
    ) -> Result<HnswRecord, StorageError> {
        let lock = self.node_lock(id.as_str());
        let _guard = lock.lock().await;
        let existing = self.store.get_hnsw_data(kind, type_tag, id).await?;
        let merged = merge_hnsw_connection(existing, level, peer_id);
        self.store.save_hnsw_data(kind, type_tag, id, &merged).await?;
        Ok(merged)
    }

    pub async fn unlink(
        &self,
        kind: EntityKind,
        type_tag: &str,
        id: &EntityId,
        peer_id: &str,
        level: u32,
    ) -> Result<Option<HnswRecord>, StorageError> {
        let lock = self.node_lock(id.as_str());
        let _guard = lock.lock().await;
        let Some(mut record) = self.store.get_hnsw_data(kind, type_tag, id).await? else {
            return Ok(None);
        };
        record.connections.remove(level, peer_id);
        self.store.save_hnsw_data(kind, type_tag, id, &record).await?;
        Ok(Some(record))
    }

    pub async fn get_system(&self) -> Result<HnswSystemRecord, StorageError> {
        self.store.get_hnsw_system().await
    }

    /// Updates the global entry point / max level under the single
    /// system-wide lock, so two concurrent inserts never interleave a
    /// read and a write of the same record (spec §4.12).
    pub async fn update_system<F>(&self, mutate: F) -> Result<HnswSystemRecord, StorageError>
    where
        F: FnOnce(&mut HnswSystemRecord) + Send,
    {
        let _guard = self.system_lock.lock().await;
        let mut record = self.store.get_hnsw_system().await?;
        mutate(&mut record);
        self.store.save_hnsw_system(&record).await?;
        Ok(record)
    }

    /// Drops cached per-id lock handles that no longer have any other
    /// owner, bounding the coordinator's memory footprint under churn.
    pub fn prune_idle_locks(&self) {
        self.node_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_adapter::MemoryAdapter;
    use crate::model::NounType;

    #[tokio::test]
    async fn link_creates_a_fresh_record_on_first_call() {
        let store = Arc::new(MemoryAdapter::new());
        let coord = HnswCoordinator::new(store);
        let id = EntityId::parse("ab1234").unwrap();
        let record = coord
            .link(EntityKind::Noun, NounType::Person.as_tag(), &id, "peer-1", 0)
            .await
            .unwrap();
        assert_eq!(record.connections.neighbor_count(0), 1);
    }

    #[tokio::test]
    async fn concurrent_links_to_same_id_do_not_lose_updates() {
        let store = Arc::new(MemoryAdapter::new());
        let coord = Arc::new(HnswCoordinator::new(store));
        let id = EntityId::parse("ab1234").unwrap();
        let mut handles = Vec::new();
        for i in 0..20 {
            let coord = coord.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                coord
                    .link(EntityKind::Noun, NounType::Person.as_tag(), &id, &format!("peer-{i}"), 0)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let final_record = coord
            .get(EntityKind::Noun, NounType::Person.as_tag(), &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_record.connections.neighbor_count(0), 20);
    }

    #[tokio::test]
    async fn unlink_removes_only_the_named_peer() {
        let store = Arc::new(MemoryAdapter::new());
        let coord = HnswCoordinator::new(store);
        let id = EntityId::parse("ab1234").unwrap();
        coord.link(EntityKind::Noun, NounType::Person.as_tag(), &id, "a", 0).await.unwrap();
        coord.link(EntityKind::Noun, NounType::Person.as_tag(), &id, "b", 0).await.unwrap();
        let after = coord
            .unlink(EntityKind::Noun, NounType::Person.as_tag(), &id, "a", 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.connections.neighbor_count(0), 1);
    }

    #[tokio::test]
    async fn update_system_persists_entry_point() {
        let store = Arc::new(MemoryAdapter::new());
        let coord = HnswCoordinator::new(store);
        coord
            .update_system(|r| {
                r.entry_point_id = Some("ab1234".to_string());
                r.max_level = 3;
            })
            .await
            .unwrap();
        let record = coord.get_system().await.unwrap();
        assert_eq!(record.entry_point_id.as_deref(), Some("ab1234"));
        assert_eq!(record.max_level, 3);
    }
}
