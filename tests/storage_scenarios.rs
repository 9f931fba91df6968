//! End-to-end scenarios against the in-memory and filesystem adapters,
//! covering the crate's CRUD, routing, HNSW, statistics, migration, and
//! historical-read guarantees.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use embedgraph_storage::fs_adapter::FsAdapter;
use embedgraph_storage::historical::{CommittedTree, HistoricalAdapter};
use embedgraph_storage::lock::DistributedLockManager;
use embedgraph_storage::memory_adapter::MemoryAdapter;
use embedgraph_storage::model::{EntityId, EntityKind, LevelConnections, Noun, NounType};
use embedgraph_storage::raw_io::RawObjectIo;
use embedgraph_storage::router::TypeAwareRouter;
use embedgraph_storage::stats::{FlushStrategy, StatsRegistry};
use embedgraph_storage::{EntityStore, StorageError};
use tempfile::TempDir;

fn sample_noun(id: &str) -> Noun {
    Noun {
        id: id.to_string(),
        vector: vec![0.1, 0.2, 0.3],
        connections: LevelConnections::new(),
        level: 0,
    }
}

/// S1: basic CRUD round trip plus a statistics counter returning to its
/// pre-state value after delete.
#[tokio::test]
async fn basic_crud_round_trip_restores_pre_state_count() {
    let store = Arc::new(MemoryAdapter::new());
    let stats = StatsRegistry::new(store.clone(), FlushStrategy::Overwrite);

    let noun = sample_noun("ab1234");
    store.save_noun(NounType::Task, &noun).await.unwrap();
    stats.increment_noun(NounType::Task);

    let id = EntityId::parse("ab1234").unwrap();
    let fetched = store.get_noun(NounType::Task, &id).await.unwrap();
    assert_eq!(fetched, Some(noun));

    store.delete_noun(NounType::Task, &id).await.unwrap();
    stats.decrement_noun(NounType::Task);
    assert!(store.get_noun(NounType::Task, &id).await.unwrap().is_none());
    assert_eq!(stats.snapshot().noun_count["task"], 0);
}

/// S2: type-by-id probe through a cold router cache still resolves,
/// then serves subsequent lookups from cache.
#[tokio::test]
async fn router_resolves_cold_id_and_then_caches_it() {
    let backing = Arc::new(MemoryAdapter::new());
    backing.save_noun(NounType::Person, &sample_noun("cd5678")).await.unwrap();

    let router = TypeAwareRouter::new(backing);
    assert_eq!(router.cached_noun_types(), 0);

    let id = EntityId::parse("cd5678").unwrap();
    let found = router.get_noun_by_id(&id).await.unwrap();
    assert!(found.is_some());
    assert_eq!(router.cached_noun_types(), 1);

    // Second lookup must not need to re-probe every type bucket; there is
    // no direct GET counter on the in-memory adapter, so this assertion
    // is behavioral: the cached type resolves without clearing the cache.
    assert_eq!(router.resolve_noun_type(&id).await.unwrap(), Some(NounType::Person));
    assert_eq!(router.cached_noun_types(), 1);
}

/// S3: concurrent HNSW links to the same id never lose an update.
#[tokio::test]
async fn concurrent_hnsw_links_reach_full_cardinality() {
    let store = Arc::new(MemoryAdapter::new());
    let coordinator = Arc::new(embedgraph_storage::hnsw::HnswCoordinator::new(store));
    let id = EntityId::parse("ab1234").unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let coordinator = coordinator.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .link(EntityKind::Noun, NounType::Person.as_tag(), &id, &format!("peer-{i}"), 0)
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let record = coordinator
        .get(EntityKind::Noun, NounType::Person.as_tag(), &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.connections.neighbor_count(0), 8);
}

/// S4: two independent registries flushing under max-merge converge on
/// the larger of their two local counts, never the sum or the smaller.
#[tokio::test]
async fn statistics_max_merge_keeps_the_larger_writer() {
    let store = Arc::new(MemoryAdapter::new());
    let a = StatsRegistry::new(store.clone(), FlushStrategy::MaxMerge);
    let b = StatsRegistry::new(store.clone(), FlushStrategy::MaxMerge);

    for _ in 0..5 {
        a.increment_noun(NounType::Document);
    }
    for _ in 0..3 {
        b.increment_noun(NounType::Document);
    }
    a.maybe_flush(true).await;
    b.maybe_flush(true).await;

    let key = embedgraph_storage::path::PathScheme::daily_statistics(chrono::Utc::now().date_naive());
    let bytes = store.read_raw(&key).await.unwrap().unwrap();
    let merged: embedgraph_storage::model::Statistics = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(merged.noun_count["document"], 5);
}

/// Cold start with no prior snapshot samples the existing entities
/// straight off the store rather than starting every counter at zero.
#[tokio::test]
async fn cold_start_statistics_sample_existing_entities() {
    let store = Arc::new(MemoryAdapter::new());
    for i in 0..4 {
        store.save_noun(NounType::Document, &sample_noun(&format!("ab{i:04}"))).await.unwrap();
    }

    let stats = StatsRegistry::open(store.clone(), FlushStrategy::Overwrite, store.as_ref()).await;
    assert_eq!(stats.snapshot().noun_count["document"], 4);
}

/// S5: a legacy flat layout is detected, migrated in one shot, and a
/// second pass over the now-current layout is a no-op.
#[tokio::test]
async fn migration_is_idempotent_after_the_first_pass() {
    let dir = TempDir::new().unwrap();
    let adapter = FsAdapter::open(dir.path()).await.unwrap();
    let prefix = embedgraph_storage::path::PathScheme::type_prefix(
        EntityKind::Noun,
        NounType::Document.as_tag(),
        embedgraph_storage::path::ObjectCategory::Vectors,
    );
    for i in 0..16u32 {
        let id = format!("{i:06x}");
        let path = dir.path().join(format!("{prefix}{id}.json"));
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"{}").await.unwrap();
    }

    let summary = adapter.migrate_layout(&prefix).await.unwrap();
    assert_eq!(summary.migrated, 16);

    let second = adapter.migrate_layout(&prefix).await.unwrap();
    assert_eq!(second.migrated, 0);
    assert_eq!(second.skipped, 16);
}

/// S6: a distributed lock held by one owner cannot be released or
/// re-acquired by another until it expires.
#[tokio::test]
async fn lock_exclusion_blocks_a_second_owner_until_expiry() {
    let store = Arc::new(MemoryAdapter::new());
    let manager = DistributedLockManager::new(store);

    let owner_a = manager.acquire("statistics-flush", std::time::Duration::from_millis(20)).await;
    assert!(owner_a.is_some());
    assert!(manager.acquire("statistics-flush", std::time::Duration::from_secs(30)).await.is_none());

    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    assert!(manager.acquire("statistics-flush", std::time::Duration::from_secs(30)).await.is_some());
}

struct FakeTree {
    commit: String,
    blobs: DashMap<String, Vec<u8>>,
}

#[async_trait]
impl CommittedTree for FakeTree {
    fn commit_id(&self) -> &str {
        &self.commit
    }
    async fn read_blob(&self, logical_path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(logical_path).map(|v| v.clone()))
    }
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.blobs.iter().map(|e| e.key().clone()).filter(|k| k.starts_with(prefix)).collect())
    }
}

/// S7: a write attempt against the historical (read-only) adapter is
/// rejected end to end, not just at the `StoragePrimitives` level.
#[tokio::test]
async fn read_only_rejection_is_the_dedicated_error_variant() {
    let tree = Arc::new(FakeTree { commit: "c1".to_string(), blobs: DashMap::new() });
    let adapter = HistoricalAdapter::new(tree);

    let result = adapter.save_noun(NounType::Person, &sample_noun("ab1234")).await;
    assert!(matches!(result, Err(StorageError::ReadOnly)));
}
