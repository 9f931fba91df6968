//! Count & Statistics Registry (spec §4.3). O(1) in-memory counters
//! sized to the closed 31-noun/40-verb tag set, flushed to durable
//! storage on a debounced schedule (no sooner than 5s, no later than
//! 30s after the first dirty mark — plus a critical flush on shutdown).
//! Cold starts prefer the on-disk snapshot; [`StatsRegistry::open`]
//! wires the absent-snapshot case to a bounded-sample recompute.
//!
//! Grounded in the teacher's `reconciler.rs` (background thread gated by
//! an `AtomicBool`, periodic disk flush of in-memory counters).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::lock::DistributedLockManager;
use crate::lock::LockSubstrate;
use crate::model::{NounType, Statistics, VerbType};
use crate::path::PathScheme;
use crate::raw_io::RawObjectIo;

pub(crate) const MIN_FLUSH_INTERVAL_MS: i64 = 5_000;
pub(crate) const MAX_DIRTY_AGE_MS: i64 = 30_000;
const STATS_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(15);

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64
}

/// How a flush reconciles in-memory counters with whatever is already
/// durable. The filesystem adapter has no concurrent-writer problem
/// (single root, one process-local registry) so it simply overwrites;
/// the object-store adapter may share a bucket with other instances, so
/// it merges by element-wise max under a short-lived lock (spec §4.9).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    Overwrite,
    MaxMerge,
}

struct Counters {
    noun: [AtomicU64; NounType::COUNT],
    verb: [AtomicU64; VerbType::COUNT],
    noun_metadata: [AtomicU64; NounType::COUNT],
    verb_metadata: [AtomicU64; VerbType::COUNT],
    hnsw_index_size: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            noun: std::array::from_fn(|_| AtomicU64::new(0)),
            verb: std::array::from_fn(|_| AtomicU64::new(0)),
            noun_metadata: std::array::from_fn(|_| AtomicU64::new(0)),
            verb_metadata: std::array::from_fn(|_| AtomicU64::new(0)),
            hnsw_index_size: AtomicU64::new(0),
        }
    }
}

pub struct StatsRegistry<S: LockSubstrate> {
    substrate: Arc<S>,
    counters: Counters,
    dirty: AtomicBool,
    first_dirty_at_ms: AtomicI64,
    last_flush_at_ms: AtomicI64,
    strategy: FlushStrategy,
    lock_manager: DistributedLockManager<S>,
    flush_mutex: AsyncMutex<()>,
}

impl<S: LockSubstrate> StatsRegistry<S> {
    pub fn new(substrate: Arc<S>, strategy: FlushStrategy) -> Self {
        let lock_manager = DistributedLockManager::new(substrate.clone());
        Self {
            substrate,
            counters: Counters::default(),
            dirty: AtomicBool::new(false),
            first_dirty_at_ms: AtomicI64::new(0),
            last_flush_at_ms: AtomicI64::new(0),
            strategy,
            lock_manager,
            flush_mutex: AsyncMutex::new(()),
        }
    }

    fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.first_dirty_at_ms.store(now_millis(), Ordering::Relaxed);
        }
    }

    pub fn increment_noun(&self, ty: NounType) {
        self.counters.noun[ty.index()].fetch_add(1, Ordering::Relaxed);
        self.mark_dirty();
    }

    pub fn decrement_noun(&self, ty: NounType) {
        self.counters.noun[ty.index()].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        }).ok();
        self.mark_dirty();
    }

    pub fn increment_verb(&self, ty: VerbType) {
        self.counters.verb[ty.index()].fetch_add(1, Ordering::Relaxed);
        self.mark_dirty();
    }

    pub fn decrement_verb(&self, ty: VerbType) {
        self.counters.verb[ty.index()].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        }).ok();
        self.mark_dirty();
    }

    pub fn increment_noun_metadata(&self, ty: NounType) {
        self.counters.noun_metadata[ty.index()].fetch_add(1, Ordering::Relaxed);
        self.mark_dirty();
    }

    pub fn decrement_noun_metadata(&self, ty: NounType) {
        self.counters.noun_metadata[ty.index()]
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .ok();
        self.mark_dirty();
    }

    pub fn increment_verb_metadata(&self, ty: VerbType) {
        self.counters.verb_metadata[ty.index()].fetch_add(1, Ordering::Relaxed);
        self.mark_dirty();
    }

    pub fn decrement_verb_metadata(&self, ty: VerbType) {
        self.counters.verb_metadata[ty.index()]
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .ok();
        self.mark_dirty();
    }

    pub fn set_hnsw_index_size(&self, size: u64) {
        self.counters.hnsw_index_size.store(size, Ordering::Relaxed);
        self.mark_dirty();
    }

    /// Current in-memory view, regardless of flush state.
    pub fn snapshot(&self) -> Statistics {
        let mut noun_count = std::collections::BTreeMap::new();
        let mut metadata_count = std::collections::BTreeMap::new();
        let mut total_nodes = 0u64;
        let mut total_metadata = 0u64;
        for t in NounType::ALL {
            let n = self.counters.noun[t.index()].load(Ordering::Relaxed);
            let m = self.counters.noun_metadata[t.index()].load(Ordering::Relaxed);
            noun_count.insert(t.as_tag().to_string(), n);
            metadata_count.insert(t.as_tag().to_string(), m);
            total_nodes += n;
            total_metadata += m;
        }
        let mut verb_count = std::collections::BTreeMap::new();
        let mut total_edges = 0u64;
        for t in VerbType::ALL {
            let n = self.counters.verb[t.index()].load(Ordering::Relaxed);
            let m = self.counters.verb_metadata[t.index()].load(Ordering::Relaxed);
            verb_count.insert(t.as_tag().to_string(), n);
            metadata_count.insert(t.as_tag().to_string(), m);
            total_edges += n;
            total_metadata += m;
        }
        Statistics {
            noun_count,
            verb_count,
            metadata_count,
            hnsw_index_size: self.counters.hnsw_index_size.load(Ordering::Relaxed),
            total_nodes,
            total_edges,
            total_metadata,
            last_updated: chrono::Utc::now(),
        }
    }

    fn is_flush_due(&self) -> bool {
        if !self.dirty.load(Ordering::Relaxed) {
            return false;
        }
        let now = now_millis();
        let since_last_flush = now - self.last_flush_at_ms.load(Ordering::Relaxed);
        let dirty_age = now - self.first_dirty_at_ms.load(Ordering::Relaxed);
        since_last_flush >= MIN_FLUSH_INTERVAL_MS || dirty_age >= MAX_DIRTY_AGE_MS
    }

    /// Debounced flush: a no-op unless §4.3's window has elapsed. Call
    /// this from a periodic background task; also call it (bypassing
    /// the debounce via `force=true`) on graceful shutdown.
    pub async fn maybe_flush(&self, force: bool) {
        if !force && !self.is_flush_due() {
            return;
        }
        if !self.dirty.load(Ordering::Relaxed) && !force {
            return;
        }
        let _guard = self.flush_mutex.lock().await;
        let snapshot = self.snapshot();
        match self.strategy {
            FlushStrategy::Overwrite => {
                if let Err(e) = self.flush_overwrite(&snapshot).await {
                    warn!(error = %e, "statistics flush failed; dirty flag retained");
                    return;
                }
                self.dirty.store(false, Ordering::Release);
                self.last_flush_at_ms.store(now_millis(), Ordering::Relaxed);
            }
            FlushStrategy::MaxMerge => {
                let Some(lock_value) = self.lock_manager.acquire("statistics-flush", STATS_LOCK_TTL).await
                else {
                    debug!("statistics flush lock contended; staying dirty");
                    return;
                };
                let result = self.flush_max_merge(&snapshot).await;
                self.lock_manager.release("statistics-flush", Some(&lock_value)).await;
                match result {
                    Ok(()) => {
                        self.dirty.store(false, Ordering::Release);
                        self.last_flush_at_ms.store(now_millis(), Ordering::Relaxed);
                    }
                    Err(e) => warn!(error = %e, "statistics merge-flush failed; dirty flag retained"),
                }
            }
        }
    }

    async fn flush_overwrite(&self, snapshot: &Statistics) -> Result<(), crate::error::StorageError> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.substrate.write_raw(PathScheme::COUNTS_SNAPSHOT, &bytes).await
    }

    async fn flush_max_merge(&self, snapshot: &Statistics) -> Result<(), crate::error::StorageError> {
        let key = PathScheme::daily_statistics(chrono::Utc::now().date_naive());
        let existing = self
            .substrate
            .read_raw(&key)
            .await?
            .and_then(|b| serde_json::from_slice::<Statistics>(&b).ok());
        let merged = merge_max(existing, snapshot.clone());
        let bytes = serde_json::to_vec(&merged)?;
        self.substrate.write_raw(&key, &bytes).await?;
        // Optional dual-write to the legacy key for older readers (spec §4.9).
        if let Err(e) = self.substrate.write_raw(PathScheme::LEGACY_STATISTICS, &bytes).await {
            debug!(error = %e, "legacy statistics dual-write failed (non-fatal)");
        }
        Ok(())
    }

    /// On load: prefer the on-disk snapshot; only recompute by sampling
    /// when it's absent (spec §4.3). `sample_counts` is only invoked (and
    /// only then awaited) when no snapshot exists.
    pub async fn load_or_sample<F, Fut>(&self, sample_counts: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Statistics>,
    {
        let existing = match self.strategy {
            FlushStrategy::Overwrite => self
                .substrate
                .read_raw(PathScheme::COUNTS_SNAPSHOT)
                .await
                .ok()
                .flatten(),
            FlushStrategy::MaxMerge => {
                let key = PathScheme::daily_statistics(chrono::Utc::now().date_naive());
                self.substrate.read_raw(&key).await.ok().flatten()
            }
        };
        let stats = match existing.and_then(|b| serde_json::from_slice::<Statistics>(&b).ok()) {
            Some(s) => s,
            None => sample_counts().await,
        };
        self.restore(&stats);
    }

    /// Cold-start constructor wiring `load_or_sample` to an actual
    /// bounded-sample recompute over `store` when no snapshot is found.
    /// `store` and `substrate` are typically the same adapter; they are
    /// taken separately because the lock/snapshot substrate only needs
    /// [`LockSubstrate`] while sampling needs the full [`EntityStore`].
    pub async fn open<St>(substrate: Arc<S>, strategy: FlushStrategy, store: &St) -> Self
    where
        St: crate::storage::EntityStore,
    {
        let registry = Self::new(substrate, strategy);
        registry.load_or_sample(|| sample_and_extrapolate(store)).await;
        registry
    }

    fn restore(&self, stats: &Statistics) {
        for t in NounType::ALL {
            if let Some(v) = stats.noun_count.get(t.as_tag()) {
                self.counters.noun[t.index()].store(*v, Ordering::Relaxed);
            }
            if let Some(v) = stats.metadata_count.get(t.as_tag()) {
                self.counters.noun_metadata[t.index()].store(*v, Ordering::Relaxed);
            }
        }
        for t in VerbType::ALL {
            if let Some(v) = stats.verb_count.get(t.as_tag()) {
                self.counters.verb[t.index()].store(*v, Ordering::Relaxed);
            }
            if let Some(v) = stats.metadata_count.get(t.as_tag()) {
                self.counters.verb_metadata[t.index()].store(*v, Ordering::Relaxed);
            }
        }
        self.counters
            .hnsw_index_size
            .store(stats.hnsw_index_size, Ordering::Relaxed);
    }
}

/// Counts one type/category bucket. Listing is a metadata-only
/// operation so counting every path in the bucket is cheap regardless
/// of size; what's actually bounded to `min(100, total)` is reading and
/// parsing object bodies, which is the only way to tell a corrupt entry
/// from a live one. The fraction of readable entries found in that
/// bounded sample is extrapolated across the full listed total.
async fn sample_count(store: &impl crate::storage::StoragePrimitives, prefix: &str) -> u64 {
    let paths = store.list_prefix(prefix).await.unwrap_or_default();
    let total = paths.len() as u64;
    let sample_size = (total as usize).min(100);
    if sample_size == 0 {
        return 0;
    }
    if sample_size as u64 == total {
        return total;
    }
    let mut readable = 0u64;
    for p in paths.iter().take(sample_size) {
        if store.read_object(p).await.ok().flatten().is_some() {
            readable += 1;
        }
    }
    ((readable as f64 / sample_size as f64) * total as f64).round() as u64
}

/// Bounded-sample recompute used when no statistics snapshot exists on
/// load (spec §4.3).
async fn sample_and_extrapolate<St: crate::storage::EntityStore>(store: &St) -> Statistics {
    use crate::model::EntityKind;
    use crate::path::{ObjectCategory, PathScheme};
    use std::collections::BTreeMap;

    let mut noun_count = BTreeMap::new();
    let mut metadata_count = BTreeMap::new();
    let mut total_nodes = 0u64;
    let mut total_metadata = 0u64;
    for t in NounType::ALL {
        let vectors_prefix = PathScheme::type_prefix(EntityKind::Noun, t.as_tag(), ObjectCategory::Vectors);
        let metadata_prefix = PathScheme::type_prefix(EntityKind::Noun, t.as_tag(), ObjectCategory::Metadata);
        let n = sample_count(store, &vectors_prefix).await;
        let m = sample_count(store, &metadata_prefix).await;
        noun_count.insert(t.as_tag().to_string(), n);
        metadata_count.insert(t.as_tag().to_string(), m);
        total_nodes += n;
        total_metadata += m;
    }
    let mut verb_count = BTreeMap::new();
    let mut total_edges = 0u64;
    for t in VerbType::ALL {
        let vectors_prefix = PathScheme::type_prefix(EntityKind::Verb, t.as_tag(), ObjectCategory::Vectors);
        let metadata_prefix = PathScheme::type_prefix(EntityKind::Verb, t.as_tag(), ObjectCategory::Metadata);
        let n = sample_count(store, &vectors_prefix).await;
        let m = sample_count(store, &metadata_prefix).await;
        verb_count.insert(t.as_tag().to_string(), n);
        metadata_count.insert(t.as_tag().to_string(), m);
        total_edges += n;
        total_metadata += m;
    }
    Statistics {
        noun_count,
        verb_count,
        metadata_count,
        hnsw_index_size: 0,
        total_nodes,
        total_edges,
        total_metadata,
        last_updated: chrono::Utc::now(),
    }
}

/// Element-wise max of two counter maps plus the newer `lastUpdated`
/// (spec §4.9, §9 "Open questions" — documented under-count risk kept
/// as-is; see DESIGN.md).
fn merge_max(existing: Option<Statistics>, local: Statistics) -> Statistics {
    let Some(existing) = existing else { return local };
    let merge_map = |a: std::collections::BTreeMap<String, u64>, b: std::collections::BTreeMap<String, u64>| {
        let mut out = a;
        for (k, v) in b {
            out.entry(k).and_modify(|e| *e = (*e).max(v)).or_insert(v);
        }
        out
    };
    Statistics {
        noun_count: merge_map(existing.noun_count, local.noun_count),
        verb_count: merge_map(existing.verb_count, local.verb_count),
        metadata_count: merge_map(existing.metadata_count, local.metadata_count),
        hnsw_index_size: existing.hnsw_index_size.max(local.hnsw_index_size),
        total_nodes: existing.total_nodes.max(local.total_nodes),
        total_edges: existing.total_edges.max(local.total_edges),
        total_metadata: existing.total_metadata.max(local.total_metadata),
        last_updated: existing.last_updated.max(local.last_updated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use crate::error::StorageError;

    struct MemSubstrate(DashMap<String, Vec<u8>>);

    #[async_trait]
    impl RawObjectIo for MemSubstrate {
        async fn read_raw(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(self.0.get(path).map(|v| v.clone()))
        }
        async fn write_raw(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
            self.0.insert(path.to_string(), bytes.to_vec());
            Ok(())
        }
        async fn remove_raw(&self, path: &str) -> Result<(), StorageError> {
            self.0.remove(path);
            Ok(())
        }
        async fn list_raw(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            Ok(self.0.iter().map(|e| e.key().clone()).filter(|k| k.starts_with(prefix)).collect())
        }
    }
    impl LockSubstrate for MemSubstrate {
        fn lock_path(&self, key: &str) -> String {
            crate::path::PathScheme::object_lock(key)
        }
    }

    #[test]
    fn increment_decrement_nets_to_pre_state() {
        let sub = Arc::new(MemSubstrate(DashMap::new()));
        let reg = StatsRegistry::new(sub, FlushStrategy::Overwrite);
        reg.increment_noun(NounType::Person);
        reg.decrement_noun(NounType::Person);
        assert_eq!(reg.snapshot().noun_count["person"], 0);
    }

    #[tokio::test]
    async fn force_flush_persists_overwrite_snapshot() {
        let sub = Arc::new(MemSubstrate(DashMap::new()));
        let reg = StatsRegistry::new(sub.clone(), FlushStrategy::Overwrite);
        reg.increment_noun(NounType::Task);
        reg.maybe_flush(true).await;
        let bytes = sub.read_raw(PathScheme::COUNTS_SNAPSHOT).await.unwrap().unwrap();
        let stats: Statistics = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stats.noun_count["task"], 1);
    }

    #[tokio::test]
    async fn open_samples_existing_entities_when_no_snapshot_exists() {
        use crate::memory_adapter::MemoryAdapter;
        use crate::model::{EntityId, LevelConnections, Noun};
        use crate::storage::EntityStore;

        let store = Arc::new(MemoryAdapter::new());
        for i in 0..3 {
            let noun = Noun {
                id: format!("ab{i:04}"),
                vector: vec![0.0],
                connections: LevelConnections::new(),
                level: 0,
            };
            store.save_noun(NounType::Person, &noun).await.unwrap();
        }
        let _ = EntityId::parse("ab0000").unwrap();

        let reg = StatsRegistry::open(store.clone(), FlushStrategy::Overwrite, store.as_ref()).await;
        assert_eq!(reg.snapshot().noun_count["person"], 3);
    }

    #[tokio::test]
    async fn open_prefers_an_existing_snapshot_over_sampling() {
        use crate::memory_adapter::MemoryAdapter;
        use crate::model::{LevelConnections, Noun};
        use crate::storage::EntityStore;

        let store = Arc::new(MemoryAdapter::new());
        store
            .save_noun(
                NounType::Person,
                &Noun { id: "ab0000".to_string(), vector: vec![0.0], connections: LevelConnections::new(), level: 0 },
            )
            .await
            .unwrap();

        let seed = StatsRegistry::new(store.clone(), FlushStrategy::Overwrite);
        seed.increment_noun(NounType::Person);
        seed.increment_noun(NounType::Person);
        seed.maybe_flush(true).await;

        let reg = StatsRegistry::open(store.clone(), FlushStrategy::Overwrite, store.as_ref()).await;
        assert_eq!(reg.snapshot().noun_count["person"], 2);
    }

    #[tokio::test]
    async fn max_merge_keeps_larger_of_two_writers() {
        let sub = Arc::new(MemSubstrate(DashMap::new()));
        let reg_a = StatsRegistry::new(sub.clone(), FlushStrategy::MaxMerge);
        let reg_b = StatsRegistry::new(sub.clone(), FlushStrategy::MaxMerge);
        for _ in 0..5 {
            reg_a.increment_noun(NounType::Event);
        }
        for _ in 0..3 {
            reg_b.increment_noun(NounType::Event);
        }
        reg_a.maybe_flush(true).await;
        reg_b.maybe_flush(true).await;
        let key = PathScheme::daily_statistics(chrono::Utc::now().date_naive());
        let bytes = sub.read_raw(&key).await.unwrap().unwrap();
        let stats: Statistics = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stats.noun_count["event"], 5);
    }
}
