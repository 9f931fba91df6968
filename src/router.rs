//! Type-Aware Router (spec §4.10): decorates an [`EntityStore`] so
//! callers that only have an id (no type) can still reach it, by
//! remembering which type bucket each id landed in and, on a cache
//! miss, probing every bucket in the closed type set sequentially.
//! Also keeps the per-type counters this overlay owns (fixed-size
//! arrays indexed by enum tag) and flushes periodic snapshots to
//! `_system/type-statistics.json`, on the same debounce window as the
//! Count & Statistics Registry.
//!
//! Grounded in the teacher's `namespace_manager.rs` (a process-local
//! `DashMap` mapping a key to the namespace that owns it, populated
//! lazily on first touch).

use std::array;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::codec::Codec;
use crate::error::StorageError;
use crate::model::{EntityId, EntityKind, Noun, NounType, StorageStatus, TypeStatistics, Verb, VerbType};
use crate::stats::{now_millis, MAX_DIRTY_AGE_MS, MIN_FLUSH_INTERVAL_MS};
use crate::storage::{EntityStore, StoragePrimitives};

/// Process-local id -> type cache. Never persisted; a cold process
/// always starts with an empty cache and rebuilds it from lookups
/// (spec §4.10 "cache is an optimization, not a source of truth").
pub struct TypeAwareRouter<S: EntityStore> {
    inner: Arc<S>,
    noun_cache: DashMap<String, NounType>,
    verb_cache: DashMap<String, VerbType>,
    noun_counts: [AtomicU64; NounType::COUNT],
    verb_counts: [AtomicU64; VerbType::COUNT],
    counters_dirty: AtomicBool,
    counters_first_dirty_at_ms: AtomicI64,
    counters_last_flush_at_ms: AtomicI64,
}

impl<S: EntityStore> TypeAwareRouter<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            noun_cache: DashMap::new(),
            verb_cache: DashMap::new(),
            noun_counts: array::from_fn(|_| AtomicU64::new(0)),
            verb_counts: array::from_fn(|_| AtomicU64::new(0)),
            counters_dirty: AtomicBool::new(false),
            counters_first_dirty_at_ms: AtomicI64::new(0),
            counters_last_flush_at_ms: AtomicI64::new(0),
        }
    }

    fn mark_counters_dirty(&self) {
        if !self.counters_dirty.swap(true, Ordering::SeqCst) {
            self.counters_first_dirty_at_ms.store(now_millis(), Ordering::SeqCst);
        }
    }

    /// Snapshots the current per-type counters into the on-wire shape
    /// persisted at `_system/type-statistics.json` (spec §4.10).
    pub fn type_statistics_snapshot(&self) -> TypeStatistics {
        let mut noun_counts = std::collections::BTreeMap::new();
        for ty in NounType::ALL {
            let n = self.noun_counts[ty.index()].load(Ordering::SeqCst);
            if n > 0 {
                noun_counts.insert(ty.as_tag().to_string(), n);
            }
        }
        let mut verb_counts = std::collections::BTreeMap::new();
        for ty in VerbType::ALL {
            let n = self.verb_counts[ty.index()].load(Ordering::SeqCst);
            if n > 0 {
                verb_counts.insert(ty.as_tag().to_string(), n);
            }
        }
        TypeStatistics {
            noun_counts,
            verb_counts,
            last_updated: chrono::Utc::now(),
        }
    }

    /// Persists the per-type counter snapshot if the debounce window has
    /// elapsed (same 5s/30s window as the Count & Statistics Registry;
    /// `force` bypasses it for a graceful-shutdown flush).
    pub async fn maybe_flush_type_statistics(&self, force: bool) -> Result<(), StorageError> {
        if !force && !self.is_type_statistics_flush_due() {
            return Ok(());
        }
        if !self.counters_dirty.load(Ordering::SeqCst) && !force {
            return Ok(());
        }
        let snapshot = self.type_statistics_snapshot();
        let value = serde_json::to_value(&snapshot)?;
        self.inner.write_object(crate::path::PathScheme::TYPE_STATISTICS, &value).await?;
        self.counters_dirty.store(false, Ordering::SeqCst);
        self.counters_last_flush_at_ms.store(now_millis(), Ordering::SeqCst);
        Ok(())
    }

    fn is_type_statistics_flush_due(&self) -> bool {
        if !self.counters_dirty.load(Ordering::SeqCst) {
            return false;
        }
        let now = now_millis();
        let since_last_flush = now - self.counters_last_flush_at_ms.load(Ordering::SeqCst);
        let dirty_age = now - self.counters_first_dirty_at_ms.load(Ordering::SeqCst);
        since_last_flush >= MIN_FLUSH_INTERVAL_MS || dirty_age >= MAX_DIRTY_AGE_MS
    }

    pub fn cached_noun_types(&self) -> usize {
        self.noun_cache.len()
    }

    pub fn cached_verb_types(&self) -> usize {
        self.verb_cache.len()
    }

    /// Resolves a noun's type, consulting the cache first and falling
    /// back to an O(T) sequential probe of every noun type bucket
    /// (spec §4.10). Populates the cache on a successful probe.
    pub async fn resolve_noun_type(&self, id: &EntityId) -> Result<Option<NounType>, StorageError> {
        if let Some(ty) = self.noun_cache.get(id.as_str()) {
            return Ok(Some(*ty));
        }
        for ty in NounType::ALL {
            if self.inner.get_noun(ty, id).await?.is_some() {
                self.noun_cache.insert(id.as_str().to_string(), ty);
                return Ok(Some(ty));
            }
        }
        Ok(None)
    }

    pub async fn resolve_verb_type(&self, id: &EntityId) -> Result<Option<VerbType>, StorageError> {
        if let Some(ty) = self.verb_cache.get(id.as_str()) {
            return Ok(Some(*ty));
        }
        for ty in VerbType::ALL {
            if self.inner.get_verb(ty, id).await?.is_some() {
                self.verb_cache.insert(id.as_str().to_string(), ty);
                return Ok(Some(ty));
            }
        }
        Ok(None)
    }

    /// `getNoun(id)` without a known type: resolves then fetches.
    pub async fn get_noun_by_id(&self, id: &EntityId) -> Result<Option<Noun>, StorageError> {
        let Some(ty) = self.resolve_noun_type(id).await? else {
            return Ok(None);
        };
        self.inner.get_noun(ty, id).await
    }

    pub async fn get_verb_by_id(&self, id: &EntityId) -> Result<Option<Verb>, StorageError> {
        let Some(ty) = self.resolve_verb_type(id).await? else {
            return Ok(None);
        };
        self.inner.get_verb(ty, id).await
    }

    /// Saves a noun and records its type in the cache immediately,
    /// avoiding a pointless probe on the very next read.
    pub async fn save_noun(&self, ty: NounType, noun: &Noun) -> Result<(), StorageError> {
        self.inner.save_noun(ty, noun).await?;
        let is_new = self.noun_cache.insert(noun.id.clone(), ty).is_none();
        if is_new {
            self.noun_counts[ty.index()].fetch_add(1, Ordering::SeqCst);
            self.mark_counters_dirty();
            self.maybe_flush_type_statistics(false).await?;
        }
        Ok(())
    }

    pub async fn save_verb(&self, ty: VerbType, verb: &Verb) -> Result<(), StorageError> {
        self.inner.save_verb(ty, verb).await?;
        let is_new = self.verb_cache.insert(verb.id.clone(), ty).is_none();
        if is_new {
            self.verb_counts[ty.index()].fetch_add(1, Ordering::SeqCst);
            self.mark_counters_dirty();
            self.maybe_flush_type_statistics(false).await?;
        }
        Ok(())
    }

    /// Deletes a noun by id, resolving its type first so the cache
    /// entry (now stale) is evicted along with the underlying object.
    pub async fn delete_noun_by_id(&self, id: &EntityId) -> Result<(), StorageError> {
        if let Some(ty) = self.resolve_noun_type(id).await? {
            self.inner.delete_noun(ty, id).await?;
            self.noun_counts[ty.index()].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1))).ok();
            self.mark_counters_dirty();
            self.maybe_flush_type_statistics(false).await?;
        }
        self.noun_cache.remove(id.as_str());
        Ok(())
    }

    pub async fn delete_verb_by_id(&self, id: &EntityId) -> Result<(), StorageError> {
        if let Some(ty) = self.resolve_verb_type(id).await? {
            self.inner.delete_verb(ty, id).await?;
            self.verb_counts[ty.index()].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1))).ok();
            self.mark_counters_dirty();
            self.maybe_flush_type_statistics(false).await?;
        }
        self.verb_cache.remove(id.as_str());
        Ok(())
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }
}

/// The router forwards raw storage primitives untouched — it only adds
/// value at the entity-by-id layer above.
#[async_trait]
impl<S: EntityStore> StoragePrimitives for TypeAwareRouter<S> {
    fn codec(&self) -> &Codec {
        self.inner.codec()
    }

    async fn write_object(&self, logical_path: &str, value: &Value) -> Result<(), StorageError> {
        self.inner.write_object(logical_path, value).await
    }

    async fn read_object(&self, logical_path: &str) -> Result<Option<Value>, StorageError> {
        self.inner.read_object(logical_path).await
    }

    async fn delete_object(&self, logical_path: &str) -> Result<(), StorageError> {
        self.inner.delete_object(logical_path).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list_prefix(prefix).await
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.noun_cache.clear();
        self.verb_cache.clear();
        self.inner.clear_all().await
    }

    async fn storage_status(&self) -> Result<StorageStatus, StorageError> {
        self.inner.storage_status().await
    }
}

impl<S: EntityStore> EntityStore for TypeAwareRouter<S> {}
