//! Base Storage Abstraction (spec §4.7): the trait surface every adapter
//! implements, split in two layers.
//!
//! [`StoragePrimitives`] is the narrow, adapter-specific part — read,
//! write, delete, and list JSON objects by logical path, with
//! compression and atomicity handled underneath. [`EntityStore`] is the
//! wide, shared part — every noun/verb/metadata/HNSW/statistics
//! operation the spec names, implemented once as default methods atop
//! [`StoragePrimitives`] so the filesystem and object-store adapters
//! (and the in-memory one used by tests) get them for free.
//!
//! Grounded in the teacher's `storage_trait.rs` (a single trait mixing
//! low-level and entity-level operations); split here because the spec
//! names a closed adapter set (`{Memory, Filesystem, ObjectStore,
//! Historical}`, §9) where the historical adapter overrides every
//! mutating default with `ReadOnly` rather than reimplementing reads.

use async_trait::async_trait;
use dashmap::DashSet;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::codec::Codec;
use crate::error::StorageError;
use crate::model::{
    EntityId, EntityKind, HnswRecord, HnswSystemRecord, LevelConnections, Noun, NounMetadata,
    NounType, Page, Statistics, StorageStatus, Verb, VerbMetadata, VerbType,
};
use crate::path::{ObjectCategory, PathScheme};

/// Paths that have already logged a corrupt-metadata warning this
/// process. A scan revisiting the same shard (e.g. repeated pagination
/// over a type bucket with one bad file) should not re-log every pass.
static CORRUPT_WARNED: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

fn warn_once_corrupt(path: &str, error: &StorageError) {
    if CORRUPT_WARNED.insert(path.to_string()) {
        tracing::warn!(path, error = %error, "skipping corrupt entity during scan");
    }
}

/// Default page size when a caller passes `limit: None` (spec §4.7).
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Which relational endpoint a verb scan filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbEndpoint {
    Source,
    Target,
}

/// Low-level object access. Every method operates on a *logical* path
/// (no `.gz` suffix); the adapter decides physical naming and whether
/// to compress.
#[async_trait]
pub trait StoragePrimitives: Send + Sync {
    fn codec(&self) -> &Codec;

    /// Atomic write: the full body appears or it doesn't, never partial
    /// (spec §4.7 "Atomicity"). Adapters implement this with a
    /// temp-file-then-rename or an equivalent single PUT.
    async fn write_object(&self, logical_path: &str, value: &Value) -> Result<(), StorageError>;

    async fn read_object(&self, logical_path: &str) -> Result<Option<Value>, StorageError>;

    async fn delete_object(&self, logical_path: &str) -> Result<(), StorageError>;

    /// Lists logical paths under `prefix`, already deduplicated across
    /// compressed/plain twins and sorted ascending (spec §4.7).
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Wipes every object this adapter manages (spec §4.11 `clear`).
    async fn clear_all(&self) -> Result<(), StorageError>;

    async fn storage_status(&self) -> Result<StorageStatus, StorageError>;
}

fn paginate(mut sorted: Vec<String>, cursor: Option<&str>, limit: usize) -> (Vec<String>, bool, Option<String>) {
    if let Some(cursor) = cursor {
        let start = sorted.partition_point(|p| p.as_str() <= cursor);
        sorted = sorted.split_off(start);
    }
    let has_more = sorted.len() > limit;
    sorted.truncate(limit);
    let next_cursor = if has_more { sorted.last().cloned() } else { None };
    (sorted, has_more, next_cursor)
}

/// Every noun/verb/metadata/HNSW/statistics operation in spec §3-§4,
/// implemented once atop [`StoragePrimitives`]. The historical adapter
/// is the only implementer that overrides the write half wholesale.
#[async_trait]
pub trait EntityStore: StoragePrimitives {
    async fn save_noun(&self, ty: NounType, noun: &Noun) -> Result<(), StorageError> {
        let id = EntityId::parse(noun.id.clone())?;
        let path = PathScheme::entity_path(EntityKind::Noun, ty.as_tag(), ObjectCategory::Vectors, &id);
        let value = serde_json::to_value(noun)?;
        self.write_object(&path, &value).await
    }

    async fn get_noun(&self, ty: NounType, id: &EntityId) -> Result<Option<Noun>, StorageError> {
        let path = PathScheme::entity_path(EntityKind::Noun, ty.as_tag(), ObjectCategory::Vectors, id);
        match self.read_object(&path).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn delete_noun(&self, ty: NounType, id: &EntityId) -> Result<(), StorageError> {
        let path = PathScheme::entity_path(EntityKind::Noun, ty.as_tag(), ObjectCategory::Vectors, id);
        self.delete_object(&path).await
    }

    async fn save_verb(&self, ty: VerbType, verb: &Verb) -> Result<(), StorageError> {
        let id = EntityId::parse(verb.id.clone())?;
        let path = PathScheme::entity_path(EntityKind::Verb, ty.as_tag(), ObjectCategory::Vectors, &id);
        let value = serde_json::to_value(verb)?;
        self.write_object(&path, &value).await
    }

    async fn get_verb(&self, ty: VerbType, id: &EntityId) -> Result<Option<Verb>, StorageError> {
        let path = PathScheme::entity_path(EntityKind::Verb, ty.as_tag(), ObjectCategory::Vectors, id);
        match self.read_object(&path).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn delete_verb(&self, ty: VerbType, id: &EntityId) -> Result<(), StorageError> {
        let path = PathScheme::entity_path(EntityKind::Verb, ty.as_tag(), ObjectCategory::Vectors, id);
        self.delete_object(&path).await
    }

    async fn save_noun_metadata(&self, ty: NounType, id: &EntityId, meta: &NounMetadata) -> Result<(), StorageError> {
        let path = PathScheme::entity_path(EntityKind::Noun, ty.as_tag(), ObjectCategory::Metadata, id);
        let value = serde_json::to_value(meta)?;
        self.write_object(&path, &value).await
    }

    async fn get_noun_metadata(&self, ty: NounType, id: &EntityId) -> Result<Option<NounMetadata>, StorageError> {
        let path = PathScheme::entity_path(EntityKind::Noun, ty.as_tag(), ObjectCategory::Metadata, id);
        match self.read_object(&path).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn delete_noun_metadata(&self, ty: NounType, id: &EntityId) -> Result<(), StorageError> {
        let path = PathScheme::entity_path(EntityKind::Noun, ty.as_tag(), ObjectCategory::Metadata, id);
        self.delete_object(&path).await
    }

    async fn save_verb_metadata(&self, ty: VerbType, id: &EntityId, meta: &VerbMetadata) -> Result<(), StorageError> {
        let path = PathScheme::entity_path(EntityKind::Verb, ty.as_tag(), ObjectCategory::Metadata, id);
        let value = serde_json::to_value(meta)?;
        self.write_object(&path, &value).await
    }

    async fn get_verb_metadata(&self, ty: VerbType, id: &EntityId) -> Result<Option<VerbMetadata>, StorageError> {
        let path = PathScheme::entity_path(EntityKind::Verb, ty.as_tag(), ObjectCategory::Metadata, id);
        match self.read_object(&path).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn delete_verb_metadata(&self, ty: VerbType, id: &EntityId) -> Result<(), StorageError> {
        let path = PathScheme::entity_path(EntityKind::Verb, ty.as_tag(), ObjectCategory::Metadata, id);
        self.delete_object(&path).await
    }

    /// `getMetadataBatch(ids)` (spec §4.7, scenario S6): fetches many
    /// nouns' metadata at once, silently omitting any id whose file is
    /// corrupt rather than failing the whole batch, logging the
    /// omission exactly once per path.
    async fn get_noun_metadata_batch(
        &self,
        ty: NounType,
        ids: &[EntityId],
    ) -> Result<Vec<(EntityId, NounMetadata)>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let path = PathScheme::entity_path(EntityKind::Noun, ty.as_tag(), ObjectCategory::Metadata, id);
            let Some(v) = self.read_object(&path).await? else { continue };
            match serde_json::from_value::<NounMetadata>(v) {
                Ok(meta) => out.push((id.clone(), meta)),
                Err(e) => warn_once_corrupt(&path, &e.into()),
            }
        }
        Ok(out)
    }

    async fn get_verb_metadata_batch(
        &self,
        ty: VerbType,
        ids: &[EntityId],
    ) -> Result<Vec<(EntityId, VerbMetadata)>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let path = PathScheme::entity_path(EntityKind::Verb, ty.as_tag(), ObjectCategory::Metadata, id);
            let Some(v) = self.read_object(&path).await? else { continue };
            match serde_json::from_value::<VerbMetadata>(v) {
                Ok(meta) => out.push((id.clone(), meta)),
                Err(e) => warn_once_corrupt(&path, &e.into()),
            }
        }
        Ok(out)
    }

    /// `getNounsByType` (spec §4.7): one type bucket, paginated.
    async fn get_nouns_by_type(
        &self,
        ty: NounType,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Page<Noun>, StorageError> {
        let prefix = PathScheme::type_prefix(EntityKind::Noun, ty.as_tag(), ObjectCategory::Vectors);
        let paths = self.list_prefix(&prefix).await?;
        let (page_paths, has_more, next_cursor) = paginate(paths, cursor, limit.unwrap_or(DEFAULT_PAGE_SIZE));
        let mut items = Vec::with_capacity(page_paths.len());
        for p in page_paths {
            if let Some(v) = self.read_object(&p).await? {
                match serde_json::from_value(v) {
                    Ok(noun) => items.push(noun),
                    Err(e) => warn_once_corrupt(&p, &e.into()),
                }
            }
        }
        Ok(Page { items, has_more, next_cursor })
    }

    async fn get_verbs_by_type(
        &self,
        ty: VerbType,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Page<Verb>, StorageError> {
        let prefix = PathScheme::type_prefix(EntityKind::Verb, ty.as_tag(), ObjectCategory::Vectors);
        let paths = self.list_prefix(&prefix).await?;
        let (page_paths, has_more, next_cursor) = paginate(paths, cursor, limit.unwrap_or(DEFAULT_PAGE_SIZE));
        let mut items = Vec::with_capacity(page_paths.len());
        for p in page_paths {
            if let Some(v) = self.read_object(&p).await? {
                match serde_json::from_value(v) {
                    Ok(verb) => items.push(verb),
                    Err(e) => warn_once_corrupt(&p, &e.into()),
                }
            }
        }
        Ok(Page { items, has_more, next_cursor })
    }

    /// `getVerbsBySource`/`getVerbsByTarget` have no dedicated index
    /// (spec names none); they probe every verb type bucket in turn,
    /// same O(T) sequential-probe shape as the router's cache miss
    /// (spec §4.10). Acceptable because T is the closed 40-entry set.
    async fn get_verbs_by_source(&self, source_id: &EntityId, limit: usize) -> Result<Vec<Verb>, StorageError> {
        self.scan_verbs_matching(VerbEndpoint::Source, source_id.as_str(), limit).await
    }

    async fn get_verbs_by_target(&self, target_id: &EntityId, limit: usize) -> Result<Vec<Verb>, StorageError> {
        self.scan_verbs_matching(VerbEndpoint::Target, target_id.as_str(), limit).await
    }

    async fn scan_verbs_matching(
        &self,
        endpoint: VerbEndpoint,
        id: &str,
        limit: usize,
    ) -> Result<Vec<Verb>, StorageError> {
        let mut out = Vec::new();
        'outer: for ty in VerbType::ALL {
            let prefix = PathScheme::type_prefix(EntityKind::Verb, ty.as_tag(), ObjectCategory::Vectors);
            for path in self.list_prefix(&prefix).await? {
                let Some(v) = self.read_object(&path).await? else { continue };
                let verb: Verb = match serde_json::from_value(v) {
                    Ok(verb) => verb,
                    Err(e) => {
                        warn_once_corrupt(&path, &e.into());
                        continue;
                    }
                };
                let matches = match endpoint {
                    VerbEndpoint::Source => verb.source_id == id,
                    VerbEndpoint::Target => verb.target_id == id,
                };
                if matches {
                    out.push(verb);
                    if out.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn save_hnsw_data(
        &self,
        kind: EntityKind,
        type_tag: &str,
        id: &EntityId,
        record: &HnswRecord,
    ) -> Result<(), StorageError> {
        let path = PathScheme::entity_path(kind, type_tag, ObjectCategory::Hnsw, id);
        let value = serde_json::to_value(record)?;
        self.write_object(&path, &value).await
    }

    async fn get_hnsw_data(
        &self,
        kind: EntityKind,
        type_tag: &str,
        id: &EntityId,
    ) -> Result<Option<HnswRecord>, StorageError> {
        let path = PathScheme::entity_path(kind, type_tag, ObjectCategory::Hnsw, id);
        match self.read_object(&path).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn save_hnsw_system(&self, record: &HnswSystemRecord) -> Result<(), StorageError> {
        let value = serde_json::to_value(record)?;
        self.write_object(PathScheme::HNSW_SYSTEM, &value).await
    }

    async fn get_hnsw_system(&self) -> Result<HnswSystemRecord, StorageError> {
        match self.read_object(PathScheme::HNSW_SYSTEM).await? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(HnswSystemRecord::default()),
        }
    }

    async fn get_statistics_data(&self) -> Result<Statistics, StorageError> {
        match self.read_object(PathScheme::COUNTS_SNAPSHOT).await? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(Statistics::default()),
        }
    }

    async fn save_statistics_data(&self, stats: &Statistics) -> Result<(), StorageError> {
        let value = serde_json::to_value(stats)?;
        self.write_object(PathScheme::COUNTS_SNAPSHOT, &value).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.clear_all().await
    }

    async fn get_storage_status(&self) -> Result<StorageStatus, StorageError> {
        self.storage_status().await
    }
}

/// Merges a newly-observed HNSW neighbor into an existing record,
/// producing the replacement value a read-modify-write cycle should
/// persist. Shared by the filesystem/object-store adapters' `hnsw.rs`
/// callers so the merge policy lives in one place.
pub fn merge_hnsw_connection(existing: Option<HnswRecord>, level: u32, peer_id: &str) -> HnswRecord {
    let mut record = existing.unwrap_or_else(|| HnswRecord {
        level,
        connections: LevelConnections::new(),
    });
    record.level = record.level.max(level);
    record.connections.insert(level, peer_id.to_string());
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginate_reports_has_more_and_cursor() {
        let items: Vec<String> = (0..10).map(|i| format!("entities/{i:02}")).collect();
        let (page, has_more, cursor) = paginate(items, None, 4);
        assert_eq!(page.len(), 4);
        assert!(has_more);
        assert_eq!(cursor.as_deref(), Some("entities/03"));
    }

    #[test]
    fn paginate_terminates_on_last_page() {
        let items: Vec<String> = (0..3).map(|i| format!("entities/{i:02}")).collect();
        let (page, has_more, cursor) = paginate(items, None, 10);
        assert_eq!(page.len(), 3);
        assert!(!has_more);
        assert!(cursor.is_none());
    }

    #[test]
    fn paginate_resumes_strictly_after_cursor() {
        let items: Vec<String> = (0..5).map(|i| format!("entities/{i:02}")).collect();
        let (page, _, _) = paginate(items, Some("entities/01"), 10);
        assert_eq!(page, vec!["entities/02", "entities/03", "entities/04"]);
    }

    #[test]
    fn merge_hnsw_connection_is_idempotent() {
        let once = merge_hnsw_connection(None, 0, "peer-a");
        let twice = merge_hnsw_connection(Some(once.clone()), 0, "peer-a");
        assert_eq!(once.connections, twice.connections);
    }
}
