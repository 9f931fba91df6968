//! Filesystem Adapter (spec §4.8): the default, zero-dependency-beyond-
//! `tokio::fs` storage backend. One process per root directory is
//! assumed (no cross-process coordination beyond the lease files this
//! crate itself writes under `locks/`).
//!
//! Grounded in the teacher's `hnsw_persistence.rs`/`hnsw_container.rs`
//! (a root directory owning every on-disk artifact, direct `std::fs`
//! save/load); the atomic temp-file-then-rename write path is new.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{Codec, CodecConfig};
use crate::error::StorageError;
use crate::lock::LockSubstrate;
use crate::model::{NounType, StorageStatus, VerbType};
use crate::path::{LayoutDepth, MigrationSummary, ObjectCategory, PathScheme};
use crate::raw_io::RawObjectIo;
use crate::storage::{EntityStore, StoragePrimitives};

/// Records older than this are treated as abandoned and the migration
/// proceeds anyway — a crashed migrator must not wedge the adapter
/// forever (spec §4.1 "self-expiring migration lock").
const MIGRATION_LOCK_MAX_AGE_MS: i64 = 60 * 60 * 1000;

pub struct FsAdapter {
    root: PathBuf,
    codec: Codec,
}

impl FsAdapter {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let adapter = Self {
            root,
            codec: Codec::new(CodecConfig::default()),
        };
        adapter.migrate_legacy_layouts_on_open().await?;
        Ok(adapter)
    }

    /// Detects and migrates every noun/verb type-category bucket that
    /// still uses a legacy layout (spec §4.1: "detect on initialization").
    /// Buckets already on the current layout are left untouched by
    /// `detect_layout_depth` returning `Single` and being skipped.
    async fn migrate_legacy_layouts_on_open(&self) -> Result<(), StorageError> {
        let categories = [ObjectCategory::Vectors, ObjectCategory::Metadata, ObjectCategory::Hnsw];
        for noun_type in NounType::ALL {
            for category in categories {
                let prefix = PathScheme::type_prefix(crate::model::EntityKind::Noun, noun_type.as_tag(), category);
                if self.detect_layout_depth(&prefix).await? != LayoutDepth::Single {
                    self.migrate_layout(&prefix).await?;
                }
            }
        }
        for verb_type in VerbType::ALL {
            for category in categories {
                let prefix = PathScheme::type_prefix(crate::model::EntityKind::Verb, verb_type.as_tag(), category);
                if self.detect_layout_depth(&prefix).await? != LayoutDepth::Single {
                    self.migrate_layout(&prefix).await?;
                }
            }
        }
        Ok(())
    }

    pub fn with_codec_config(root: impl Into<PathBuf>, config: CodecConfig) -> Self {
        Self {
            root: root.into(),
            codec: Codec::new(config),
        }
    }

    fn physical(&self, logical_path: &str) -> PathBuf {
        self.root.join(logical_path)
    }

    /// Writes `bytes` atomically by writing to a sibling temp file and
    /// renaming over the destination — the rename is what makes a
    /// concurrent reader see either the whole old body or the whole new
    /// one, never a partial write (spec §4.7 "Atomicity").
    async fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_alternate_format(&self, logical_path: &str, written_suffix: &str) {
        let alternate = if written_suffix == ".gz" {
            logical_path.to_string()
        } else {
            format!("{logical_path}.gz")
        };
        let _ = fs::remove_file(self.physical(&alternate)).await;
    }

    async fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), StorageError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                Box::pin(self.walk(&path, out)).await?;
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }

    /// Samples the on-disk layout under one type/category bucket to
    /// detect whether it predates the current single-level sharding
    /// scheme (spec §4.1, scenario S5).
    pub async fn detect_layout_depth(&self, type_category_prefix: &str) -> Result<LayoutDepth, StorageError> {
        let mut files = Vec::new();
        self.walk(&self.root.join(type_category_prefix), &mut files).await?;
        for f in &files {
            let rel = f.strip_prefix(type_category_prefix).unwrap_or(f);
            let depth = rel.matches('/').count();
            if depth == 0 {
                return Ok(LayoutDepth::Flat);
            }
            if depth >= 2 {
                return Ok(LayoutDepth::Double);
            }
        }
        Ok(LayoutDepth::Single)
    }

    /// One-shot migration of a legacy layout into the current
    /// single-level shard scheme. Gated by a self-expiring lock file so
    /// two instances never migrate the same root concurrently.
    pub async fn migrate_layout(&self, type_category_prefix: &str) -> Result<MigrationSummary, StorageError> {
        let lock_path = self.physical(PathScheme::MIGRATION_LOCK);
        if !self.try_acquire_migration_lock(&lock_path).await? {
            debug!("migration already in progress, skipping");
            return Ok(MigrationSummary::default());
        }
        let result = self.migrate_layout_inner(type_category_prefix).await;
        let _ = fs::remove_file(&lock_path).await;
        result
    }

    async fn try_acquire_migration_lock(&self, lock_path: &Path) -> Result<bool, StorageError> {
        match fs::metadata(lock_path).await {
            Ok(meta) => {
                let age_ms = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                if age_ms < MIGRATION_LOCK_MAX_AGE_MS {
                    return Ok(false);
                }
                warn!("migration lock stale, reclaiming");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.atomic_write(lock_path, b"{}").await?;
        Ok(true)
    }

    async fn migrate_layout_inner(&self, type_category_prefix: &str) -> Result<MigrationSummary, StorageError> {
        let mut files = Vec::new();
        self.walk(&self.root.join(type_category_prefix), &mut files).await?;
        let mut summary = MigrationSummary::default();
        for f in files {
            let rel = match f.strip_prefix(type_category_prefix) {
                Some(r) => r,
                None => continue,
            };
            let depth = rel.matches('/').count();
            if depth == 1 {
                summary.skipped += 1;
                continue;
            }
            let filename = match rel.rsplit('/').next() {
                Some(n) => n,
                None => continue,
            };
            let id_part = filename.split('.').next().unwrap_or(filename);
            if id_part.len() < 2 {
                summary.skipped += 1;
                continue;
            }
            let shard = &id_part[0..2];
            let new_rel = format!("{type_category_prefix}{shard}/{filename}");
            let old_path = self.physical(&f);
            let new_path = self.physical(&new_rel);
            if fs::metadata(&new_path).await.is_ok() {
                // Destination already migrated by a prior pass; leave it
                // untouched rather than overwrite (duplicate suppression).
                summary.skipped += 1;
                continue;
            }
            if let Some(parent) = new_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&old_path, &new_path).await?;
            summary.migrated += 1;
            if fs::metadata(&new_path).await.is_ok() {
                summary.verified_count += 1;
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl RawObjectIo for FsAdapter {
    async fn read_raw(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.physical(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_raw(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.atomic_write(&self.physical(path), bytes).await
    }

    async fn remove_raw(&self, path: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.physical(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        self.walk(&self.root.join(prefix), &mut out).await?;
        out.sort();
        Ok(out)
    }
}

impl LockSubstrate for FsAdapter {
    fn lock_path(&self, key: &str) -> String {
        PathScheme::file_lock(key)
    }
}

#[async_trait]
impl StoragePrimitives for FsAdapter {
    fn codec(&self) -> &Codec {
        &self.codec
    }

    async fn write_object(&self, logical_path: &str, value: &Value) -> Result<(), StorageError> {
        let bytes = self.codec.encode(value)?;
        let suffix = self.codec.write_suffix();
        let physical_logical = format!("{logical_path}{suffix}");
        self.atomic_write(&self.physical(&physical_logical), &bytes).await?;
        self.remove_alternate_format(logical_path, suffix).await;
        Ok(())
    }

    async fn read_object(&self, logical_path: &str) -> Result<Option<Value>, StorageError> {
        for candidate in self.codec.read_candidates(logical_path) {
            match fs::read(self.physical(&candidate)).await {
                Ok(bytes) => return Ok(Some(self.codec.decode(&candidate, &bytes)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn delete_object(&self, logical_path: &str) -> Result<(), StorageError> {
        for candidate in self.codec.read_candidates(logical_path) {
            match fs::remove_file(self.physical(&candidate)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut raw = Vec::new();
        self.walk(&self.root.join(prefix), &mut raw).await?;
        Ok(Codec::dedup_logical_paths(raw))
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
        self.atomic_write(&self.physical(PathScheme::COW_DISABLED_MARKER), b"{}").await?;
        Ok(())
    }

    async fn storage_status(&self) -> Result<StorageStatus, StorageError> {
        let healthy = fs::metadata(&self.root).await.map(|m| m.is_dir()).unwrap_or(false);
        let cow_disabled = fs::metadata(self.physical(PathScheme::COW_DISABLED_MARKER)).await.is_ok();
        Ok(StorageStatus {
            healthy,
            read_only: false,
            cow_enabled: !cow_disabled,
            detail: format!("filesystem root {}", self.root.display()),
        })
    }
}

impl EntityStore for FsAdapter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityId, LevelConnections, Noun, NounType};
    use tempfile::TempDir;

    async fn adapter() -> (TempDir, FsAdapter) {
        let dir = TempDir::new().unwrap();
        let adapter = FsAdapter::open(dir.path()).await.unwrap();
        (dir, adapter)
    }

    #[tokio::test]
    async fn round_trips_a_noun_through_gzip() {
        let (_dir, store) = adapter().await;
        let noun = Noun {
            id: "ab1234".to_string(),
            vector: vec![0.1, 0.2],
            connections: LevelConnections::new(),
            level: 0,
        };
        store.save_noun(NounType::Person, &noun).await.unwrap();
        let id = EntityId::parse("ab1234").unwrap();
        let fetched = store.get_noun(NounType::Person, &id).await.unwrap().unwrap();
        assert_eq!(fetched, noun);
    }

    #[tokio::test]
    async fn rewrite_cleans_up_the_other_format() {
        let (dir, store) = adapter().await;
        let noun = Noun {
            id: "ab1234".to_string(),
            vector: vec![0.1],
            connections: LevelConnections::new(),
            level: 0,
        };
        store.save_noun(NounType::Person, &noun).await.unwrap();
        let uncompressed = FsAdapter::with_codec_config(
            dir.path(),
            CodecConfig { compression: false, compression_level: 6 },
        );
        uncompressed.save_noun(NounType::Person, &noun).await.unwrap();
        let path_base = PathScheme::entity_path(
            crate::model::EntityKind::Noun,
            NounType::Person.as_tag(),
            crate::path::ObjectCategory::Vectors,
            &EntityId::parse("ab1234").unwrap(),
        );
        assert!(fs::metadata(dir.path().join(&path_base)).await.is_ok());
        assert!(fs::metadata(dir.path().join(format!("{path_base}.gz"))).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent_across_both_formats() {
        let (_dir, store) = adapter().await;
        let id = EntityId::parse("ffffff").unwrap();
        store.delete_noun(NounType::Person, &id).await.unwrap();
        store.delete_noun(NounType::Person, &id).await.unwrap();
    }

    #[tokio::test]
    async fn clear_removes_entities_and_marks_cow_disabled() {
        let (_dir, store) = adapter().await;
        let noun = Noun {
            id: "ab1234".to_string(),
            vector: vec![0.1],
            connections: LevelConnections::new(),
            level: 0,
        };
        store.save_noun(NounType::Person, &noun).await.unwrap();
        store.clear().await.unwrap();
        let id = EntityId::parse("ab1234").unwrap();
        assert!(store.get_noun(NounType::Person, &id).await.unwrap().is_none());
        let status = store.get_storage_status().await.unwrap();
        assert!(!status.cow_enabled);
    }

    #[tokio::test]
    async fn migration_moves_flat_files_into_shard_dirs() {
        let (dir, store) = adapter().await;
        let prefix = PathScheme::type_prefix(
            crate::model::EntityKind::Noun,
            NounType::Person.as_tag(),
            crate::path::ObjectCategory::Vectors,
        );
        let flat_path = dir.path().join(format!("{prefix}ab1234.json"));
        fs::create_dir_all(flat_path.parent().unwrap()).await.unwrap();
        fs::write(&flat_path, b"{}").await.unwrap();
        assert_eq!(store.detect_layout_depth(&prefix).await.unwrap(), LayoutDepth::Flat);
        let summary = store.migrate_layout(&prefix).await.unwrap();
        assert_eq!(summary.migrated, 1);
        assert_eq!(store.detect_layout_depth(&prefix).await.unwrap(), LayoutDepth::Single);
    }

    #[tokio::test]
    async fn migration_leaves_an_existing_destination_untouched() {
        let (dir, store) = adapter().await;
        let prefix = PathScheme::type_prefix(
            crate::model::EntityKind::Noun,
            NounType::Person.as_tag(),
            crate::path::ObjectCategory::Vectors,
        );
        let flat_path = dir.path().join(format!("{prefix}ab1234.json"));
        fs::create_dir_all(flat_path.parent().unwrap()).await.unwrap();
        fs::write(&flat_path, b"{\"flat\":true}").await.unwrap();

        let shard_path = dir.path().join(format!("{prefix}ab/ab1234.json"));
        fs::create_dir_all(shard_path.parent().unwrap()).await.unwrap();
        fs::write(&shard_path, b"{\"already\":\"migrated\"}").await.unwrap();

        let summary = store.migrate_layout(&prefix).await.unwrap();
        assert_eq!(summary.migrated, 0);
        assert_eq!(summary.skipped, 1);
        let contents = fs::read_to_string(&shard_path).await.unwrap();
        assert_eq!(contents, "{\"already\":\"migrated\"}");
        assert!(fs::metadata(&flat_path).await.is_ok());
    }
}
