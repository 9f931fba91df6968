//! Sharding & Path Scheme (spec §4.1). The single source of truth for
//! every object path this crate writes or reads — no adapter is allowed
//! to compute a path any other way (invariant 2).

use crate::error::StorageError;
use crate::model::{EntityId, EntityKind};

/// The category of file stored under an entity's type bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectCategory {
    Vectors,
    Metadata,
    Hnsw,
}

impl ObjectCategory {
    fn as_segment(&self) -> &'static str {
        match self {
            ObjectCategory::Vectors => "vectors",
            ObjectCategory::Metadata => "metadata",
            ObjectCategory::Hnsw => "hnsw",
        }
    }
}

/// Fixed single-level sharding depth. Not user-configurable (spec §6
/// `shardingDepth: fixed 1`); kept as a constant rather than a config
/// field so the invariant can't be violated by a caller.
pub const SHARDING_DEPTH: usize = 1;

/// Computes and validates logical object paths. Pure functions only —
/// no I/O, which is what lets every adapter share exactly one
/// implementation of the path surface in spec §6.
pub struct PathScheme;

impl PathScheme {
    /// `entities/{nouns|verbs}/{type}/{vectors|metadata|hnsw}/{ab}/{id}.json`
    pub fn entity_path(
        kind: EntityKind,
        type_tag: &str,
        category: ObjectCategory,
        id: &EntityId,
    ) -> String {
        format!(
            "entities/{}/{}/{}/{}/{}.json",
            kind.as_segment(),
            type_tag,
            category.as_segment(),
            id.shard_prefix(),
            id.as_str(),
        )
    }

    /// `entities/{nouns|verbs}/{type}/{vectors|metadata|hnsw}/{ab}/`
    pub fn shard_prefix(kind: EntityKind, type_tag: &str, category: ObjectCategory, ab: &str) -> String {
        format!(
            "entities/{}/{}/{}/{}/",
            kind.as_segment(),
            type_tag,
            category.as_segment(),
            ab,
        )
    }

    /// `entities/{nouns|verbs}/{type}/{vectors|metadata|hnsw}/`
    pub fn type_prefix(kind: EntityKind, type_tag: &str, category: ObjectCategory) -> String {
        format!(
            "entities/{}/{}/{}/",
            kind.as_segment(),
            type_tag,
            category.as_segment(),
        )
    }

    pub const HNSW_SYSTEM: &'static str = "_system/hnsw-system.json";
    pub const TYPE_STATISTICS: &'static str = "_system/type-statistics.json";
    pub const COUNTS_SNAPSHOT: &'static str = "_system/counts.json";
    pub const LEGACY_STATISTICS: &'static str = "indexes/statistics.json";
    pub const COW_DISABLED_MARKER: &'static str = "_system/cow-disabled";
    pub const MIGRATION_LOCK: &'static str = ".migration-lock";

    pub fn daily_statistics(date: chrono::NaiveDate) -> String {
        format!("_system/statistics_{}.json", date.format("%Y%m%d"))
    }

    pub fn change_log_entry(timestamp: i64, rand_suffix: &str) -> String {
        format!("change-log/{}-{}.json", timestamp, rand_suffix)
    }

    pub const CHANGE_LOG_PREFIX: &'static str = "change-log/";

    pub fn file_lock(key: &str) -> String {
        format!("locks/{}.lock", key)
    }

    pub fn object_lock(key: &str) -> String {
        format!("locks/{}", key)
    }

    /// Validates that `ab` is exactly two lowercase hex characters
    /// (invariant 2); used by adapters detecting legacy layouts and by
    /// [`crate::model::EntityId::parse`] indirectly.
    pub fn validate_shard(ab: &str) -> Result<(), StorageError> {
        if ab.len() == 2 && ab.chars().all(|c| c.is_ascii_hexdigit()) && ab == ab.to_ascii_lowercase() {
            Ok(())
        } else {
            Err(StorageError::InvalidId(ab.to_string()))
        }
    }
}

/// Observed on-disk layout depth, used by the one-shot migration (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutDepth {
    /// No sharding: `entities/{kind}/{type}/{category}/{id}.json`.
    Flat,
    /// Current, fixed layout: `.../{ab}/{id}.json`.
    Single,
    /// Legacy two-level layout: `.../{ab}/{cd}/{id}.json`.
    Double,
}

/// Summary emitted after a migration run (spec §4.1, scenario S5).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub migrated: u64,
    pub skipped: u64,
    pub verified_count: u64,
}

pub use ObjectCategory as Category;
