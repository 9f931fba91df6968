//! Core data model: nouns, verbs, their metadata, and the HNSW/statistics
//! records that ride alongside them. Mirrors the on-wire JSON bodies in
//! spec §3/§6 exactly — this module has no I/O of its own.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::StorageError;

/// Closed set of 31 noun type tags. New tags require a crate release —
/// the fixed-size counters in [`crate::stats`] are sized to this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NounType {
    Person,
    Organization,
    Location,
    Event,
    Document,
    Concept,
    Product,
    Project,
    Task,
    Meeting,
    Message,
    Email,
    Thread,
    Comment,
    File,
    Image,
    Video,
    Audio,
    Code,
    Repository,
    Issue,
    PullRequest,
    Dataset,
    Model,
    Metric,
    Goal,
    Decision,
    Risk,
    Requirement,
    Skill,
    Tool,
}

impl NounType {
    pub const COUNT: usize = 31;

    pub const ALL: [NounType; Self::COUNT] = [
        NounType::Person,
        NounType::Organization,
        NounType::Location,
        NounType::Event,
        NounType::Document,
        NounType::Concept,
        NounType::Product,
        NounType::Project,
        NounType::Task,
        NounType::Meeting,
        NounType::Message,
        NounType::Email,
        NounType::Thread,
        NounType::Comment,
        NounType::File,
        NounType::Image,
        NounType::Video,
        NounType::Audio,
        NounType::Code,
        NounType::Repository,
        NounType::Issue,
        NounType::PullRequest,
        NounType::Dataset,
        NounType::Model,
        NounType::Metric,
        NounType::Goal,
        NounType::Decision,
        NounType::Risk,
        NounType::Requirement,
        NounType::Skill,
        NounType::Tool,
    ];

    /// Lowercase tag used in paths and JSON (`entities/nouns/{type}/...`).
    pub fn as_tag(&self) -> &'static str {
        match self {
            NounType::Person => "person",
            NounType::Organization => "organization",
            NounType::Location => "location",
            NounType::Event => "event",
            NounType::Document => "document",
            NounType::Concept => "concept",
            NounType::Product => "product",
            NounType::Project => "project",
            NounType::Task => "task",
            NounType::Meeting => "meeting",
            NounType::Message => "message",
            NounType::Email => "email",
            NounType::Thread => "thread",
            NounType::Comment => "comment",
            NounType::File => "file",
            NounType::Image => "image",
            NounType::Video => "video",
            NounType::Audio => "audio",
            NounType::Code => "code",
            NounType::Repository => "repository",
            NounType::Issue => "issue",
            NounType::PullRequest => "pull_request",
            NounType::Dataset => "dataset",
            NounType::Model => "model",
            NounType::Metric => "metric",
            NounType::Goal => "goal",
            NounType::Decision => "decision",
            NounType::Risk => "risk",
            NounType::Requirement => "requirement",
            NounType::Skill => "skill",
            NounType::Tool => "tool",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_tag() == tag)
    }

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).expect("exhaustive")
    }
}

/// Closed set of 40 verb type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerbType {
    RelatesTo,
    Contains,
    PartOf,
    Mentions,
    Authored,
    Owns,
    AssignedTo,
    DependsOn,
    Blocks,
    BlockedBy,
    Follows,
    FollowedBy,
    Likes,
    LikedBy,
    Commented,
    RepliedTo,
    Created,
    Updated,
    Deleted,
    Referenced,
    LinkedTo,
    Causes,
    CausedBy,
    Precedes,
    Succeeds,
    LocatedAt,
    WorksAt,
    MemberOf,
    ManagedBy,
    Manages,
    Collaborates,
    Reviewed,
    Approved,
    Rejected,
    Scheduled,
    Attended,
    Invited,
    Shares,
    DerivedFrom,
    Supersedes,
}

impl VerbType {
    pub const COUNT: usize = 40;

    pub const ALL: [VerbType; Self::COUNT] = [
        VerbType::RelatesTo,
        VerbType::Contains,
        VerbType::PartOf,
        VerbType::Mentions,
        VerbType::Authored,
        VerbType::Owns,
        VerbType::AssignedTo,
        VerbType::DependsOn,
        VerbType::Blocks,
        VerbType::BlockedBy,
        VerbType::Follows,
        VerbType::FollowedBy,
        VerbType::Likes,
        VerbType::LikedBy,
        VerbType::Commented,
        VerbType::RepliedTo,
        VerbType::Created,
        VerbType::Updated,
        VerbType::Deleted,
        VerbType::Referenced,
        VerbType::LinkedTo,
        VerbType::Causes,
        VerbType::CausedBy,
        VerbType::Precedes,
        VerbType::Succeeds,
        VerbType::LocatedAt,
        VerbType::WorksAt,
        VerbType::MemberOf,
        VerbType::ManagedBy,
        VerbType::Manages,
        VerbType::Collaborates,
        VerbType::Reviewed,
        VerbType::Approved,
        VerbType::Rejected,
        VerbType::Scheduled,
        VerbType::Attended,
        VerbType::Invited,
        VerbType::Shares,
        VerbType::DerivedFrom,
        VerbType::Supersedes,
    ];

    pub fn as_tag(&self) -> &'static str {
        match self {
            VerbType::RelatesTo => "relates_to",
            VerbType::Contains => "contains",
            VerbType::PartOf => "part_of",
            VerbType::Mentions => "mentions",
            VerbType::Authored => "authored",
            VerbType::Owns => "owns",
            VerbType::AssignedTo => "assigned_to",
            VerbType::DependsOn => "depends_on",
            VerbType::Blocks => "blocks",
            VerbType::BlockedBy => "blocked_by",
            VerbType::Follows => "follows",
            VerbType::FollowedBy => "followed_by",
            VerbType::Likes => "likes",
            VerbType::LikedBy => "liked_by",
            VerbType::Commented => "commented",
            VerbType::RepliedTo => "replied_to",
            VerbType::Created => "created",
            VerbType::Updated => "updated",
            VerbType::Deleted => "deleted",
            VerbType::Referenced => "referenced",
            VerbType::LinkedTo => "linked_to",
            VerbType::Causes => "causes",
            VerbType::CausedBy => "caused_by",
            VerbType::Precedes => "precedes",
            VerbType::Succeeds => "succeeds",
            VerbType::LocatedAt => "located_at",
            VerbType::WorksAt => "works_at",
            VerbType::MemberOf => "member_of",
            VerbType::ManagedBy => "managed_by",
            VerbType::Manages => "manages",
            VerbType::Collaborates => "collaborates",
            VerbType::Reviewed => "reviewed",
            VerbType::Approved => "approved",
            VerbType::Rejected => "rejected",
            VerbType::Scheduled => "scheduled",
            VerbType::Attended => "attended",
            VerbType::Invited => "invited",
            VerbType::Shares => "shares",
            VerbType::DerivedFrom => "derived_from",
            VerbType::Supersedes => "supersedes",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_tag() == tag)
    }

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).expect("exhaustive")
    }
}

/// Entity kind discriminator used by the path scheme (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Noun,
    Verb,
}

impl EntityKind {
    pub fn as_segment(&self) -> &'static str {
        match self {
            EntityKind::Noun => "nouns",
            EntityKind::Verb => "verbs",
        }
    }
}

/// A validated entity id: at least 2 lowercase hex characters.
///
/// Validation happens once, at construction, per invariant 2 ("fail fast").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, StorageError> {
        let raw = raw.into();
        if raw.len() < 2 {
            return Err(StorageError::InvalidId(raw));
        }
        let prefix = &raw[0..2];
        if !prefix.chars().all(|c| c.is_ascii_hexdigit()) || prefix != prefix.to_ascii_lowercase()
        {
            return Err(StorageError::InvalidId(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two (lowercase hex) characters — the shard directory name.
    pub fn shard_prefix(&self) -> &str {
        &self.0[0..2]
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connections are persisted as `{level -> sorted array}` for determinism
/// (spec §9 "Connections as map-of-sets") and reconstructed as sets on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LevelConnections(pub BTreeMap<u32, Vec<String>>);

impl LevelConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_sets(&self) -> HashMap<u32, HashSet<String>> {
        self.0
            .iter()
            .map(|(level, ids)| (*level, ids.iter().cloned().collect()))
            .collect()
    }

    pub fn insert(&mut self, level: u32, peer_id: String) {
        let entry = self.0.entry(level).or_default();
        if !entry.contains(&peer_id) {
            entry.push(peer_id);
            entry.sort();
        }
    }

    pub fn remove(&mut self, level: u32, peer_id: &str) {
        if let Some(entry) = self.0.get_mut(&level) {
            entry.retain(|id| id != peer_id);
        }
    }

    pub fn neighbor_count(&self, level: u32) -> usize {
        self.0.get(&level).map(|v| v.len()).unwrap_or(0)
    }
}

/// A noun's vector file body — invariant 1: no metadata keys appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Noun {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub connections: LevelConnections,
    pub level: u32,
}

/// A verb's vector file body — same shape as [`Noun`] plus the three
/// relational fields that drive the majority of verb reads (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verb {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub connections: LevelConnections,
    pub level: u32,
    pub verb: String,
    #[serde(rename = "sourceId")]
    pub source_id: String,
    #[serde(rename = "targetId")]
    pub target_id: String,
}

/// User-visible attributes of a noun, stored apart from its vector file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NounMetadata {
    pub noun: String,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
    #[serde(rename = "createdBy", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(flatten)]
    pub custom: HashMap<String, serde_json::Value>,
}

/// User-visible attributes of a verb. Same shape as [`NounMetadata`],
/// discriminated by the verb's own type tag rather than a `noun` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerbMetadata {
    pub verb: String,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
    #[serde(rename = "createdBy", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(flatten)]
    pub custom: HashMap<String, serde_json::Value>,
}

/// Per-noun HNSW graph record (spec §3). May coincide with the fields
/// already present in the noun's vector file; kept as a standalone type
/// because the object-store adapter sometimes persists it separately
/// (§6 path surface lists a distinct `hnsw/{ab}/{id}.json` path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswRecord {
    pub level: u32,
    pub connections: LevelConnections,
}

/// Global HNSW entry-point record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HnswSystemRecord {
    #[serde(rename = "entryPointId")]
    pub entry_point_id: Option<String>,
    #[serde(rename = "maxLevel")]
    pub max_level: u32,
}

/// Aggregate counters (spec §3 "Statistics").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(rename = "nounCount")]
    pub noun_count: BTreeMap<String, u64>,
    #[serde(rename = "verbCount")]
    pub verb_count: BTreeMap<String, u64>,
    #[serde(rename = "metadataCount")]
    pub metadata_count: BTreeMap<String, u64>,
    #[serde(rename = "hnswIndexSize")]
    pub hnsw_index_size: u64,
    #[serde(rename = "totalNodes")]
    pub total_nodes: u64,
    #[serde(rename = "totalEdges")]
    pub total_edges: u64,
    #[serde(rename = "totalMetadata")]
    pub total_metadata: u64,
    #[serde(rename = "lastUpdated")]
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// Per-type counter snapshot persisted by the Type-Aware Router to
/// `_system/type-statistics.json` (spec §4.10), distinct from the
/// aggregate [`Statistics`] the Count & Statistics Registry owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeStatistics {
    #[serde(rename = "nounCounts")]
    pub noun_counts: BTreeMap<String, u64>,
    #[serde(rename = "verbCounts")]
    pub verb_counts: BTreeMap<String, u64>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// Mutation kind recorded in the change log (spec §3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Add,
    Update,
    Delete,
}

/// Entity kind as recorded in a change-log entry (distinct from
/// [`EntityKind`] because metadata mutations are logged too).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggedEntityType {
    Noun,
    Verb,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub timestamp: i64,
    pub operation: ChangeOperation,
    #[serde(rename = "entityType")]
    pub entity_type: LoggedEntityType,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

/// Lock record (spec §3/§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub value: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "ownerPid")]
    pub owner_pid: u32,
}

/// One page of a paginated listing (spec §4.7 "Pagination contract").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Reported status of an adapter (used by `getStorageStatus`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStatus {
    pub healthy: bool,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
    #[serde(rename = "cowEnabled")]
    pub cow_enabled: bool,
    pub detail: String,
}
