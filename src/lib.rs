//! Pluggable storage engine for a vector-graph database: nouns
//! (embedded entities) and verbs (embedded relationships), backed by
//! HNSW connection persistence, a filesystem or object-store adapter,
//! a type-aware router, and a read-only historical adapter over
//! committed copy-on-write snapshots.
//!
//! This crate does not implement nearest-neighbor search, embedding
//! generation, or the copy-on-write primitives themselves — it
//! persists and serves the state those systems need (spec Non-goals).

pub mod backpressure;
pub mod change_log;
pub mod codec;
pub mod error;
pub mod fs_adapter;
pub mod historical;
pub mod hnsw;
pub mod lock;
pub mod memory_adapter;
pub mod model;
pub mod path;
pub mod raw_io;
pub mod router;
pub mod stats;
pub mod storage;

#[cfg(feature = "object-store")]
pub mod object_store_adapter;

pub use error::{Result, StorageError};
pub use model::{
    ChangeLogEntry, ChangeOperation, EntityId, EntityKind, HnswRecord, HnswSystemRecord,
    LevelConnections, LockRecord, LoggedEntityType, Noun, NounMetadata, NounType, Page,
    Statistics, StorageStatus, Verb, VerbMetadata, VerbType,
};
pub use storage::{EntityStore, StoragePrimitives};

/// Initializes the crate's `tracing` subscriber for standalone binaries
/// and examples. Library consumers that already run their own
/// subscriber should not call this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
