//! Change Log (spec §4.5): an append-only event stream per mutation,
//! used for fan-out sync to replicas and indexes. Writes are best-effort
//! — a failure here is logged and never aborts the originating mutation
//! (spec §4.12).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

use crate::model::ChangeLogEntry;
use crate::path::PathScheme;
use crate::raw_io::RawObjectIo;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64
}

pub struct ChangeLog<S: RawObjectIo> {
    substrate: Arc<S>,
    instance_id: String,
}

impl<S: RawObjectIo> ChangeLog<S> {
    pub fn new(substrate: Arc<S>, instance_id: impl Into<String>) -> Self {
        Self {
            substrate,
            instance_id: instance_id.into(),
        }
    }

    /// Appends one entry. Never returns an error to the caller; failures
    /// are logged at `warn` (spec §4.5, §4.12).
    pub async fn append(
        &self,
        operation: crate::model::ChangeOperation,
        entity_type: crate::model::LoggedEntityType,
        entity_id: &str,
        data: Option<serde_json::Value>,
    ) {
        let entry = ChangeLogEntry {
            timestamp: now_millis(),
            operation,
            entity_type,
            entity_id: entity_id.to_string(),
            data,
            instance_id: self.instance_id.clone(),
        };
        let path = PathScheme::change_log_entry(entry.timestamp, &Uuid::new_v4().simple().to_string());
        let bytes = match serde_json::to_vec(&entry) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to serialize change log entry");
                return;
            }
        };
        if let Err(e) = self.substrate.write_raw(&path, &bytes).await {
            warn!(error = %e, entity_id, "change log append failed; continuing (best-effort)");
        }
    }

    /// `getChangesSince(timestamp, max)`: entries with `timestamp > since`,
    /// sorted ascending, truncated to `max`.
    pub async fn changes_since(&self, since: i64, max: usize) -> Vec<ChangeLogEntry> {
        let paths = match self.substrate.list_raw(PathScheme::CHANGE_LOG_PREFIX).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "change log listing failed");
                return Vec::new();
            }
        };
        let mut entries = Vec::new();
        for path in paths {
            if let Ok(Some(bytes)) = self.substrate.read_raw(&path).await {
                if let Ok(entry) = serde_json::from_slice::<ChangeLogEntry>(&bytes) {
                    if entry.timestamp > since {
                        entries.push(entry);
                    }
                }
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        entries.truncate(max);
        entries
    }

    /// Age-based sweep: removes entries older than `retention`.
    pub async fn sweep_older_than(&self, retention: std::time::Duration) -> usize {
        let cutoff = now_millis() - retention.as_millis() as i64;
        let paths = match self.substrate.list_raw(PathScheme::CHANGE_LOG_PREFIX).await {
            Ok(p) => p,
            Err(_) => return 0,
        };
        let mut removed = 0usize;
        for path in paths {
            if let Ok(Some(bytes)) = self.substrate.read_raw(&path).await {
                if let Ok(entry) = serde_json::from_slice::<ChangeLogEntry>(&bytes) {
                    if entry.timestamp < cutoff {
                        let _ = self.substrate.remove_raw(&path).await;
                        removed += 1;
                    }
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeOperation, LoggedEntityType};
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
            Ok(self
                .0
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| k.starts_with(prefix))
                .collect())
        }
    }

    #[tokio::test]
    async fn burst_of_writes_returns_sorted_and_counted() {
        let sub = Arc::new(MemSubstrate(DashMap::new()));
        let log = ChangeLog::new(sub, "instance-a");
        for i in 0..20 {
            log.append(
                ChangeOperation::Add,
                LoggedEntityType::Noun,
                &format!("n{i}"),
                None,
            )
            .await;
        }
        let changes = log.changes_since(0, 100).await;
        assert_eq!(changes.len(), 20);
        let sorted = {
            let mut c = changes.clone();
            c.sort_by_key(|e| e.timestamp);
            c
        };
        assert_eq!(changes.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
                   sorted.iter().map(|e| e.timestamp).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn truncates_to_max() {
        let sub = Arc::new(MemSubstrate(DashMap::new()));
        let log = ChangeLog::new(sub, "instance-a");
        for i in 0..10 {
            log.append(ChangeOperation::Add, LoggedEntityType::Verb, &format!("v{i}"), None)
                .await;
        }
        let changes = log.changes_since(0, 3).await;
        assert_eq!(changes.len(), 3);
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_entries() {
        let sub = Arc::new(MemSubstrate(DashMap::new()));
        let log = ChangeLog::new(sub.clone(), "instance-a");
        log.append(ChangeOperation::Delete, LoggedEntityType::Metadata, "m1", None)
            .await;
        let removed = log.sweep_older_than(std::time::Duration::from_secs(3600)).await;
        assert_eq!(removed, 0);
        assert_eq!(log.changes_since(0, 10).await.len(), 1);
    }
}
