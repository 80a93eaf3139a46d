use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::host::HostId;

/// Error produced while fetching the desired-state snapshot.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("inventory returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid inventory document: {0}")]
    Format(String),

    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Desired state of every managed host, keyed by host id.
pub type Snapshot = HashMap<HostId, Value>;

/// Source of truth for which hosts exist and what they should look like.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Snapshot, InventoryError>;
}

/// Turn a JSON object of `id -> payload` into a snapshot. Entries with an
/// empty id are skipped with a warning.
pub fn snapshot_from_document(doc: Value) -> Result<Snapshot, InventoryError> {
    let Value::Object(entries) = doc else {
        return Err(InventoryError::Format(
            "expected a JSON object keyed by host id".to_string(),
        ));
    };
    let mut snapshot = Snapshot::with_capacity(entries.len());
    for (id, payload) in entries {
        match HostId::new(&id) {
            Ok(host) => {
                snapshot.insert(host, payload);
            }
            Err(e) => warn!(error = %e, "inventory entry without usable host id, skipping"),
        }
    }
    Ok(snapshot)
}

/// Reads the snapshot from a JSON file on every fetch.
pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Inventory for FileInventory {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Snapshot, InventoryError> {
        if cancel.is_cancelled() {
            return Err(InventoryError::Cancelled);
        }
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| InventoryError::Read {
                path: self.path.clone(),
                source,
            })?;
        let doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| InventoryError::Format(format!("{}: {e}", self.path.display())))?;
        snapshot_from_document(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_ids_are_skipped() {
        let snapshot = snapshot_from_document(json!({"": {"a": 1}, "H1": {"name": "a"}})).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&HostId::new("H1").unwrap()], json!({"name": "a"}));
    }

    #[test]
    fn non_object_document_is_rejected() {
        let err = snapshot_from_document(json!(["H1"])).unwrap_err();
        assert!(matches!(err, InventoryError::Format(_)));
    }

    #[tokio::test]
    async fn file_inventory_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, r#"{"H1": {"name": "a"}, "H2": {"name": "b"}}"#).unwrap();

        let snapshot = FileInventory::new(&path)
            .fetch(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_read_error() {
        let err = FileInventory::new("/nonexistent/hosts.json")
            .fetch(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Read { .. }));
    }
}
