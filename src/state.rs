use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::host::HostId;

const PAYLOAD_SUFFIX: &str = ".json";
const MARKER_SUFFIX: &str = ".processed";
const TEMP_SUFFIX: &str = ".json.tmp";

/// Error produced by a state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("write rejected for host {0}")]
    Rejected(String),
}

impl StoreError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable per-host state: the last rendered payload and the
/// "successfully processed" marker.
///
/// A missing payload or marker means the host was never processed; it is
/// never an error.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, id: &HostId) -> Result<Option<Bytes>, StoreError>;

    async fn save(&self, id: &HostId, payload: &Bytes) -> Result<(), StoreError>;

    async fn marker_exists(&self, id: &HostId) -> Result<bool, StoreError>;

    async fn set_marker(&self, id: &HostId) -> Result<(), StoreError>;

    async fn clear_marker(&self, id: &HostId) -> Result<(), StoreError>;

    /// Every host id with a payload, marker or leftover temp file on record.
    async fn list_known(&self) -> Result<Vec<HostId>, StoreError>;

    /// Remove all state for a host. Deleting an unknown host is a no-op.
    async fn delete(&self, id: &HostId) -> Result<(), StoreError>;

    /// Location of the payload handed to the execution callout.
    fn payload_path(&self, id: &HostId) -> PathBuf;
}

/// Filesystem-backed store: `<key>.json` and a zero-byte `<key>.processed`
/// per host under one root directory, where `<key>` is the URL-encoded id.
///
/// Saves are atomic: the payload is written to `<key>.json.tmp` and renamed
/// over the previous file, so a reader sees either the old or the new bytes.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &HostId, suffix: &str) -> PathBuf {
        self.root.join(format!("{}{suffix}", encode_key(id)))
    }

    fn marker_path(&self, id: &HostId) -> PathBuf {
        self.path_for(id, MARKER_SUFFIX)
    }

    fn temp_path(&self, id: &HostId) -> PathBuf {
        self.path_for(id, TEMP_SUFFIX)
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io("create", &self.root, e))
    }
}

fn encode_key(id: &HostId) -> String {
    urlencoding::encode(id.as_str()).into_owned()
}

/// Recover a host id from a file name in the store root, if it belongs to us.
fn decode_key(file_name: &str) -> Option<HostId> {
    let key = [TEMP_SUFFIX, PAYLOAD_SUFFIX, MARKER_SUFFIX]
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))?;
    let decoded = urlencoding::decode(key).ok()?;
    HostId::new(&decoded).ok()
}

async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("remove", path, e)),
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, id: &HostId) -> Result<Option<Bytes>, StoreError> {
        let path = self.payload_path(id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("read", &path, e)),
        }
    }

    async fn save(&self, id: &HostId, payload: &Bytes) -> Result<(), StoreError> {
        self.ensure_root().await?;
        let tmp = self.temp_path(id);
        let path = self.payload_path(id);
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| StoreError::io("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io("rename", &path, e))?;
        debug!(host = %id, path = %path.display(), "payload written");
        Ok(())
    }

    async fn marker_exists(&self, id: &HostId) -> Result<bool, StoreError> {
        let path = self.marker_path(id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io("stat", &path, e))
    }

    async fn set_marker(&self, id: &HostId) -> Result<(), StoreError> {
        self.ensure_root().await?;
        let path = self.marker_path(id);
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io("create", &path, e))?;
        Ok(())
    }

    async fn clear_marker(&self, id: &HostId) -> Result<(), StoreError> {
        remove_if_present(&self.marker_path(id)).await
    }

    async fn list_known(&self) -> Result<Vec<HostId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("list", &self.root, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("list", &self.root, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(file = ?name, "ignoring non-UTF-8 file in state directory");
                continue;
            };
            match decode_key(name) {
                Some(id) => ids.push(id),
                None => debug!(file = name, "ignoring foreign file in state directory"),
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn delete(&self, id: &HostId) -> Result<(), StoreError> {
        // Marker first: a half-finished delete must never look processed.
        remove_if_present(&self.marker_path(id)).await?;
        remove_if_present(&self.payload_path(id)).await?;
        remove_if_present(&self.temp_path(id)).await
    }

    fn payload_path(&self, id: &HostId) -> PathBuf {
        self.path_for(id, PAYLOAD_SUFFIX)
    }
}
