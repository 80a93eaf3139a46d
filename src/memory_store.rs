use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::host::HostId;
use crate::state::{StateStore, StoreError};

#[derive(Default, Clone)]
struct Entry {
    payload: Option<Bytes>,
    processed: bool,
}

/// In-memory StateStore for tests. Writes for selected hosts can be made to
/// fail to exercise the persistence-error path.
#[derive(Default)]
pub struct MemoryStateStore {
    data: Mutex<HashMap<HostId, Entry>>,
    reject_writes: Mutex<HashSet<HostId>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` for `id` fail.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn reject_writes_for(&self, id: &HostId) {
        self.reject_writes.lock().unwrap().insert(id.clone());
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn accept_writes_for(&self, id: &HostId) {
        self.reject_writes.lock().unwrap().remove(id);
    }

    /// Seed state directly, bypassing the write path.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed(&self, id: &HostId, payload: Bytes, processed: bool) {
        self.data.lock().unwrap().insert(
            id.clone(),
            Entry {
                payload: Some(payload),
                processed,
            },
        );
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, id: &HostId) -> Result<Option<Bytes>, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data.get(id).and_then(|e| e.payload.clone()))
    }

    async fn save(&self, id: &HostId, payload: &Bytes) -> Result<(), StoreError> {
        if self.reject_writes.lock().unwrap().contains(id) {
            return Err(StoreError::Rejected(id.to_string()));
        }
        let mut data = self.data.lock().unwrap();
        data.entry(id.clone()).or_default().payload = Some(payload.clone());
        Ok(())
    }

    async fn marker_exists(&self, id: &HostId) -> Result<bool, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data.get(id).is_some_and(|e| e.processed))
    }

    async fn set_marker(&self, id: &HostId) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.entry(id.clone()).or_default().processed = true;
        Ok(())
    }

    async fn clear_marker(&self, id: &HostId) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        if let Some(entry) = data.get_mut(id) {
            entry.processed = false;
        }
        Ok(())
    }

    async fn list_known(&self) -> Result<Vec<HostId>, StoreError> {
        let data = self.data.lock().unwrap();
        let mut ids: Vec<HostId> = data.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &HostId) -> Result<(), StoreError> {
        self.data.lock().unwrap().remove(id);
        Ok(())
    }

    fn payload_path(&self, id: &HostId) -> PathBuf {
        PathBuf::from(format!("memory://{id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejected_writes_leave_state_untouched() {
        let store = MemoryStateStore::new();
        let id = HostId::new("H1").unwrap();
        store.seed(&id, Bytes::from_static(b"old"), true);
        store.reject_writes_for(&id);

        let err = store.save(&id, &Bytes::from_static(b"new")).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.load(&id).await.unwrap(), Some(Bytes::from_static(b"old")));

        store.accept_writes_for(&id);
        store.save(&id, &Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn marker_without_payload_is_known() {
        let store = MemoryStateStore::new();
        let id = HostId::new("H1").unwrap();
        store.set_marker(&id).await.unwrap();
        assert!(store.marker_exists(&id).await.unwrap());
        assert_eq!(store.list_known().await.unwrap(), vec![id]);
    }
}
