//! In-memory Storage Adapter
//!
//! Implements the `Storage` port over a map. Backs the persistent cache mode
//! in tests and in the demo binary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::ports::Storage;
use crate::error::Result;

/// Map-backed key/value storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Raw stored value, for inspection
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_operations() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage.set("b", "2".into()).await.unwrap();
        storage.set("a", "1".into()).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(storage.keys().await.unwrap(), vec!["a", "b"]);

        storage.remove("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);

        storage.clear().await.unwrap();
        assert_eq!(storage.len(), 0);
    }
}
