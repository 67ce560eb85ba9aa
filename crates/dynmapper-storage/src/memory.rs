//! In-memory mapping store for tests and ephemeral deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use dynmapper_core::store::{MappingStore, Result, StoreError};
use dynmapper_core::Mapping;

/// Mappings per tenant, ordered by id.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    tenants: RwLock<HashMap<String, BTreeMap<String, Mapping>>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mappings stored for `tenant`.
    pub fn count(&self, tenant: &str) -> usize {
        self.tenants.read().get(tenant).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn list(&self, tenant: &str) -> Result<Vec<Mapping>> {
        Ok(self
            .tenants
            .read()
            .get(tenant)
            .map(|mappings| mappings.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, tenant: &str, id: &str) -> Result<Option<Mapping>> {
        Ok(self
            .tenants
            .read()
            .get(tenant)
            .and_then(|mappings| mappings.get(id).cloned()))
    }

    async fn create(&self, tenant: &str, mapping: &Mapping) -> Result<()> {
        self.tenants
            .write()
            .entry(tenant.to_string())
            .or_default()
            .insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }

    async fn update(&self, tenant: &str, mapping: &Mapping) -> Result<()> {
        let mut tenants = self.tenants.write();
        match tenants.get_mut(tenant).and_then(|m| m.get_mut(&mapping.id)) {
            Some(stored) => {
                *stored = mapping.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(mapping.id.clone())),
        }
    }

    async fn delete(&self, tenant: &str, id: &str) -> Result<bool> {
        Ok(self
            .tenants
            .write()
            .get_mut(tenant)
            .map_or(false, |mappings| mappings.remove(id).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynmapper_core::Api;

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let store = MemoryMappingStore::new();
        let mapping = Mapping::inbound("m1", "/a/+", Api::Event).with_id("1");
        store.create("t1", &mapping).await.unwrap();

        assert_eq!(store.count("t1"), 1);
        assert!(store.get("t2", "1").await.unwrap().is_none());
        assert!(store.list("t2").await.unwrap().is_empty());
        assert!(!store.delete("t2", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let store = MemoryMappingStore::new();
        let mut mapping = Mapping::inbound("m1", "/a/+", Api::Event).with_id("1");
        assert!(matches!(
            store.update("t1", &mapping).await,
            Err(StoreError::NotFound(_))
        ));

        store.create("t1", &mapping).await.unwrap();
        mapping.name = "renamed".to_string();
        store.update("t1", &mapping).await.unwrap();
        assert_eq!(store.get("t1", "1").await.unwrap().unwrap().name, "renamed");
    }
}
