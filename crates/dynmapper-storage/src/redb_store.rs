//! Mapping store using redb.
//!
//! Mappings are stored as JSON rows keyed by `(tenant, id)`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use dynmapper_core::store::{self, MappingStore};
use dynmapper_core::Mapping;

use crate::error::{Error, Result};

// Mappings table: key = (tenant, mapping_id), value = Mapping (JSON)
const MAPPINGS_TABLE: TableDefinition<(&str, &str), &str> = TableDefinition::new("mappings");

/// Persistent mapping store.
pub struct RedbMappingStore {
    db: Arc<Database>,
    path: String,
}

impl RedbMappingStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };

        // Create the table on first open
        let write_txn = db.begin_write()?;
        {
            let _mappings = write_txn.open_table(MAPPINGS_TABLE)?;
        }
        write_txn.commit()?;

        tracing::debug!("Opened mapping store at {}", path_ref.display());
        Ok(Self {
            db: Arc::new(db),
            path: path_ref.to_string_lossy().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Insert or replace a mapping row.
    pub fn save(&self, tenant: &str, mapping: &Mapping) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MAPPINGS_TABLE)?;
            let json = serde_json::to_string(mapping)?;
            table.insert((tenant, mapping.id.as_str()), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Replace an existing mapping row.
    pub fn replace(&self, tenant: &str, mapping: &Mapping) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MAPPINGS_TABLE)?;
            let key = (tenant, mapping.id.as_str());
            if table.get(key)?.is_none() {
                return Err(Error::NotFound(mapping.id.clone()));
            }
            let json = serde_json::to_string(mapping)?;
            table.insert(key, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a mapping.
    pub fn load(&self, tenant: &str, id: &str) -> Result<Option<Mapping>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MAPPINGS_TABLE)?;

        let row = table.get((tenant, id))?;
        let mapping = match row {
            Some(value) => Some(serde_json::from_str::<Mapping>(value.value())?),
            None => None,
        };
        Ok(mapping)
    }

    /// List all mappings of a tenant. Rows that fail to deserialize are skipped.
    pub fn load_all(&self, tenant: &str) -> Result<Vec<Mapping>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MAPPINGS_TABLE)?;

        let mut mappings = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            let (row_tenant, id) = key.value();
            if row_tenant != tenant {
                continue;
            }
            match serde_json::from_str::<Mapping>(value.value()) {
                Ok(mapping) => mappings.push(mapping),
                Err(e) => {
                    tracing::warn!("Tenant {} - Skipping unreadable mapping {}: {}", tenant, id, e)
                }
            }
        }
        Ok(mappings)
    }

    /// Delete a mapping.
    pub fn remove(&self, tenant: &str, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let mut table = write_txn.open_table(MAPPINGS_TABLE)?;
        let deleted = table.remove((tenant, id))?.is_some();
        drop(table);
        write_txn.commit()?;
        Ok(deleted)
    }
}

#[async_trait]
impl MappingStore for RedbMappingStore {
    async fn list(&self, tenant: &str) -> store::Result<Vec<Mapping>> {
        Ok(self.load_all(tenant)?)
    }

    async fn get(&self, tenant: &str, id: &str) -> store::Result<Option<Mapping>> {
        Ok(self.load(tenant, id)?)
    }

    async fn create(&self, tenant: &str, mapping: &Mapping) -> store::Result<()> {
        Ok(self.save(tenant, mapping)?)
    }

    async fn update(&self, tenant: &str, mapping: &Mapping) -> store::Result<()> {
        Ok(self.replace(tenant, mapping)?)
    }

    async fn delete(&self, tenant: &str, id: &str) -> store::Result<bool> {
        Ok(self.remove(tenant, id)?)
    }
}
