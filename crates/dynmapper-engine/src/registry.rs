//! Mapping registry.
//!
//! Per tenant caches of inbound and outbound mappings plus the resolver tree.
//! Readers take an `Arc` of the current [`TenantSnapshot`] and never block on
//! writers. CRUD writers and dirty sweeps are serialized per tenant across the
//! store write. Every snapshot replacement, including snoop accumulation on
//! the message path, applies its change to the latest snapshot under a short
//! swap lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;

use dynmapper_core::store::StoreError;
use dynmapper_core::validation;
use dynmapper_core::{
    path, Api, Direction, Error, Mapping, MappingStatus, MappingStore, MappingTree, Result,
    ServiceConfiguration, SnoopStatus,
};

/// Immutable view of a tenant's mappings.
#[derive(Debug, Clone, Default)]
pub struct TenantSnapshot {
    pub inbound: HashMap<String, Arc<Mapping>>,
    pub outbound: HashMap<String, Arc<Mapping>>,
    /// Outbound mappings grouped by filter expression.
    pub outbound_by_filter: HashMap<String, Vec<Arc<Mapping>>>,
    pub tree: MappingTree,
}

impl TenantSnapshot {
    fn from_mappings(tenant: &str, mappings: Vec<Mapping>) -> Self {
        let mut snapshot = Self::default();
        for mut mapping in mappings {
            mapping.sort_substitutions();
            let mapping = Arc::new(mapping);
            match mapping.direction {
                Direction::Inbound => snapshot.inbound.insert(mapping.id.clone(), mapping),
                Direction::Outbound => snapshot.outbound.insert(mapping.id.clone(), mapping),
            };
        }
        let (tree, excluded) = MappingTree::rebuild(tenant, snapshot.inbound.values().cloned());
        if !excluded.is_empty() {
            tracing::warn!(
                "Tenant {} - {} mappings excluded from resolver tree",
                tenant,
                excluded.len()
            );
        }
        snapshot.tree = tree;
        snapshot.rebuild_outbound_index();
        snapshot
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Mapping>> {
        self.inbound.get(id).or_else(|| self.outbound.get(id))
    }

    /// All mappings, ordered by id.
    pub fn all(&self) -> Vec<Arc<Mapping>> {
        let mut all: Vec<_> = self.inbound.values().chain(self.outbound.values()).cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn rebuild_outbound_index(&mut self) {
        let mut index: HashMap<String, Vec<Arc<Mapping>>> = HashMap::new();
        for mapping in self.outbound.values() {
            if let Some(filter) = &mapping.filter_outbound {
                index.entry(filter.clone()).or_default().push(mapping.clone());
            }
        }
        self.outbound_by_filter = index;
    }

    fn remove(&mut self, mapping: &Mapping) {
        match mapping.direction {
            Direction::Inbound => {
                self.inbound.remove(&mapping.id);
                if let Err(e) = self.tree.delete_mapping(mapping) {
                    // mappings excluded on rebuild are not in the tree
                    tracing::debug!("{}", e);
                }
            }
            Direction::Outbound => {
                self.outbound.remove(&mapping.id);
                self.rebuild_outbound_index();
            }
        }
    }

    fn insert(&mut self, mapping: Arc<Mapping>) -> Result<()> {
        match mapping.direction {
            Direction::Inbound => {
                self.tree.add_mapping(mapping.clone())?;
                self.inbound.insert(mapping.id.clone(), mapping);
            }
            Direction::Outbound => {
                self.outbound.insert(mapping.id.clone(), mapping);
                self.rebuild_outbound_index();
            }
        }
        Ok(())
    }
}

struct TenantState {
    snapshot: RwLock<Arc<TenantSnapshot>>,
    /// Serializes CRUD writers and sweeps across the persistence await.
    writer: tokio::sync::Mutex<()>,
    /// Serializes snapshot replacement. Never held across an await.
    swap: Mutex<()>,
    status: DashMap<String, MappingStatus>,
    dirty: Mutex<HashMap<String, Arc<Mapping>>>,
}

impl TenantState {
    fn new() -> Self {
        let status = DashMap::new();
        status.insert(MappingStatus::UNSPECIFIED.to_string(), MappingStatus::unspecified());
        Self {
            snapshot: RwLock::new(Arc::new(TenantSnapshot::default())),
            writer: tokio::sync::Mutex::new(()),
            swap: Mutex::new(()),
            status,
            dirty: Mutex::new(HashMap::new()),
        }
    }

    fn current(&self) -> Arc<TenantSnapshot> {
        self.snapshot.read().clone()
    }

    /// Apply `change` to a copy of the latest snapshot and swap it in.
    ///
    /// The dirty set is handed to `change` so queue edits and the swap are
    /// observed together. Nothing is installed when `change` fails.
    fn commit<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut TenantSnapshot, &mut HashMap<String, Arc<Mapping>>) -> Result<T>,
    {
        let _swap = self.swap.lock();
        let mut next = (*self.current()).clone();
        let value = change(&mut next, &mut *self.dirty.lock())?;
        *self.snapshot.write() = Arc::new(next);
        Ok(value)
    }

    fn ensure_status(&self, mapping: &Mapping) {
        self.status
            .entry(mapping.ident.clone())
            .or_insert_with(|| MappingStatus::new(&mapping.id, &mapping.ident, &mapping.subscription_topic));
    }
}

/// Per tenant mapping caches backed by a [`MappingStore`].
pub struct MappingRegistry {
    store: Arc<dyn MappingStore>,
    config: ServiceConfiguration,
    tenants: DashMap<String, Arc<TenantState>>,
}

impl MappingRegistry {
    pub fn new(store: Arc<dyn MappingStore>, config: ServiceConfiguration) -> Self {
        Self {
            store,
            config,
            tenants: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfiguration {
        &self.config
    }

    fn state(&self, tenant: &str) -> Result<Arc<TenantState>> {
        self.tenants
            .get(tenant)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::TenantNotInitialized(tenant.to_string()))
    }

    /// Create empty caches for a tenant. Existing state is kept.
    pub fn initialize(&self, tenant: &str) {
        self.tenants
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(TenantState::new()));
    }

    /// Drop all state of a tenant.
    pub fn remove_tenant(&self, tenant: &str) -> bool {
        self.tenants.remove(tenant).is_some()
    }

    pub fn tenants(&self) -> Vec<String> {
        self.tenants.iter().map(|e| e.key().clone()).collect()
    }

    /// Load all mappings of a tenant from the store and rebuild every cache.
    pub async fn load(&self, tenant: &str) -> Result<usize> {
        self.initialize(tenant);
        let state = self.state(tenant)?;
        let _writer = state.writer.lock().await;

        let mappings = self.store.list(tenant).await?;
        let count = mappings.len();
        let snapshot = TenantSnapshot::from_mappings(tenant, mappings);
        for mapping in snapshot.all() {
            state.ensure_status(&mapping);
        }
        state.commit(|current, dirty| {
            *current = snapshot;
            dirty.clear();
            Ok(())
        })?;
        tracing::info!("Tenant {} - Loaded {} mappings", tenant, count);
        Ok(count)
    }

    /// Rebuild the resolver tree and outbound index from the cached mappings.
    ///
    /// Returns the mappings the tree could not take.
    pub async fn rebuild(&self, tenant: &str) -> Result<Vec<Arc<Mapping>>> {
        let state = self.state(tenant)?;
        let _writer = state.writer.lock().await;
        state.commit(|snapshot, _| {
            let (tree, excluded) = MappingTree::rebuild(tenant, snapshot.inbound.values().cloned());
            snapshot.tree = tree;
            snapshot.rebuild_outbound_index();
            Ok(excluded)
        })
    }

    pub fn snapshot(&self, tenant: &str) -> Result<Arc<TenantSnapshot>> {
        Ok(self.state(tenant)?.current())
    }

    pub fn get(&self, tenant: &str, id: &str) -> Result<Option<Arc<Mapping>>> {
        Ok(self.snapshot(tenant)?.get(id).cloned())
    }

    pub fn mappings(&self, tenant: &str) -> Result<Vec<Arc<Mapping>>> {
        Ok(self.snapshot(tenant)?.all())
    }

    /// Inbound mappings whose subscription pattern matches `topic`.
    pub fn resolve_inbound(&self, tenant: &str, topic: &str) -> Result<Vec<Arc<Mapping>>> {
        let snapshot = self.snapshot(tenant)?;
        Ok(snapshot.tree.resolve(topic))
    }

    /// Outbound mappings for `api` whose filter path exists in `event`.
    pub fn resolve_outbound(&self, tenant: &str, event: &Value, api: Api) -> Result<Vec<Arc<Mapping>>> {
        let snapshot = self.snapshot(tenant)?;
        let mut matched: Vec<Arc<Mapping>> = snapshot
            .outbound
            .values()
            .filter(|m| m.target_api == api)
            .filter(|m| {
                m.filter_outbound
                    .as_deref()
                    .map_or(false, |filter| path::exists(event, filter))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    /// Validate, persist and cache a new mapping.
    pub async fn create(&self, tenant: &str, mapping: Mapping) -> Result<Arc<Mapping>> {
        self.create_with(tenant, mapping, false).await
    }

    /// Persist and cache a new mapping. Validation errors block the write
    /// unless `ignore_validation`; a pattern conflicting in the resolver tree
    /// is always rejected.
    pub async fn create_with(
        &self,
        tenant: &str,
        mut mapping: Mapping,
        ignore_validation: bool,
    ) -> Result<Arc<Mapping>> {
        let state = self.state(tenant)?;
        let _writer = state.writer.lock().await;
        let current = state.current();

        if !ignore_validation {
            let existing: Vec<Mapping> = current.all().iter().map(|m| (**m).clone()).collect();
            let violations = validation::validate_mapping(&existing, &mapping);
            if !violations.is_empty() {
                return Err(Error::Validation(violations));
            }
        }

        if mapping.id.is_empty() {
            mapping.id = uuid::Uuid::new_v4().to_string();
        }
        if current.get(&mapping.id).is_some() {
            return Err(Error::Resolve(format!("Mapping id {} already exists", mapping.id)));
        }
        mapping.last_update = chrono::Utc::now().timestamp_millis();
        mapping.sort_substitutions();
        let mapping = Arc::new(mapping);

        // reject tree conflicts before anything is persisted
        (*current).clone().insert(mapping.clone())?;
        self.store.create(tenant, &mapping).await?;
        state.ensure_status(&mapping);
        state.commit(|snapshot, _| snapshot.insert(mapping.clone()))?;

        tracing::info!("Tenant {} - Created mapping {} ({})", tenant, mapping.ident, mapping.id);
        Ok(mapping)
    }

    /// Replace a mapping.
    ///
    /// An active mapping is only changed with `allow_update_when_active`;
    /// validation errors block the write unless `ignore_validation`.
    pub async fn update(
        &self,
        tenant: &str,
        mapping: Mapping,
        allow_update_when_active: bool,
        ignore_validation: bool,
    ) -> Result<Arc<Mapping>> {
        let state = self.state(tenant)?;
        let _writer = state.writer.lock().await;
        self.apply_update(tenant, &state, mapping, allow_update_when_active, ignore_validation)
            .await
    }

    async fn apply_update(
        &self,
        tenant: &str,
        state: &TenantState,
        mut mapping: Mapping,
        allow_update_when_active: bool,
        ignore_validation: bool,
    ) -> Result<Arc<Mapping>> {
        let current = state.current();
        let previous = current
            .get(&mapping.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("mapping {}", mapping.id)))?;

        if (previous.active || mapping.active) && !allow_update_when_active {
            return Err(Error::MappingActive(mapping.ident.clone()));
        }

        if !ignore_validation {
            let existing: Vec<Mapping> = current.all().iter().map(|m| (**m).clone()).collect();
            let violations = validation::validate_mapping(&existing, &mapping);
            if !violations.is_empty() {
                return Err(Error::Validation(violations));
            }
        }

        mapping.last_update = chrono::Utc::now().timestamp_millis();
        mapping.sort_substitutions();
        let mapping = Arc::new(mapping);

        let mut candidate = (*current).clone();
        candidate.remove(&previous);
        candidate.insert(mapping.clone())?;
        self.store.update(tenant, &mapping).await?;

        if previous.ident != mapping.ident {
            state.status.remove(&previous.ident);
        }
        state.ensure_status(&mapping);
        // snoop samples queued meanwhile are superseded by this write
        state.commit(|snapshot, dirty| {
            if let Some(latest) = snapshot.get(&mapping.id).cloned() {
                snapshot.remove(&latest);
            }
            snapshot.insert(mapping.clone())?;
            dirty.remove(&mapping.id);
            Ok(())
        })?;

        tracing::info!("Tenant {} - Updated mapping {} ({})", tenant, mapping.ident, mapping.id);
        Ok(mapping)
    }

    /// Delete a mapping. An active mapping is only deleted with
    /// `allow_delete_when_active`.
    pub async fn delete(&self, tenant: &str, id: &str, allow_delete_when_active: bool) -> Result<Arc<Mapping>> {
        let state = self.state(tenant)?;
        let _writer = state.writer.lock().await;
        let current = state.current();

        let mapping = current
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("mapping {}", id)))?;
        if mapping.active && !allow_delete_when_active {
            return Err(Error::MappingActive(mapping.ident.clone()));
        }

        self.store.delete(tenant, id).await?;
        state.commit(|snapshot, dirty| {
            if let Some(latest) = snapshot.get(id).cloned() {
                snapshot.remove(&latest);
            }
            dirty.remove(id);
            Ok(())
        })?;
        state.status.remove(&mapping.ident);

        tracing::info!("Tenant {} - Deleted mapping {} ({})", tenant, mapping.ident, id);
        Ok(mapping)
    }

    /// Activate or deactivate a mapping.
    ///
    /// Deactivation skips validation. Snooped templates are carried over from
    /// the cache and persisted with the write.
    pub async fn set_activation(&self, tenant: &str, id: &str, active: bool) -> Result<Arc<Mapping>> {
        let state = self.state(tenant)?;
        let _writer = state.writer.lock().await;

        let cached = state
            .current()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("mapping {}", id)))?;
        let mut mapping = (*cached).clone();
        mapping.active = active;

        self.apply_update(tenant, &state, mapping, true, !active).await
    }

    /// Queue a mapping changed during processing for the next sweep.
    pub fn mark_dirty(&self, tenant: &str, mapping: Arc<Mapping>) -> Result<()> {
        let state = self.state(tenant)?;
        state.dirty.lock().insert(mapping.id.clone(), mapping);
        Ok(())
    }

    pub fn dirty_count(&self, tenant: &str) -> usize {
        self.state(tenant).map_or(0, |s| s.dirty.lock().len())
    }

    /// Persist every queued mapping.
    ///
    /// The cached version is written, not the queued one, and mappings gone
    /// from the cache or the store are dropped. Other failed writes are queued
    /// again unless a newer version was queued meanwhile.
    pub async fn clean_dirty_mappings(&self, tenant: &str) -> Result<usize> {
        let state = self.state(tenant)?;
        let _writer = state.writer.lock().await;
        let queued: Vec<String> = {
            let mut dirty = state.dirty.lock();
            std::mem::take(&mut *dirty).into_keys().collect()
        };
        if queued.is_empty() {
            return Ok(0);
        }

        let mut persisted = 0;
        for id in queued {
            let Some(mapping) = state.current().get(&id).cloned() else {
                tracing::debug!("Tenant {} - Dropping dirty mapping {}, no longer cached", tenant, id);
                continue;
            };
            match self.store.update(tenant, &mapping).await {
                Ok(()) => persisted += 1,
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(
                        "Tenant {} - Dropping dirty mapping {}, no longer stored",
                        tenant,
                        mapping.ident
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Tenant {} - Could not persist dirty mapping {}: {}",
                        tenant,
                        mapping.ident,
                        e
                    );
                    state.dirty.lock().entry(mapping.id.clone()).or_insert(mapping);
                }
            }
        }
        tracing::debug!("Tenant {} - Persisted {} dirty mappings", tenant, persisted);
        Ok(persisted)
    }

    /// Record a payload sample for a snooping mapping.
    ///
    /// Returns the updated mapping, or `None` when the mapping is not snooping.
    ///
    /// Only the snapshot swap is serialized; a CRUD write waiting on the
    /// store does not hold up snooping.
    pub fn record_snoop(&self, tenant: &str, id: &str, sample: String) -> Result<Option<Arc<Mapping>>> {
        let state = self.state(tenant)?;
        match state.current().get(id) {
            None => return Err(Error::NotFound(format!("mapping {}", id))),
            Some(cached) if !cached.snoop_status.is_snooping() => return Ok(None),
            Some(_) => {}
        }

        let max_samples = self.config.max_snooped_templates;
        let recorded = state.commit(|snapshot, dirty| {
            // re-read under the swap lock
            let Some(cached) = snapshot.get(id).cloned() else {
                return Ok(None);
            };
            if !cached.snoop_status.is_snooping() {
                return Ok(None);
            }
            let mut mapping = (*cached).clone();
            mapping.snooped_templates.push(sample);
            mapping.snoop_status = if mapping.snooped_templates.len() >= max_samples {
                SnoopStatus::Stopped
            } else {
                SnoopStatus::Started
            };
            let mapping = Arc::new(mapping);
            snapshot.remove(&cached);
            snapshot.insert(mapping.clone())?;
            dirty.insert(mapping.id.clone(), mapping.clone());
            Ok(Some(mapping))
        })?;
        let Some(mapping) = recorded else {
            return Ok(None);
        };

        if let Some(mut status) = state.status.get_mut(&mapping.ident) {
            status.snooped_templates_total += 1;
            status.snooped_templates_active = mapping.snooped_templates.len() as u64;
        }

        if mapping.snoop_status == SnoopStatus::Stopped {
            tracing::info!(
                "Tenant {} - Snooping of mapping {} stopped after {} samples",
                tenant,
                mapping.ident,
                mapping.snooped_templates.len()
            );
        }
        Ok(Some(mapping))
    }

    /// Update the status counters of a mapping.
    pub fn update_status<F>(&self, tenant: &str, mapping: &Mapping, f: F)
    where
        F: FnOnce(&mut MappingStatus),
    {
        if let Ok(state) = self.state(tenant) {
            state.ensure_status(mapping);
            if let Some(mut status) = state.status.get_mut(&mapping.ident) {
                f(&mut status);
            }
        }
    }

    /// Count a message that resolved no mapping.
    pub fn increment_unspecified(&self, tenant: &str) {
        if let Ok(state) = self.state(tenant) {
            state
                .status
                .entry(MappingStatus::UNSPECIFIED.to_string())
                .or_insert_with(MappingStatus::unspecified)
                .messages_received += 1;
        }
    }

    pub fn status(&self, tenant: &str, ident: &str) -> Option<MappingStatus> {
        let state = self.state(tenant).ok()?;
        let status = state.status.get(ident)?;
        Some(status.value().clone())
    }

    /// Snapshot of all status counters of a tenant, ordered by ident.
    pub fn statuses(&self, tenant: &str) -> Vec<MappingStatus> {
        let Ok(state) = self.state(tenant) else {
            return Vec::new();
        };
        let mut statuses: Vec<MappingStatus> = state.status.iter().map(|e| e.value().clone()).collect();
        statuses.sort_by(|a, b| a.ident.cmp(&b.ident));
        statuses
    }

    pub fn reset_statuses(&self, tenant: &str) {
        if let Ok(state) = self.state(tenant) {
            for mut entry in state.status.iter_mut() {
                entry.value_mut().reset();
            }
        }
    }

    /// Periodically persist dirty mappings of every tenant.
    pub fn spawn_housekeeping(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for tenant in self.tenants() {
                    if let Err(e) = self.clean_dirty_mappings(&tenant).await {
                        tracing::warn!("Tenant {} - Housekeeping failed: {}", tenant, e);
                    }
                }
            }
        })
    }
}
