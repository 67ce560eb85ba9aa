//! Mapping registry tests.
//!
//! Tests include:
//! - Active mapping protection on update and delete
//! - Activation toggling and dirty set handling
//! - Outbound resolution order
//! - Loading from a redb backed store
//! - Housekeeping sweeps
//! - Sweeps never overwrite newer writes or revive deleted mappings
//! - Rebuilds serialized with concurrent writers
//! - Snooping while a store write is pending
//! - Creating without validation
//! - Concurrent readers during writes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use dynmapper_core::store;
use dynmapper_core::{
    Api, Error, Mapping, MappingStore, ServiceConfiguration, SnoopStatus, Substitution, ValidationError,
};
use dynmapper_engine::MappingRegistry;
use dynmapper_storage::{MemoryMappingStore, RedbMappingStore};

const TENANT: &str = "t300";

fn registry_with(store: Arc<dyn MappingStore>) -> Arc<MappingRegistry> {
    let registry = Arc::new(MappingRegistry::new(store, ServiceConfiguration::default()));
    registry.initialize(TENANT);
    registry
}

/// Memory store whose `create` can be held until released.
#[derive(Default)]
struct GatedStore {
    inner: MemoryMappingStore,
    hold: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl MappingStore for GatedStore {
    async fn list(&self, tenant: &str) -> store::Result<Vec<Mapping>> {
        self.inner.list(tenant).await
    }

    async fn get(&self, tenant: &str, id: &str) -> store::Result<Option<Mapping>> {
        self.inner.get(tenant, id).await
    }

    async fn create(&self, tenant: &str, mapping: &Mapping) -> store::Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.create(tenant, mapping).await
    }

    async fn update(&self, tenant: &str, mapping: &Mapping) -> store::Result<()> {
        self.inner.update(tenant, mapping).await
    }

    async fn delete(&self, tenant: &str, id: &str) -> store::Result<bool> {
        self.inner.delete(tenant, id).await
    }
}

fn inbound(ident: &str, topic: &str) -> Mapping {
    Mapping::inbound(ident, topic, Api::Measurement)
        .with_substitution(Substitution::new("value", "c8y_T.value"))
        .with_substitution(Substitution::identifier("_TOPIC_LEVEL_[1]", "source.id"))
}

#[tokio::test]
async fn test_active_mapping_requires_override() {
    let registry = registry_with(Arc::new(MemoryMappingStore::new()));
    let created = registry
        .create(TENANT, inbound("m1", "/a/+").activated())
        .await
        .unwrap();

    let mut changed = (*created).clone();
    changed.subscription_topic = "/b/+".to_string();
    changed.template_topic = "/b/+".to_string();

    let err = registry.update(TENANT, changed.clone(), false, false).await.unwrap_err();
    assert!(matches!(err, Error::MappingActive(_)));
    assert_eq!(registry.resolve_inbound(TENANT, "/a/x").unwrap().len(), 1);

    let updated = registry.update(TENANT, changed, true, false).await.unwrap();
    assert_eq!(updated.subscription_topic, "/b/+");
    assert!(registry.resolve_inbound(TENANT, "/a/x").unwrap().is_empty());
    assert_eq!(registry.resolve_inbound(TENANT, "/b/x").unwrap().len(), 1);

    let err = registry.delete(TENANT, &created.id, false).await.unwrap_err();
    assert!(matches!(err, Error::MappingActive(_)));
}

#[tokio::test]
async fn test_update_validation_can_be_ignored() {
    let registry = registry_with(Arc::new(MemoryMappingStore::new()));
    let created = registry.create(TENANT, inbound("m1", "/a/+")).await.unwrap();

    let mut broken = (*created).clone();
    broken.substitutions.retain(|s| !s.defines_identifier);
    let err = registry.update(TENANT, broken.clone(), false, false).await.unwrap_err();
    match err {
        Error::Validation(violations) => {
            assert_eq!(violations, vec![ValidationError::IdentifierSubstitutionMissing])
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(registry.update(TENANT, broken, false, true).await.is_ok());
}

#[tokio::test]
async fn test_set_activation() {
    let store = Arc::new(MemoryMappingStore::new());
    let registry = registry_with(store.clone());
    let mut mapping = inbound("m1", "/a/+");
    mapping.snoop_status = SnoopStatus::Enabled;
    let created = registry.create(TENANT, mapping).await.unwrap();

    let active = registry.set_activation(TENANT, &created.id, true).await.unwrap();
    assert!(active.active);

    registry.record_snoop(TENANT, &created.id, "{}".to_string()).unwrap();
    assert_eq!(registry.dirty_count(TENANT), 1);

    let inactive = registry.set_activation(TENANT, &created.id, false).await.unwrap();
    assert!(!inactive.active);
    assert_eq!(inactive.snooped_templates.len(), 1);
    assert_eq!(registry.dirty_count(TENANT), 0);

    let stored = store.get(TENANT, &created.id).await.unwrap().unwrap();
    assert!(!stored.active);
    assert_eq!(stored.snooped_templates, vec!["{}".to_string()]);

    registry.delete(TENANT, &created.id, false).await.unwrap();
    assert!(registry.mappings(TENANT).unwrap().is_empty());
    assert!(registry.status(TENANT, "m1").is_none());
    assert_eq!(store.count(TENANT), 0);
}

#[tokio::test]
async fn test_outbound_resolution_is_ordered() {
    let registry = registry_with(Arc::new(MemoryMappingStore::new()));
    for id in ["c", "a", "b"] {
        let mapping = Mapping::outbound(format!("out-{}", id), "c8y_Temperature", "out/+", Api::Measurement)
            .with_id(id)
            .with_substitution(Substitution::identifier("_IDENTITY_.externalId", "_TOPIC_LEVEL_[1]"));
        registry.create(TENANT, mapping).await.unwrap();
    }
    let other = Mapping::outbound("out-alarm", "c8y_Temperature", "alarm/+", Api::Alarm)
        .with_id("d")
        .with_substitution(Substitution::identifier("_IDENTITY_.externalId", "_TOPIC_LEVEL_[1]"));
    registry.create(TENANT, other).await.unwrap();

    let event = json!({"c8y_Temperature": {"T": {"value": 1}}});
    let ids: Vec<String> = registry
        .resolve_outbound(TENANT, &event, Api::Measurement)
        .unwrap()
        .iter()
        .map(|m| m.id.clone())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let snapshot = registry.snapshot(TENANT).unwrap();
    assert_eq!(snapshot.outbound_by_filter["c8y_Temperature"].len(), 4);
}

#[tokio::test]
async fn test_load_from_redb() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mappings.redb");

    let id = {
        let store = Arc::new(RedbMappingStore::open(&path).unwrap());
        let registry = registry_with(store);
        let created = registry.create(TENANT, inbound("m1", "/plant/+")).await.unwrap();
        registry.create(TENANT, inbound("m2", "/plant/#")).await.unwrap();
        created.id.clone()
    };

    let store = Arc::new(RedbMappingStore::open(&path).unwrap());
    let registry = Arc::new(MappingRegistry::new(store, ServiceConfiguration::default()));
    assert_eq!(registry.load(TENANT).await.unwrap(), 2);

    let resolved = registry.resolve_inbound(TENANT, "/plant/line1").unwrap();
    assert_eq!(resolved.len(), 2);
    assert!(registry.get(TENANT, &id).unwrap().is_some());
    assert_eq!(registry.statuses(TENANT).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_housekeeping_persists_dirty_mappings() {
    let store = Arc::new(MemoryMappingStore::new());
    let registry = registry_with(store.clone());
    let mut mapping = inbound("m1", "/a/+").activated();
    mapping.snoop_status = SnoopStatus::Enabled;
    let created = registry.create(TENANT, mapping).await.unwrap();
    registry
        .record_snoop(TENANT, &created.id, "{\"a\":1}".to_string())
        .unwrap();

    let handle = registry.clone().spawn_housekeeping(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(registry.dirty_count(TENANT), 0);
    let stored = store.get(TENANT, &created.id).await.unwrap().unwrap();
    assert_eq!(stored.snooped_templates.len(), 1);
    assert_eq!(stored.snoop_status, SnoopStatus::Started);
    handle.abort();
}

#[tokio::test]
async fn test_update_supersedes_queued_snoop() {
    let store = Arc::new(MemoryMappingStore::new());
    let registry = registry_with(store.clone());
    let mut mapping = inbound("m1", "/a/+").with_target(r#"{"v":1}"#).activated();
    mapping.snoop_status = SnoopStatus::Enabled;
    let created = registry.create(TENANT, mapping).await.unwrap();

    registry.record_snoop(TENANT, &created.id, "{}".to_string()).unwrap();
    assert_eq!(registry.dirty_count(TENANT), 1);

    let mut newer = (*registry.get(TENANT, &created.id).unwrap().unwrap()).clone();
    newer.target = r#"{"v":2}"#.to_string();
    registry.update(TENANT, newer, true, false).await.unwrap();
    assert_eq!(registry.dirty_count(TENANT), 0);

    assert_eq!(registry.clean_dirty_mappings(TENANT).await.unwrap(), 0);
    let stored = store.get(TENANT, &created.id).await.unwrap().unwrap();
    let cached = registry.get(TENANT, &created.id).unwrap().unwrap();
    assert_eq!(stored.target, r#"{"v":2}"#);
    assert_eq!(stored.target, cached.target);
    assert_eq!(stored.snooped_templates, vec!["{}".to_string()]);
}

#[tokio::test]
async fn test_sweep_writes_cached_version() {
    let store = Arc::new(MemoryMappingStore::new());
    let registry = registry_with(store.clone());
    let mut mapping = inbound("m1", "/a/+").activated();
    mapping.snoop_status = SnoopStatus::Enabled;
    let created = registry.create(TENANT, mapping).await.unwrap();

    // an older copy queued by hand is replaced by the cached one on write
    registry.mark_dirty(TENANT, created.clone()).unwrap();
    registry.record_snoop(TENANT, &created.id, "{\"a\":1}".to_string()).unwrap();
    registry.mark_dirty(TENANT, created.clone()).unwrap();

    assert_eq!(registry.clean_dirty_mappings(TENANT).await.unwrap(), 1);
    let stored = store.get(TENANT, &created.id).await.unwrap().unwrap();
    assert_eq!(stored.snooped_templates.len(), 1);
}

#[tokio::test]
async fn test_sweep_drops_vanished_mappings() {
    let store = Arc::new(MemoryMappingStore::new());
    let registry = registry_with(store.clone());
    let mut mapping = inbound("m1", "/a/+").activated();
    mapping.snoop_status = SnoopStatus::Enabled;
    let created = registry.create(TENANT, mapping).await.unwrap();

    // not cached
    registry
        .mark_dirty(TENANT, Arc::new(inbound("ghost", "/ghost/+").with_id("ghost")))
        .unwrap();
    // cached but removed from the store behind the registry
    registry.record_snoop(TENANT, &created.id, "{}".to_string()).unwrap();
    assert!(store.delete(TENANT, &created.id).await.unwrap());
    assert_eq!(registry.dirty_count(TENANT), 2);

    assert_eq!(registry.clean_dirty_mappings(TENANT).await.unwrap(), 0);
    assert_eq!(registry.dirty_count(TENANT), 0);
    assert_eq!(registry.clean_dirty_mappings(TENANT).await.unwrap(), 0);
    assert_eq!(store.count(TENANT), 0);
}

#[tokio::test]
async fn test_rebuild() {
    let registry = registry_with(Arc::new(MemoryMappingStore::new()));
    registry.create(TENANT, inbound("m1", "/plant/+")).await.unwrap();
    registry.create(TENANT, inbound("m2", "/plant/#")).await.unwrap();

    let excluded = registry.rebuild(TENANT).await.unwrap();
    assert!(excluded.is_empty());
    assert_eq!(registry.resolve_inbound(TENANT, "/plant/line1").unwrap().len(), 2);
    assert!(matches!(
        registry.rebuild("unknown").await,
        Err(Error::TenantNotInitialized(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebuild_keeps_concurrent_creates() {
    let registry = registry_with(Arc::new(MemoryMappingStore::new()));

    let rebuilder = {
        let registry = registry.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                registry.rebuild(TENANT).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for i in 0..50 {
        registry
            .create(TENANT, inbound(&format!("m{}", i), &format!("/load/{}/+", i)))
            .await
            .unwrap();
    }
    rebuilder.await.unwrap();

    let snapshot = registry.snapshot(TENANT).unwrap();
    assert_eq!(snapshot.inbound.len(), 50);
    assert_eq!(snapshot.tree.len(), 50);
    for i in 0..50 {
        let topic = format!("/load/{}/x", i);
        assert_eq!(registry.resolve_inbound(TENANT, &topic).unwrap().len(), 1, "{}", topic);
    }
}

#[tokio::test]
async fn test_snoop_does_not_wait_for_store() {
    let store = Arc::new(GatedStore::default());
    let registry = registry_with(store.clone());
    let mut mapping = inbound("snoop", "/snoop/+").activated();
    mapping.snoop_status = SnoopStatus::Enabled;
    let snooping = registry.create(TENANT, mapping).await.unwrap();

    store.hold.store(true, Ordering::SeqCst);
    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.create(TENANT, inbound("other", "/other/+")).await })
    };
    store.entered.notified().await;

    // the create holds the writer lock while its store write is pending
    let recorded = registry
        .record_snoop(TENANT, &snooping.id, "{}".to_string())
        .unwrap()
        .unwrap();
    assert_eq!(recorded.snooped_templates.len(), 1);

    store.release.notify_one();
    pending.await.unwrap().unwrap();

    // both changes survive in the cache
    let snapshot = registry.snapshot(TENANT).unwrap();
    assert_eq!(snapshot.inbound.len(), 2);
    assert_eq!(snapshot.get(&snooping.id).unwrap().snooped_templates.len(), 1);
    assert_eq!(registry.resolve_inbound(TENANT, "/other/x").unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_can_skip_validation() {
    let store = Arc::new(MemoryMappingStore::new());
    let registry = registry_with(store.clone());
    let mut draft = inbound("draft", "/draft/+");
    draft.substitutions.retain(|s| !s.defines_identifier);

    let err = registry.create(TENANT, draft.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let created = registry.create_with(TENANT, draft, true).await.unwrap();
    assert!(registry.get(TENANT, &created.id).unwrap().is_some());

    // a pattern taken in the resolver tree is rejected before persisting
    let clash = inbound("clash", "/draft/+");
    assert!(registry.create_with(TENANT, clash, true).await.is_err());
    assert_eq!(store.count(TENANT), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_see_complete_snapshots() {
    let registry = registry_with(Arc::new(MemoryMappingStore::new()));
    registry.create(TENANT, inbound("base", "/base/+")).await.unwrap();

    let reader = {
        let registry = registry.clone();
        tokio::spawn(async move {
            for _ in 0..500 {
                let snapshot = registry.snapshot(TENANT).unwrap();
                // tree and id cache always agree
                assert_eq!(snapshot.tree.len(), snapshot.inbound.len());
                tokio::task::yield_now().await;
            }
        })
    };

    for i in 0..50 {
        registry
            .create(TENANT, inbound(&format!("m{}", i), &format!("/load/{}/+", i)))
            .await
            .unwrap();
    }
    reader.await.unwrap();
    assert_eq!(registry.mappings(TENANT).unwrap().len(), 51);
    assert_eq!(registry.resolve_inbound(TENANT, "/load/7/x").unwrap().len(), 1);
}
