//! Process-wide Instance registry: one map keyed by storage device, plus
//! two orphan lists (object and metadata target descriptors staged before
//! their owning Instance exists).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lfsck_proto::LfsckError;

use crate::bookmark_store::BookmarkStore;
use crate::component::ComponentRegistry;
use crate::fid::{Fid, FidSequenceClient, LOCAL_FILE_SEQ, LOCAL_NAME_SEQ, OTABLE_IT_OID};
use crate::instance::Instance;
use crate::metrics::Metrics;
use crate::store::StorageBackend;
use crate::tdt::{TargetDescriptor, TargetDescriptorTable};

struct OrphanEntry {
    device: String,
    td: TargetDescriptor,
}

pub struct InstanceRegistry {
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    object_orphans: Mutex<Vec<OrphanEntry>>,
    metadata_orphans: Mutex<Vec<OrphanEntry>>,
    tick: Duration,
    default_speed: u32,
    metrics: Arc<Metrics>,
}

impl InstanceRegistry {
    pub fn new(tick: Duration, default_speed: u32) -> Self {
        Self::with_metrics(tick, default_speed, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(tick: Duration, default_speed: u32, metrics: Arc<Metrics>) -> Self {
        InstanceRegistry {
            instances: Mutex::new(HashMap::new()),
            object_orphans: Mutex::new(Vec::new()),
            metadata_orphans: Mutex::new(Vec::new()),
            tick,
            default_speed,
            metrics,
        }
    }

    /// Clones the registry's own `Arc`, which already keeps the Instance
    /// alive; this does not touch the Instance's domain refcount (see
    /// `incref`/`decref`), which tracks outstanding control-protocol
    /// handles rather than the registry lookup itself.
    pub fn find(&self, key: &str) -> Option<Arc<Instance>> {
        self.instances.lock().unwrap().get(key).cloned()
    }

    fn add(&self, key: String, instance: Arc<Instance>) -> Result<(), LfsckError> {
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(&key) {
            return Err(LfsckError::AlreadyExists(key));
        }
        instances.insert(key, instance);
        Ok(())
    }

    /// Main entry per §4.9: refuse a duplicate key, initialize the TDTs and
    /// bookmark, register the namespace/layout components on a master
    /// Instance, add it to the global map, then drain any orphaned target
    /// descriptors staged under this key.
    pub async fn register(
        &self,
        key: &str,
        master: bool,
        store: Arc<dyn StorageBackend>,
        fid_client: Arc<dyn FidSequenceClient>,
    ) -> Result<Arc<Instance>, LfsckError> {
        if self.instances.lock().unwrap().contains_key(key) {
            return Err(LfsckError::AlreadyExists(key.to_string()));
        }

        let local_root = Fid::new(LOCAL_NAME_SEQ, 1, 0);
        let global_root = if master {
            store.lookup(local_root, "ROOT").await?.unwrap_or(local_root)
        } else {
            local_root
        };

        let bookmark_fid = Fid::new(LOCAL_FILE_SEQ, 2, 0);
        let bookmark = BookmarkStore::setup(store.clone(), bookmark_fid).await?;

        let object_tdt = Arc::new(TargetDescriptorTable::new());
        let metadata_tdt = Arc::new(TargetDescriptorTable::new());
        let components = Arc::new(ComponentRegistry::new());

        let oit_object = Fid::new(LOCAL_FILE_SEQ, OTABLE_IT_OID, 0);
        let has_oit = store.locate(oit_object).await?.is_some();

        let instance = Arc::new(Instance::new(
            key.to_string(),
            master,
            store,
            fid_client,
            local_root,
            bookmark,
            object_tdt,
            metadata_tdt,
            components,
            self.tick,
            self.default_speed,
            global_root,
            self.metrics.clone(),
        ));

        if has_oit {
            instance.setup_components();
        }

        self.add(key.to_string(), instance.clone())?;

        let object_mine = {
            let mut object_orphans = self.object_orphans.lock().unwrap();
            let (mine, rest): (Vec<_>, Vec<_>) = object_orphans.drain(..).partition(|e| e.device == key);
            *object_orphans = rest;
            mine
        };
        for entry in object_mine {
            instance.object_tdt.add(entry.td).await?;
        }

        let metadata_mine = {
            let mut metadata_orphans = self.metadata_orphans.lock().unwrap();
            let (mine, rest): (Vec<_>, Vec<_>) = metadata_orphans.drain(..).partition(|e| e.device == key);
            *metadata_orphans = rest;
            mine
        };
        for entry in metadata_mine {
            instance.metadata_tdt.add(entry.td).await?;
        }

        Ok(instance)
    }

    /// `find(..., unlink=true)` then drop the registry's own reference.
    pub fn degister(&self, key: &str) -> Result<(), LfsckError> {
        let removed = self.instances.lock().unwrap().remove(key);
        match removed {
            Some(inst) => {
                inst.decref();
                Ok(())
            }
            None => Err(LfsckError::NoSuchDevice(key.to_string())),
        }
    }

    /// Adds directly to the owning Instance's TDT if it's already
    /// registered; otherwise stages the descriptor on the matching orphan
    /// list for `register` to reconcile later.
    pub async fn add_target(&self, key: &str, td: TargetDescriptor, for_ost: bool) -> Result<(), LfsckError> {
        let inst = self.instances.lock().unwrap().get(key).cloned();
        if let Some(inst) = inst {
            let tdt = if for_ost { inst.object_tdt.clone() } else { inst.metadata_tdt.clone() };
            return tdt.add(td).await;
        }
        let entry = OrphanEntry { device: key.to_string(), td };
        if for_ost {
            self.object_orphans.lock().unwrap().push(entry);
        } else {
            self.metadata_orphans.lock().unwrap().push(entry);
        }
        Ok(())
    }

    pub async fn del_target(&self, key: &str, index: u16, for_ost: bool) -> Result<(), LfsckError> {
        let inst = self
            .instances
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| LfsckError::NoSuchDevice(key.to_string()))?;
        let tdt = if for_ost { &inst.object_tdt } else { &inst.metadata_tdt };
        tdt.remove(index).await?;
        Ok(())
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::LocalFidSequence;
    use crate::store::InMemoryStorage;

    fn fid(oid: u32) -> Fid {
        Fid::new(1, oid, 0)
    }

    async fn new_store() -> Arc<dyn StorageBackend> {
        Arc::new(InMemoryStorage::new())
    }

    #[tokio::test]
    async fn register_then_degister_removes_from_registry_s1() {
        let registry = InstanceRegistry::new(Duration::from_millis(10), 0);
        let store = new_store().await;
        registry
            .register("dev0", true, store, Arc::new(LocalFidSequence::new(3)))
            .await
            .unwrap();
        assert!(registry.find("dev0").is_some());

        registry.degister("dev0").unwrap();
        assert!(registry.find("dev0").is_none());
    }

    #[tokio::test]
    async fn duplicate_register_fails() {
        let registry = InstanceRegistry::new(Duration::from_millis(10), 0);
        let store = new_store().await;
        registry
            .register("dev1", true, store.clone(), Arc::new(LocalFidSequence::new(3)))
            .await
            .unwrap();
        let err = registry
            .register("dev1", true, store, Arc::new(LocalFidSequence::new(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, LfsckError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn degister_unknown_device_errors() {
        let registry = InstanceRegistry::new(Duration::from_millis(10), 0);
        let err = registry.degister("nope").unwrap_err();
        assert!(matches!(err, LfsckError::NoSuchDevice(_)));
    }

    #[tokio::test]
    async fn orphan_target_reconciles_on_register_s2() {
        let registry = InstanceRegistry::new(Duration::from_millis(10), 0);
        registry
            .add_target("dev2", TargetDescriptor::new(7, "ost7"), true)
            .await
            .unwrap();
        let store = new_store().await;
        let inst = registry
            .register("dev2", true, store, Arc::new(LocalFidSequence::new(3)))
            .await
            .unwrap();
        assert!(inst.object_tdt.bit_is_set(7).await);
        assert_eq!(inst.object_tdt.tgtnr().await, 1);
    }

    #[tokio::test]
    async fn del_target_on_unregistered_device_errors() {
        let registry = InstanceRegistry::new(Duration::from_millis(10), 0);
        let err = registry.del_target("dev3", 0, true).await.unwrap_err();
        assert!(matches!(err, LfsckError::NoSuchDevice(_)));
    }
}
