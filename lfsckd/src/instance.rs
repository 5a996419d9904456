//! The top-level scan unit bound to one storage device: owns the object's
//! bookmark, both target-descriptor tables, the component registry, the
//! speed governor, the scan engine, and the single supervisor task that
//! drives a run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lfsck_proto::{LfsckError, LfsckRequest, StartParam, StopParam};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bookmark_store::BookmarkStore;
use crate::component::{ComponentRegistry, ComponentType};
use crate::components::{LayoutComponent, NamespaceComponent};
use crate::engine::ScanEngine;
use crate::fid::{Fid, FidSequenceClient};
use crate::governor::SpeedGovernor;
use crate::metrics::Metrics;
use crate::store::StorageBackend;
use crate::tdt::TargetDescriptorTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// One Instance per registered storage device. `object_tdt` tracks OST-like
/// object targets; `metadata_tdt` tracks MDT-like metadata targets that
/// participate in the control protocol's fan-out.
pub struct Instance {
    pub key: String,
    pub master: bool,
    pub store: Arc<dyn StorageBackend>,
    pub fid_client: Arc<dyn FidSequenceClient>,
    pub local_root: Fid,
    pub bookmark: BookmarkStore,
    pub object_tdt: Arc<TargetDescriptorTable>,
    pub metadata_tdt: Arc<TargetDescriptorTable>,
    pub components: Arc<ComponentRegistry>,
    pub governor: Arc<SpeedGovernor>,
    pub engine: Arc<ScanEngine>,
    metrics: Arc<Metrics>,
    refcount: AtomicU64,
    thread_state: Mutex<ThreadState>,
    waitq: Arc<Notify>,
    control_task: tokio::sync::Mutex<Option<JoinHandle<Result<(), LfsckError>>>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("key", &self.key)
            .field("master", &self.master)
            .field("local_root", &self.local_root)
            .finish_non_exhaustive()
    }
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: String,
        master: bool,
        store: Arc<dyn StorageBackend>,
        fid_client: Arc<dyn FidSequenceClient>,
        local_root: Fid,
        bookmark: BookmarkStore,
        object_tdt: Arc<TargetDescriptorTable>,
        metadata_tdt: Arc<TargetDescriptorTable>,
        components: Arc<ComponentRegistry>,
        tick: Duration,
        default_speed: u32,
        global_root: Fid,
        metrics: Arc<Metrics>,
    ) -> Self {
        let governor = Arc::new(SpeedGovernor::new(tick, default_speed));
        let engine = Arc::new(ScanEngine::new(
            components.clone(),
            governor.clone(),
            store.clone(),
            global_root,
            local_root,
            metrics.clone(),
        ));
        Instance {
            key,
            master,
            store,
            fid_client,
            local_root,
            bookmark,
            object_tdt,
            metadata_tdt,
            components,
            governor,
            engine,
            metrics,
            refcount: AtomicU64::new(1),
            thread_state: Mutex::new(ThreadState::Init),
            waitq: Arc::new(Notify::new()),
            control_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn incref(&self) -> u64 {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the post-decrement count; the caller tears the Instance down
    /// once this reaches zero.
    pub fn decref(&self) -> u64 {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn thread_state(&self) -> ThreadState {
        *self.thread_state.lock().unwrap()
    }

    /// Registers the namespace and (non-exclusively) layout components per
    /// the master flag, mirroring `namespace_setup`/`layout_setup` being
    /// skipped on a non-master Instance.
    pub fn setup_components(&self) {
        if !self.master {
            return;
        }
        self.components
            .register_scan(Arc::new(NamespaceComponent::new(self.store.clone())));
        self.components
            .register_scan(Arc::new(LayoutComponent::new(self.store.clone())));
    }

    /// Starts the scan: applies any bookmark overrides carried in
    /// `StartParam`, then spawns the supervisor task running the engine
    /// over every object the OIT iterator names.
    pub async fn start(self: &Arc<Self>, objects: Vec<Fid>, p: &StartParam) -> Result<(), LfsckError> {
        if self.thread_state() == ThreadState::Running {
            return Err(LfsckError::AlreadyInState {
                expected: "init|stopped".into(),
                actual: "running".into(),
            });
        }
        if let Some(limit) = p.speed_limit {
            self.bookmark.set_speed(limit).await?;
            self.governor.set_limit(limit);
        }
        if let Some(windows) = p.async_windows {
            self.bookmark.set_windows(windows).await?;
        }

        *self.thread_state.lock().unwrap() = ThreadState::Running;
        let engine = self.engine.clone();
        let waitq = self.waitq.clone();
        let metrics = self.metrics.clone();
        let handle = tokio::spawn(async move {
            let result = engine.run(objects).await;
            metrics.record_objects_processed(engine.new_checked());
            match &result {
                Ok(()) => metrics.record_scan_completed(),
                Err(_) => metrics.record_scan_failed(),
            }
            waitq.notify_waiters();
            result
        });
        *self.control_task.lock().await = Some(handle);
        Ok(())
    }

    /// Sets the thread-state flag to `Stopping`, wakes the control waitq,
    /// interrupts any governor sleep, then blocks until the supervisor task
    /// reports itself stopped.
    pub async fn stop(&self, _p: &StopParam) -> Result<(), LfsckError> {
        if self.thread_state() == ThreadState::Stopped {
            return Err(LfsckError::AlreadyInState {
                expected: "init|running|stopping".into(),
                actual: "stopped".into(),
            });
        }
        *self.thread_state.lock().unwrap() = ThreadState::Stopping;
        self.engine.request_stop();
        self.waitq.notify_waiters();

        let handle = self.control_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.thread_state.lock().unwrap() = ThreadState::Stopped;
        Ok(())
    }

    /// Dispatches a control-protocol event carrying `active` to the
    /// matching component's `in_notify`, per the §4.8 dispatch table.
    pub async fn in_notify(&self, req: &LfsckRequest) -> Result<(), LfsckError> {
        let ty = if req.active & lfsck_proto::component_mask::NAMESPACE != 0 {
            ComponentType::Namespace
        } else if req.active & lfsck_proto::component_mask::LAYOUT != 0 {
            ComponentType::Layout
        } else {
            return Err(LfsckError::NotSupported("no component bit set in request".into()));
        };
        match self.components.find(ty) {
            Some(component) => component.in_notify(req).await,
            None => Err(LfsckError::NotSupported(format!("{ty:?} not active on {}", self.key))),
        }
    }

    pub async fn query(&self, req: &LfsckRequest) -> Result<String, LfsckError> {
        let ty = if req.active & lfsck_proto::component_mask::LAYOUT != 0 {
            ComponentType::Layout
        } else {
            ComponentType::Namespace
        };
        match self.components.find(ty) {
            Some(component) => component.query(req).await,
            None => Err(LfsckError::NotSupported(format!("{ty:?} not active on {}", self.key))),
        }
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

    async fn test_instance(key: &str) -> Arc<Instance> {
        let store: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let bookmark = BookmarkStore::setup(store.clone(), fid(900)).await.unwrap();
        let inst = Instance::new(
            key.to_string(),
            true,
            store.clone(),
            Arc::new(LocalFidSequence::new(3)),
            fid(1),
            bookmark,
            Arc::new(TargetDescriptorTable::new()),
            Arc::new(TargetDescriptorTable::new()),
            Arc::new(ComponentRegistry::new()),
            Duration::from_millis(10),
            0,
            fid(0),
            Arc::new(Metrics::new()),
        );
        inst.setup_components();
        Arc::new(inst)
    }

    #[tokio::test]
    async fn start_then_stop_transitions_thread_state() {
        let inst = test_instance("dev0").await;
        inst.start(vec![fid(10), fid(11)], &StartParam::default()).await.unwrap();
        inst.stop(&StopParam::default()).await.unwrap();
        assert_eq!(inst.thread_state(), ThreadState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let inst = test_instance("dev1").await;
        inst.start(vec![fid(10)], &StartParam::default()).await.unwrap();
        let err = inst.start(vec![fid(10)], &StartParam::default()).await.unwrap_err();
        assert!(matches!(err, LfsckError::AlreadyInState { .. }));
        inst.stop(&StopParam::default()).await.unwrap();
    }

    #[tokio::test]
    async fn double_stop_is_rejected() {
        let inst = test_instance("dev3").await;
        inst.start(vec![fid(10)], &StartParam::default()).await.unwrap();
        inst.stop(&StopParam::default()).await.unwrap();
        let err = inst.stop(&StopParam::default()).await.unwrap_err();
        assert!(matches!(err, LfsckError::AlreadyInState { .. }));
    }

    #[tokio::test]
    async fn refcount_round_trips_to_zero() {
        let inst = test_instance("dev2").await;
        assert_eq!(inst.incref(), 2);
        assert_eq!(inst.decref(), 1);
        assert_eq!(inst.decref(), 0);
    }
}
