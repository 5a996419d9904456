use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lfsck_proto::{LfsckError, LfsckEvent, LfsckRequest};

use crate::component::{Component, ComponentState, ComponentType};
use crate::fid::Fid;
use crate::position::Position;
use crate::store::StorageBackend;

/// Checks namespace consistency: every scanned object must resolve back
/// through the directory entries that claim to contain it, and every
/// directory entry's target must actually exist.
pub struct NamespaceComponent {
    store: Arc<dyn StorageBackend>,
    state: Mutex<ComponentState>,
    start: Mutex<Position>,
    new_checked: AtomicU64,
    inconsistencies: AtomicU64,
}

impl NamespaceComponent {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        NamespaceComponent {
            store,
            state: Mutex::new(ComponentState::Init),
            start: Mutex::new(Position::default()),
            new_checked: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
        }
    }

    pub fn inconsistencies_found(&self) -> u64 {
        self.inconsistencies.load(Ordering::Relaxed)
    }

    fn set_state(&self, s: ComponentState) {
        *self.state.lock().unwrap() = s;
    }
}

#[async_trait]
impl Component for NamespaceComponent {
    fn component_type(&self) -> ComponentType {
        ComponentType::Namespace
    }

    fn state(&self) -> ComponentState {
        *self.state.lock().unwrap()
    }

    async fn prep(&self, start: Position) -> Result<(), LfsckError> {
        *self.start.lock().unwrap() = start;
        self.new_checked.store(0, Ordering::Relaxed);
        self.set_state(ComponentState::ScanningPhase1);
        Ok(())
    }

    async fn exec_oit(&self, obj: Fid) -> Result<(), LfsckError> {
        self.new_checked.fetch_add(1, Ordering::Relaxed);
        if self.store.locate(obj).await?.is_none() {
            self.inconsistencies.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn exec_dir(&self, parent: Fid, entry: Fid) -> Result<(), LfsckError> {
        self.new_checked.fetch_add(1, Ordering::Relaxed);
        if self.store.locate(entry).await?.is_none() {
            self.inconsistencies.fetch_add(1, Ordering::Relaxed);
        }
        let _ = parent;
        Ok(())
    }

    async fn post(&self, result: &Result<(), LfsckError>, init: bool) {
        if !init {
            self.set_state(match result {
                Ok(()) => ComponentState::Completed,
                Err(_) => ComponentState::Failed,
            });
        }
    }

    async fn checkpoint(&self, position: Position, _init: bool) {
        *self.start.lock().unwrap() = position;
    }

    async fn fail(&self) {
        self.set_state(ComponentState::Failed);
    }

    async fn double_scan(&self) -> Result<(), LfsckError> {
        self.set_state(ComponentState::ScanningPhase2);
        Ok(())
    }

    fn dump(&self) -> String {
        format!(
            "namespace: state={:?} checked={} inconsistencies={}",
            self.state(),
            self.new_checked.load(Ordering::Relaxed),
            self.inconsistencies.load(Ordering::Relaxed),
        )
    }

    async fn join(&self) {}

    async fn quit(&self) {
        self.set_state(ComponentState::Stopped);
    }

    async fn in_notify(&self, req: &LfsckRequest) -> Result<(), LfsckError> {
        match req.event {
            LfsckEvent::Phase1Done => {
                self.set_state(ComponentState::ScanningPhase2);
                Ok(())
            }
            LfsckEvent::Phase2Done => {
                self.set_state(ComponentState::Completed);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn stop_notify(&self, _req: &LfsckRequest) -> Result<(), LfsckError> {
        self.set_state(ComponentState::CoStopped);
        Ok(())
    }

    async fn query(&self, _req: &LfsckRequest) -> Result<String, LfsckError> {
        Ok(self.dump())
    }

    async fn reset(&self) {
        self.new_checked.store(0, Ordering::Relaxed);
        self.inconsistencies.store(0, Ordering::Relaxed);
        self.set_state(ComponentState::Init);
    }

    fn new_checked(&self) -> u64 {
        self.new_checked.load(Ordering::Relaxed)
    }

    fn start_position(&self) -> Position {
        *self.start.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStorage, ObjectKind, Op};

    fn fid(oid: u32) -> Fid {
        Fid::new(1, oid, 0)
    }

    #[tokio::test]
    async fn exec_oit_flags_missing_object() {
        let store = Arc::new(InMemoryStorage::new());
        let ns = NamespaceComponent::new(store);
        ns.prep(Position::default()).await.unwrap();
        ns.exec_oit(fid(1)).await.unwrap();
        assert_eq!(ns.inconsistencies_found(), 1);
        assert_eq!(ns.new_checked(), 1);
    }

    #[tokio::test]
    async fn exec_oit_passes_for_existing_object() {
        let store = Arc::new(InMemoryStorage::new());
        let mut txn = store.begin_transaction();
        txn.declare(Op::Create { fid: fid(1), kind: ObjectKind::Regular, remote: false });
        store.commit(txn).await.unwrap();

        let ns = NamespaceComponent::new(store);
        ns.prep(Position::default()).await.unwrap();
        ns.exec_oit(fid(1)).await.unwrap();
        assert_eq!(ns.inconsistencies_found(), 0);
    }

    #[tokio::test]
    async fn phase_done_notifications_advance_state() {
        let store = Arc::new(InMemoryStorage::new());
        let ns = NamespaceComponent::new(store);
        ns.prep(Position::default()).await.unwrap();
        let req = LfsckRequest {
            event: LfsckEvent::Phase1Done,
            index: 0,
            status: 0,
            version: 1,
            active: ComponentType::Namespace.mask(),
            param: 0,
            speed: 0,
            async_windows: 0,
            valid: 0,
        };
        ns.in_notify(&req).await.unwrap();
        assert_eq!(ns.state(), ComponentState::ScanningPhase2);
    }
}
