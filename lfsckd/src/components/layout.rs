use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lfsck_proto::{LfsckError, LfsckEvent, LfsckRequest};

use crate::component::{Component, ComponentState, ComponentType};
use crate::fid::Fid;
use crate::position::Position;
use crate::store::{ObjectKind, StorageBackend};

const LAYOUT_XATTR: &str = "trusted.lov";

/// Checks that every regular file carries a striping layout xattr, the
/// namespace-adjacent but orthogonal consistency class the original engine
/// splits into its own component so it can run, fail, and checkpoint
/// independently of the namespace checker.
pub struct LayoutComponent {
    store: Arc<dyn StorageBackend>,
    state: Mutex<ComponentState>,
    start: Mutex<Position>,
    new_checked: AtomicU64,
    missing_layout: AtomicU64,
}

impl LayoutComponent {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        LayoutComponent {
            store,
            state: Mutex::new(ComponentState::Init),
            start: Mutex::new(Position::default()),
            new_checked: AtomicU64::new(0),
            missing_layout: AtomicU64::new(0),
        }
    }

    pub fn missing_layout_found(&self) -> u64 {
        self.missing_layout.load(Ordering::Relaxed)
    }

    fn set_state(&self, s: ComponentState) {
        *self.state.lock().unwrap() = s;
    }
}

#[async_trait]
impl Component for LayoutComponent {
    fn component_type(&self) -> ComponentType {
        ComponentType::Layout
    }

    fn state(&self) -> ComponentState {
        *self.state.lock().unwrap()
    }

    fn wants_dir(&self) -> bool {
        false
    }

    async fn prep(&self, start: Position) -> Result<(), LfsckError> {
        *self.start.lock().unwrap() = start;
        self.new_checked.store(0, Ordering::Relaxed);
        self.set_state(ComponentState::ScanningPhase1);
        Ok(())
    }

    async fn exec_oit(&self, obj: Fid) -> Result<(), LfsckError> {
        self.new_checked.fetch_add(1, Ordering::Relaxed);
        if let Some(object) = self.store.locate(obj).await? {
            if object.kind == ObjectKind::Regular && self.store.xattr_get(obj, LAYOUT_XATTR).await?.is_none() {
                self.missing_layout.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn exec_dir(&self, _parent: Fid, _entry: Fid) -> Result<(), LfsckError> {
        // Layout checker only cares about the OIT pass; it does not want
        // directory callbacks (see `wants_dir`).
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
            "layout: state={:?} checked={} missing_layout={}",
            self.state(),
            self.new_checked.load(Ordering::Relaxed),
            self.missing_layout.load(Ordering::Relaxed),
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
        self.missing_layout.store(0, Ordering::Relaxed);
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
    use crate::store::{InMemoryStorage, Op};

    fn fid(oid: u32) -> Fid {
        Fid::new(1, oid, 0)
    }

    #[tokio::test]
    async fn flags_regular_object_missing_layout_xattr() {
        let store = Arc::new(InMemoryStorage::new());
        let mut txn = store.begin_transaction();
        txn.declare(Op::Create { fid: fid(1), kind: ObjectKind::Regular, remote: false });
        store.commit(txn).await.unwrap();

        let layout = LayoutComponent::new(store);
        layout.prep(Position::default()).await.unwrap();
        layout.exec_oit(fid(1)).await.unwrap();
        assert_eq!(layout.missing_layout_found(), 1);
    }

    #[tokio::test]
    async fn directories_are_never_flagged() {
        let store = Arc::new(InMemoryStorage::new());
        let mut txn = store.begin_transaction();
        txn.declare(Op::Create { fid: fid(1), kind: ObjectKind::Directory, remote: false });
        store.commit(txn).await.unwrap();

        let layout = LayoutComponent::new(store);
        layout.prep(Position::default()).await.unwrap();
        layout.exec_oit(fid(1)).await.unwrap();
        assert_eq!(layout.missing_layout_found(), 0);
    }

    #[test]
    fn layout_component_does_not_want_dir_callbacks() {
        let store = Arc::new(InMemoryStorage::new());
        let layout = LayoutComponent::new(store);
        assert!(!layout.wants_dir());
    }
}
