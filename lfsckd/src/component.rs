//! Pluggable checkers and the per-Instance registry that tracks which list
//! (`scan`, `dir`, `double_scan`, `idle`) each one currently belongs to.
//!
//! The component set is closed for this engine (namespace and layout
//! checkers only), so the vtable is expressed as a trait object
//! (`Arc<dyn Component>`) rather than a tagged enum — the same shape the
//! daemon already uses for its pluggable event handlers.

use std::sync::Mutex;

use async_trait::async_trait;
use lfsck_proto::{LfsckError, LfsckRequest};

use crate::fid::Fid;
use crate::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Namespace,
    Layout,
}

impl ComponentType {
    pub fn mask(self) -> u32 {
        match self {
            ComponentType::Namespace => lfsck_proto::component_mask::NAMESPACE,
            ComponentType::Layout => lfsck_proto::component_mask::LAYOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Init,
    ScanningPhase1,
    ScanningPhase2,
    Completed,
    Failed,
    Stopped,
    Paused,
    Crashed,
    Partial,
    CoFailed,
    CoStopped,
    CoPaused,
}

/// Full operation set every component must implement, preserved in its
/// entirety regardless of how many operations a given checker actually
/// needs to do non-trivial work.
#[async_trait]
pub trait Component: Send + Sync {
    fn component_type(&self) -> ComponentType;
    fn state(&self) -> ComponentState;
    /// Whether this component wants `exec_dir` callbacks (membership on the
    /// `dir` sublist).
    fn wants_dir(&self) -> bool {
        true
    }

    async fn prep(&self, start: Position) -> Result<(), LfsckError>;
    async fn exec_oit(&self, obj: Fid) -> Result<(), LfsckError>;
    async fn exec_dir(&self, parent: Fid, entry: Fid) -> Result<(), LfsckError>;
    async fn post(&self, result: &Result<(), LfsckError>, init: bool);
    /// Persists `position` as this component's resumable start position;
    /// called with `init=true` only from a failed `prep`.
    async fn checkpoint(&self, position: Position, init: bool);
    async fn fail(&self);
    async fn double_scan(&self) -> Result<(), LfsckError>;
    fn dump(&self) -> String;
    async fn join(&self);
    async fn quit(&self);
    async fn in_notify(&self, req: &LfsckRequest) -> Result<(), LfsckError>;
    async fn stop_notify(&self, req: &LfsckRequest) -> Result<(), LfsckError>;
    async fn query(&self, req: &LfsckRequest) -> Result<String, LfsckError>;
    async fn reset(&self);
    fn new_checked(&self) -> u64;
    fn start_position(&self) -> Position;
}

use std::sync::Arc;

#[derive(Default)]
struct Lists {
    scan: Vec<Arc<dyn Component>>,
    dir: Vec<Arc<dyn Component>>,
    double_scan: Vec<Arc<dyn Component>>,
    idle: Vec<Arc<dyn Component>>,
}

/// Four ordered lists per Instance, protected by a single lock covering
/// every list move — the Rust stand-in for the Instance spinlock.
pub struct ComponentRegistry {
    lists: Mutex<Lists>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        ComponentRegistry { lists: Mutex::new(Lists::default()) }
    }

    /// Adds a freshly prepared component to `scan`, and to `dir` as well if
    /// it wants directory callbacks.
    pub fn register_scan(&self, component: Arc<dyn Component>) {
        let mut lists = self.lists.lock().unwrap();
        if component.wants_dir() {
            lists.dir.push(component.clone());
        }
        lists.scan.push(component);
    }

    pub fn scan_components(&self) -> Vec<Arc<dyn Component>> {
        self.lists.lock().unwrap().scan.clone()
    }

    pub fn dir_components(&self) -> Vec<Arc<dyn Component>> {
        self.lists.lock().unwrap().dir.clone()
    }

    pub fn double_scan_components(&self) -> Vec<Arc<dyn Component>> {
        self.lists.lock().unwrap().double_scan.clone()
    }

    /// Lookup order per the spec: `scan` -> `double_scan` -> `idle`.
    pub fn find(&self, ty: ComponentType) -> Option<Arc<dyn Component>> {
        let lists = self.lists.lock().unwrap();
        lists
            .scan
            .iter()
            .chain(lists.double_scan.iter())
            .chain(lists.idle.iter())
            .find(|c| c.component_type() == ty)
            .cloned()
    }

    /// Moves every `scan` component into `double_scan`, ready for the
    /// second scan phase.
    pub fn promote_to_double_scan(&self) {
        let mut lists = self.lists.lock().unwrap();
        let moved = std::mem::take(&mut lists.scan);
        lists.double_scan.extend(moved);
    }

    /// Moves every component currently in `double_scan` to `idle`, unless
    /// the caller indicates the Instance is paused (components stay put
    /// to be resumed later).
    pub fn retire_double_scan(&self, paused: bool) {
        if paused {
            return;
        }
        let mut lists = self.lists.lock().unwrap();
        let moved = std::mem::take(&mut lists.double_scan);
        lists.idle.extend(moved);
    }

    /// Moves every component in `scan` and `double_scan` to `idle`, used by
    /// `quit`.
    pub fn quit_all(&self) -> Vec<Arc<dyn Component>> {
        let mut lists = self.lists.lock().unwrap();
        let mut moved = std::mem::take(&mut lists.scan);
        moved.extend(std::mem::take(&mut lists.double_scan));
        lists.idle.extend(moved.iter().cloned());
        moved
    }

    pub fn is_double_scan_empty(&self) -> bool {
        self.lists.lock().unwrap().double_scan.is_empty()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubComponent {
        ty: ComponentType,
        state: Mutex<ComponentState>,
    }

    impl StubComponent {
        fn new(ty: ComponentType) -> Arc<Self> {
            Arc::new(StubComponent { ty, state: Mutex::new(ComponentState::Init) })
        }
    }

    #[async_trait]
    impl Component for StubComponent {
        fn component_type(&self) -> ComponentType {
            self.ty
        }

        fn state(&self) -> ComponentState {
            *self.state.lock().unwrap()
        }

        async fn prep(&self, _start: Position) -> Result<(), LfsckError> {
            *self.state.lock().unwrap() = ComponentState::ScanningPhase1;
            Ok(())
        }

        async fn exec_oit(&self, _obj: Fid) -> Result<(), LfsckError> {
            Ok(())
        }

        async fn exec_dir(&self, _parent: Fid, _entry: Fid) -> Result<(), LfsckError> {
            Ok(())
        }

        async fn post(&self, _result: &Result<(), LfsckError>, _init: bool) {
            *self.state.lock().unwrap() = ComponentState::Completed;
        }

        async fn checkpoint(&self, _position: Position, _init: bool) {}
        async fn fail(&self) {
            *self.state.lock().unwrap() = ComponentState::Failed;
        }

        async fn double_scan(&self) -> Result<(), LfsckError> {
            *self.state.lock().unwrap() = ComponentState::ScanningPhase2;
            Ok(())
        }

        fn dump(&self) -> String {
            format!("{:?}: {:?}", self.ty, self.state())
        }

        async fn join(&self) {}
        async fn quit(&self) {
            *self.state.lock().unwrap() = ComponentState::Stopped;
        }

        async fn in_notify(&self, _req: &LfsckRequest) -> Result<(), LfsckError> {
            Ok(())
        }

        async fn stop_notify(&self, _req: &LfsckRequest) -> Result<(), LfsckError> {
            Ok(())
        }

        async fn query(&self, _req: &LfsckRequest) -> Result<String, LfsckError> {
            Ok(self.dump())
        }

        async fn reset(&self) {
            *self.state.lock().unwrap() = ComponentState::Init;
        }

        fn new_checked(&self) -> u64 {
            0
        }

        fn start_position(&self) -> Position {
            Position::default()
        }
    }

    #[test]
    fn register_scan_adds_to_both_scan_and_dir() {
        let registry = ComponentRegistry::new();
        registry.register_scan(StubComponent::new(ComponentType::Namespace));
        assert_eq!(registry.scan_components().len(), 1);
        assert_eq!(registry.dir_components().len(), 1);
    }

    #[test]
    fn find_checks_scan_then_double_scan_then_idle() {
        let registry = ComponentRegistry::new();
        registry.register_scan(StubComponent::new(ComponentType::Layout));
        assert!(registry.find(ComponentType::Layout).is_some());
        assert!(registry.find(ComponentType::Namespace).is_none());
    }

    #[test]
    fn promote_and_retire_moves_between_lists() {
        let registry = ComponentRegistry::new();
        registry.register_scan(StubComponent::new(ComponentType::Namespace));
        registry.promote_to_double_scan();
        assert!(registry.scan_components().is_empty());
        assert_eq!(registry.double_scan_components().len(), 1);

        registry.retire_double_scan(false);
        assert!(registry.double_scan_components().is_empty());
    }

    #[test]
    fn retire_double_scan_is_noop_when_paused() {
        let registry = ComponentRegistry::new();
        registry.register_scan(StubComponent::new(ComponentType::Namespace));
        registry.promote_to_double_scan();
        registry.retire_double_scan(true);
        assert_eq!(registry.double_scan_components().len(), 1);
    }

    #[test]
    fn quit_all_moves_scan_and_double_scan_to_idle() {
        let registry = ComponentRegistry::new();
        registry.register_scan(StubComponent::new(ComponentType::Namespace));
        registry.register_scan(StubComponent::new(ComponentType::Layout));
        registry.promote_to_double_scan();
        let quit = registry.quit_all();
        assert_eq!(quit.len(), 2);
        assert!(registry.double_scan_components().is_empty());
        assert!(registry.scan_components().is_empty());
    }
}
