//! Stands in for the `dt_` object-store collaborator named in the engine's
//! external interfaces: creation, directory insertion, reference counting,
//! xattrs, and the declared-transaction protocol the LPF builder and
//! bookmark store both rely on.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lfsck_proto::LfsckError;
use serde::{Deserialize, Serialize};

use crate::fid::Fid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Regular,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub fid: Fid,
    pub kind: ObjectKind,
    pub nlink: u32,
    pub remote: bool,
    pub xattrs: HashMap<String, Vec<u8>>,
    pub record: Vec<u8>,
}

impl StoredObject {
    fn new(fid: Fid, kind: ObjectKind) -> Self {
        StoredObject {
            fid,
            kind,
            nlink: 0,
            remote: false,
            xattrs: HashMap::new(),
            record: Vec::new(),
        }
    }
}

/// A single step of a declared transaction. Every LPF-builder and
/// bookmark-store mutation is expressed as a sequence of these, applied
/// atomically on `Transaction::commit` and discarded on `rollback`.
#[derive(Debug, Clone)]
pub enum Op {
    Create { fid: Fid, kind: ObjectKind, remote: bool },
    Insert { parent: Fid, name: String, target: Fid },
    Unlink { parent: Fid, name: String },
    RefAdd(Fid),
    RefDel(Fid),
    Destroy(Fid),
    WriteRecord { fid: Fid, data: Vec<u8> },
}

/// A declared transaction: operations are queued with `declare` and applied
/// as a unit on `commit`. `rollback` (or simply dropping the transaction)
/// discards the queue with no effect on the backend.
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    fn new() -> Self {
        Transaction { ops: Vec::new() }
    }

    pub fn declare(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn take_ops(self) -> Vec<Op> {
        self.ops
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn begin_transaction(&self) -> Transaction {
        Transaction::new()
    }

    async fn commit(&self, txn: Transaction) -> Result<(), LfsckError>;

    /// Discard a transaction without applying it. Provided for symmetry with
    /// `commit`; the default no-op is correct for any backend since a
    /// transaction that is never committed has made no visible change.
    fn rollback(&self, _txn: Transaction) {}

    async fn lookup(&self, parent: Fid, name: &str) -> Result<Option<Fid>, LfsckError>;
    async fn locate(&self, fid: Fid) -> Result<Option<StoredObject>, LfsckError>;
    async fn try_as_dir(&self, fid: Fid) -> Result<bool, LfsckError>;
    async fn xattr_get(&self, fid: Fid, name: &str) -> Result<Option<Vec<u8>>, LfsckError>;
    async fn record_read(&self, fid: Fid) -> Result<Vec<u8>, LfsckError>;
}

#[derive(Default, Clone)]
struct InMemoryState {
    objects: HashMap<Fid, StoredObject>,
    dirents: HashMap<(Fid, String), Fid>,
}

/// In-process `StorageBackend`, used by unit tests and by any metadata
/// target the daemon simulates locally rather than through the RPC
/// substrate.
pub struct InMemoryStorage {
    state: Mutex<InMemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage {
            state: Mutex::new(InMemoryState::default()),
        }
    }

    /// Seeds a directory object directly, bypassing the transaction
    /// protocol. Used to set up fixtures such as the global root.
    pub fn seed_dir(&self, fid: Fid) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(fid, StoredObject::new(fid, ObjectKind::Directory));
    }

    pub fn seed_dirent(&self, parent: Fid, name: &str, target: Fid) {
        let mut state = self.state.lock().unwrap();
        state.dirents.insert((parent, name.to_string()), target);
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_op(state: &mut InMemoryState, op: Op) -> Result<(), LfsckError> {
    match op {
        Op::Create { fid, kind, remote } => {
            let mut obj = StoredObject::new(fid, kind);
            obj.remote = remote;
            state.objects.insert(fid, obj);
            Ok(())
        }
        Op::Insert { parent, name, target } => {
            state.dirents.insert((parent, name), target);
            Ok(())
        }
        Op::Unlink { parent, name } => {
            state.dirents.remove(&(parent, name));
            Ok(())
        }
        Op::RefAdd(fid) => {
            let obj = state
                .objects
                .get_mut(&fid)
                .ok_or(LfsckError::Io(format!("ref_add on unknown fid {fid}")))?;
            obj.nlink += 1;
            Ok(())
        }
        Op::RefDel(fid) => {
            let obj = state
                .objects
                .get_mut(&fid)
                .ok_or(LfsckError::Io(format!("ref_del on unknown fid {fid}")))?;
            obj.nlink = obj.nlink.saturating_sub(1);
            Ok(())
        }
        Op::Destroy(fid) => {
            state.objects.remove(&fid);
            Ok(())
        }
        Op::WriteRecord { fid, data } => {
            let obj = state
                .objects
                .get_mut(&fid)
                .ok_or(LfsckError::Io(format!("record_write on unknown fid {fid}")))?;
            obj.record = data;
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn commit(&self, txn: Transaction) -> Result<(), LfsckError> {
        let mut state = self.state.lock().unwrap();
        // Apply to a scratch copy first so a mid-transaction failure never
        // leaves a partially-applied set of ops visible to readers.
        let mut scratch = state.clone();
        for op in txn.take_ops() {
            apply_op(&mut scratch, op)?;
        }
        *state = scratch;
        Ok(())
    }

    async fn lookup(&self, parent: Fid, name: &str) -> Result<Option<Fid>, LfsckError> {
        let state = self.state.lock().unwrap();
        Ok(state.dirents.get(&(parent, name.to_string())).copied())
    }

    async fn locate(&self, fid: Fid) -> Result<Option<StoredObject>, LfsckError> {
        let state = self.state.lock().unwrap();
        Ok(state.objects.get(&fid).cloned())
    }

    async fn try_as_dir(&self, fid: Fid) -> Result<bool, LfsckError> {
        let state = self.state.lock().unwrap();
        Ok(matches!(
            state.objects.get(&fid),
            Some(StoredObject { kind: ObjectKind::Directory, .. })
        ))
    }

    async fn xattr_get(&self, fid: Fid, name: &str) -> Result<Option<Vec<u8>>, LfsckError> {
        let state = self.state.lock().unwrap();
        Ok(state.objects.get(&fid).and_then(|o| o.xattrs.get(name).cloned()))
    }

    async fn record_read(&self, fid: Fid) -> Result<Vec<u8>, LfsckError> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&fid)
            .map(|o| o.record.clone())
            .ok_or(LfsckError::NotFound(format!("record for {fid}")))
    }
}
