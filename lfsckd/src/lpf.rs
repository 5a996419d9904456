//! Lazy, transactional creation of `.lustre/lost+found/MDT<xxxx>`, local or
//! cross-target depending on whether the owning metadata index is 0.

use std::sync::Arc;

use lfsck_proto::LfsckError;

use crate::bookmark_store::BookmarkStore;
use crate::fid::{Fid, FidSequenceClient};
use crate::metrics::Metrics;
use crate::store::{ObjectKind, Op, StorageBackend};

fn lpf_name(metadata_index: u16) -> String {
    format!("MDT{metadata_index:04}")
}

/// Builds the per-metadata-target lost+found container. `local` is the
/// device's own storage backend; `remote` is the backend for the metadata
/// target owning the `lost+found` parent directory when `metadata_index !=
/// 0` (reached through the RPC substrate in the running daemon).
pub struct LpfBuilder {
    local: Arc<dyn StorageBackend>,
    remote: Option<Arc<dyn StorageBackend>>,
    fid_client: Arc<dyn FidSequenceClient>,
    metrics: Arc<Metrics>,
}

impl LpfBuilder {
    pub fn new(
        local: Arc<dyn StorageBackend>,
        remote: Option<Arc<dyn StorageBackend>>,
        fid_client: Arc<dyn FidSequenceClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        LpfBuilder { local, remote, fid_client, metrics }
    }

    /// Creates (or recovers) the `lost+found/MDT<xxxx>` directory rooted at
    /// `parent`, owned by `metadata_index`, persisting the resulting FID
    /// into the bookmark. Returns the child FID.
    pub async fn build(
        &self,
        bookmark: &BookmarkStore,
        parent: Fid,
        metadata_index: u16,
    ) -> Result<Fid, LfsckError> {
        let bk = bookmark.load().await?;
        if !bk.lpf_fid_is_zero() {
            return Ok(Fid::new(bk.lpf_fid_seq, bk.lpf_fid_oid, bk.lpf_fid_ver));
        }

        let name = lpf_name(metadata_index);
        let parent_store = self.parent_store(metadata_index);

        // Recovery: a prior crash may have landed the dirent without
        // persisting the bookmark. Prefer the discovered FID over minting
        // a new one.
        let child = match parent_store.lookup(parent, &name).await? {
            Some(existing) => existing,
            None => self.fid_client.alloc_fid().await,
        };

        if metadata_index == 0 {
            self.build_local(bookmark, parent, &name, child).await
        } else {
            self.build_cross_target(bookmark, parent, &name, child).await
        }
    }

    fn parent_store(&self, metadata_index: u16) -> Arc<dyn StorageBackend> {
        if metadata_index == 0 {
            self.local.clone()
        } else {
            self.remote.clone().unwrap_or_else(|| self.local.clone())
        }
    }

    async fn build_local(
        &self,
        bookmark: &BookmarkStore,
        parent: Fid,
        name: &str,
        child: Fid,
    ) -> Result<Fid, LfsckError> {
        let mut txn = self.local.begin_transaction();
        txn.declare(Op::Create { fid: child, kind: ObjectKind::Directory, remote: false });
        txn.declare(Op::Insert { parent: child, name: ".".into(), target: child });
        txn.declare(Op::Insert { parent: child, name: "..".into(), target: parent });
        txn.declare(Op::RefAdd(child));
        txn.declare(Op::Insert { parent, name: name.to_string(), target: child });
        txn.declare(Op::RefAdd(parent));
        self.local.commit(txn).await?;

        bookmark.set_lpf_fid(child).await?;
        self.metrics.record_lpf_build();
        Ok(child)
    }

    async fn build_cross_target(
        &self,
        bookmark: &BookmarkStore,
        parent: Fid,
        name: &str,
        child: Fid,
    ) -> Result<Fid, LfsckError> {
        // T1 (local): create the child and its self-referential entries.
        let mut t1 = self.local.begin_transaction();
        t1.declare(Op::Create { fid: child, kind: ObjectKind::Directory, remote: false });
        t1.declare(Op::Insert { parent: child, name: ".".into(), target: child });
        t1.declare(Op::Insert { parent: child, name: "..".into(), target: parent });
        t1.declare(Op::RefAdd(child));
        self.local.commit(t1).await?;

        // T2 (remote + local): insert the child into the remote parent.
        let remote = self.parent_store(1);
        let mut t2 = remote.begin_transaction();
        t2.declare(Op::Insert { parent, name: name.to_string(), target: child });
        t2.declare(Op::RefAdd(parent));

        match remote.commit(t2).await {
            Ok(()) => {
                bookmark.set_lpf_fid(child).await?;
                self.metrics.record_lpf_build();
                Ok(child)
            }
            Err(e) => {
                // Rollback declarations staged inside T2: undo the two
                // local ref increments for `.`/`..` and destroy the child.
                let mut rollback = self.local.begin_transaction();
                rollback.declare(Op::RefDel(child));
                rollback.declare(Op::RefDel(child));
                rollback.declare(Op::Destroy(child));
                self.local.commit(rollback).await?;
                self.metrics.record_lpf_rollback();
                Err(LfsckError::LpfBuildFailed(e.to_string()))
            }
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

    async fn bookmark_for(store: Arc<dyn StorageBackend>) -> BookmarkStore {
        BookmarkStore::setup(store, fid(900)).await.unwrap()
    }

    #[tokio::test]
    async fn local_build_creates_child_and_updates_bookmark() {
        let store: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let mut txn = store.begin_transaction();
        txn.declare(Op::Create { fid: fid(1), kind: ObjectKind::Directory, remote: false });
        store.commit(txn).await.unwrap();

        let bookmark = bookmark_for(store.clone()).await;
        let fid_client = Arc::new(LocalFidSequence::new(2));
        let builder = LpfBuilder::new(store.clone(), None, fid_client, Arc::new(Metrics::new()));

        let child = builder.build(&bookmark, fid(1), 0).await.unwrap();
        assert!(store.try_as_dir(child).await.unwrap());
        assert_eq!(store.lookup(fid(1), "MDT0000").await.unwrap(), Some(child));
        let bk = bookmark.load().await.unwrap();
        assert!(!bk.lpf_fid_is_zero());
    }

    #[tokio::test]
    async fn second_call_returns_persisted_fid_without_rebuilding() {
        let store: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let mut txn = store.begin_transaction();
        txn.declare(Op::Create { fid: fid(1), kind: ObjectKind::Directory, remote: false });
        store.commit(txn).await.unwrap();

        let bookmark = bookmark_for(store.clone()).await;
        let fid_client = Arc::new(LocalFidSequence::new(2));
        let builder = LpfBuilder::new(store.clone(), None, fid_client, Arc::new(Metrics::new()));

        let first = builder.build(&bookmark, fid(1), 0).await.unwrap();
        let second = builder.build(&bookmark, fid(1), 0).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cross_target_rollback_leaves_child_unreachable() {
        let local: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        // A remote store whose commit always fails for this parent, since
        // the parent object was never created there.
        let remote: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());

        let bookmark = bookmark_for(local.clone()).await;
        let fid_client = Arc::new(LocalFidSequence::new(2));
        let builder = LpfBuilder::new(local.clone(), Some(remote.clone()), fid_client, Arc::new(Metrics::new()));

        let parent = fid(5);
        let err = builder.build(&bookmark, parent, 1).await.unwrap_err();
        assert!(matches!(err, LfsckError::LpfBuildFailed(_)));

        // Property 7: the child is not reachable from any directory, and
        // does not exist on the local backend either.
        assert_eq!(remote.lookup(parent, "MDT0001").await.unwrap(), None);
        let bk = bookmark.load().await.unwrap();
        assert!(bk.lpf_fid_is_zero());
    }
}
