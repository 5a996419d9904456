//! On-disk persistent scan state. The bookmark is a fixed-size
//! little-endian record; here it lives as the `record` bytes of a
//! dedicated storage object, one per Instance, written through the
//! declared-transaction protocol of [`crate::store`].

use std::sync::Arc;

use lfsck_proto::{Bookmark, LfsckError, ASYNC_WIN_MAX};

use crate::fid::Fid;
use crate::store::{ObjectKind, Op, StorageBackend};

pub struct BookmarkStore {
    store: Arc<dyn StorageBackend>,
    object: Fid,
}

impl BookmarkStore {
    /// Ensures the dedicated bookmark object exists and returns a handle to
    /// it. Idempotent: calling this against an already-initialized device
    /// is a no-op past the first `load`.
    pub async fn setup(store: Arc<dyn StorageBackend>, object: Fid) -> Result<Self, LfsckError> {
        if store.locate(object).await?.is_none() {
            let mut txn = store.begin_transaction();
            txn.declare(Op::Create { fid: object, kind: ObjectKind::Regular, remote: false });
            txn.declare(Op::WriteRecord { fid: object, data: Bookmark::default().to_bytes().to_vec() });
            store.commit(txn).await?;
        }
        Ok(BookmarkStore { store, object })
    }

    pub async fn load(&self) -> Result<Bookmark, LfsckError> {
        let bytes = self.store.record_read(self.object).await?;
        Bookmark::from_bytes(&bytes)
    }

    /// Writes the given bookmark through a declared transaction, mirroring
    /// the "write through the enclosing transaction" requirement.
    pub async fn save(&self, bk: &Bookmark) -> Result<(), LfsckError> {
        let mut txn = self.store.begin_transaction();
        txn.declare(Op::WriteRecord { fid: self.object, data: bk.to_bytes().to_vec() });
        self.store.commit(txn).await
    }

    pub async fn set_speed(&self, limit: u32) -> Result<(), LfsckError> {
        let mut bk = self.load().await?;
        bk.speed_limit = limit;
        self.save(&bk).await
    }

    pub async fn get_speed(&self) -> Result<String, LfsckError> {
        Ok(format!("{}\n", self.load().await?.speed_limit))
    }

    pub async fn set_windows(&self, windows: u16) -> Result<(), LfsckError> {
        if windows > ASYNC_WIN_MAX {
            return Err(LfsckError::InvalidArgument(format!(
                "async_windows {windows} exceeds max {ASYNC_WIN_MAX}"
            )));
        }
        let mut bk = self.load().await?;
        bk.async_windows = windows;
        self.save(&bk).await
    }

    pub async fn get_windows(&self) -> Result<String, LfsckError> {
        Ok(format!("{}\n", self.load().await?.async_windows))
    }

    pub async fn set_last_fid(&self, fid: Fid) -> Result<(), LfsckError> {
        let mut bk = self.load().await?;
        bk.last_fid_seq = fid.seq;
        bk.last_fid_oid = fid.oid;
        bk.last_fid_ver = fid.ver;
        self.save(&bk).await
    }

    pub async fn set_lpf_fid(&self, fid: Fid) -> Result<(), LfsckError> {
        let mut bk = self.load().await?;
        bk.lpf_fid_seq = fid.seq;
        bk.lpf_fid_oid = fid.oid;
        bk.lpf_fid_ver = fid.ver;
        self.save(&bk).await
    }
}
