use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lustre-style file identifier: sequence, object id, version. Zero in every
/// field is the canonical "no fid" sentinel used by `Position` and the
/// bookmark's `lpf_fid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fid {
    pub seq: u64,
    pub oid: u32,
    pub ver: u32,
}

impl Fid {
    pub const ZERO: Fid = Fid { seq: 0, oid: 0, ver: 0 };

    pub fn new(seq: u64, oid: u32, ver: u32) -> Fid {
        Fid { seq, oid, ver }
    }

    pub fn is_zero(&self) -> bool {
        *self == Fid::ZERO
    }
}

impl std::fmt::Display for Fid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}:{:#x}:{:#x}]", self.seq, self.oid, self.ver)
    }
}

/// Well-known local names resolved at `register` time.
pub const LOCAL_NAME_SEQ: u64 = 1;
pub const LOCAL_FILE_SEQ: u64 = 2;
pub const OTABLE_IT_OID: u32 = 1;

/// Stands in for `seq_client_init/fini/alloc_fid`: hands out monotonically
/// increasing FIDs within a single sequence.
#[async_trait]
pub trait FidSequenceClient: Send + Sync {
    async fn alloc_fid(&self) -> Fid;
}

/// A `FidSequenceClient` that allocates from a single in-process sequence,
/// sufficient for the daemon's own metadata target and for tests.
pub struct LocalFidSequence {
    seq: u64,
    next_oid: AtomicU64,
}

impl LocalFidSequence {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            next_oid: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl FidSequenceClient for LocalFidSequence {
    async fn alloc_fid(&self) -> Fid {
        let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
        Fid::new(self.seq, oid as u32, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fid_is_zero() {
        assert!(Fid::ZERO.is_zero());
        assert!(!Fid::new(1, 0, 0).is_zero());
    }

    #[tokio::test]
    async fn local_sequence_allocates_monotonically() {
        let client = LocalFidSequence::new(7);
        let a = client.alloc_fid().await;
        let b = client.alloc_fid().await;
        assert_eq!(a.seq, 7);
        assert_eq!(b.seq, 7);
        assert!(b.oid > a.oid);
    }
}
