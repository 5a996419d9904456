use bytemuck::{Pod, Zeroable};

use crate::error::LfsckError;

/// Magic stamped into byte 0 of every persisted bookmark record, used to
/// reject garbage on load rather than silently treating it as a fresh scan.
pub const BOOKMARK_MAGIC: u32 = 0x4C46_534B; // "LFSK"

pub const BOOKMARK_VERSION: u16 = 1;

/// Param flags kept in [`Bookmark::param`]. `BROADCAST` and `RESET` from the
/// control protocol's param bits are deliberately excluded — they describe
/// how a request was delivered, not persistent scan configuration, and are
/// never written to disk.
pub mod bookmark_param {
    pub const FAILOUT: u32 = 1 << 0;
    pub const DRYRUN: u32 = 1 << 1;
    pub const ALL_TGT: u32 = 1 << 2;
    pub const ORPHAN: u32 = 1 << 3;
}

/// Fixed-size little-endian record persisted for one Instance's scan state.
///
/// `#[repr(C)]` plus `Pod`/`Zeroable` gives this struct a stable byte layout
/// so it can be written to and read from a storage backend column verbatim,
/// the same way the sequencer ring-buffer slot is laid out for mmap access.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Bookmark {
    pub magic: u32,
    pub version: u16,
    pub _reserved0: u16,
    pub speed_limit: u32,
    pub async_windows: u16,
    pub _reserved1: u16,
    pub param: u32,
    pub _reserved2: u32,
    pub last_fid_seq: u64,
    pub last_fid_oid: u32,
    pub last_fid_ver: u32,
    pub lpf_fid_seq: u64,
    pub lpf_fid_oid: u32,
    pub lpf_fid_ver: u32,
}

impl Default for Bookmark {
    fn default() -> Self {
        Bookmark {
            magic: BOOKMARK_MAGIC,
            version: BOOKMARK_VERSION,
            _reserved0: 0,
            speed_limit: 0,
            async_windows: 0,
            _reserved1: 0,
            param: 0,
            _reserved2: 0,
            last_fid_seq: 0,
            last_fid_oid: 0,
            last_fid_ver: 0,
            lpf_fid_seq: 0,
            lpf_fid_oid: 0,
            lpf_fid_ver: 0,
        }
    }
}

impl Bookmark {
    pub const ENCODED_LEN: usize = std::mem::size_of::<Bookmark>();

    /// `.to_le()` is a no-op on a little-endian host and a full byte-swap on
    /// a big-endian one, so calling this on both encode and decode keeps the
    /// on-disk record little-endian regardless of host byte order.
    fn byteswap(self) -> Bookmark {
        Bookmark {
            magic: self.magic.to_le(),
            version: self.version.to_le(),
            _reserved0: self._reserved0.to_le(),
            speed_limit: self.speed_limit.to_le(),
            async_windows: self.async_windows.to_le(),
            _reserved1: self._reserved1.to_le(),
            param: self.param.to_le(),
            _reserved2: self._reserved2.to_le(),
            last_fid_seq: self.last_fid_seq.to_le(),
            last_fid_oid: self.last_fid_oid.to_le(),
            last_fid_ver: self.last_fid_ver.to_le(),
            lpf_fid_seq: self.lpf_fid_seq.to_le(),
            lpf_fid_oid: self.lpf_fid_oid.to_le(),
            lpf_fid_ver: self.lpf_fid_ver.to_le(),
        }
    }

    pub fn to_bytes(&self) -> [u8; Bookmark::ENCODED_LEN] {
        bytemuck::cast(self.byteswap())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Bookmark, LfsckError> {
        if buf.len() != Bookmark::ENCODED_LEN {
            return Err(LfsckError::CorruptBookmark(format!(
                "expected {} bytes, found {}",
                Bookmark::ENCODED_LEN,
                buf.len()
            )));
        }
        let mut arr = [0u8; Bookmark::ENCODED_LEN];
        arr.copy_from_slice(buf);
        let bk: Bookmark = bytemuck::cast(arr);
        let bk = bk.byteswap();
        if bk.magic != BOOKMARK_MAGIC {
            return Err(LfsckError::CorruptBookmark(format!(
                "bad magic 0x{:08x}",
                bk.magic
            )));
        }
        Ok(bk)
    }

    pub fn lpf_fid_is_zero(&self) -> bool {
        self.lpf_fid_seq == 0 && self.lpf_fid_oid == 0 && self.lpf_fid_ver == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let mut bk = Bookmark::default();
        bk.speed_limit = 1000;
        bk.async_windows = 4;
        bk.param = bookmark_param::FAILOUT | bookmark_param::DRYRUN;
        let bytes = bk.to_bytes();
        let decoded = Bookmark::from_bytes(&bytes).unwrap();
        assert_eq!(bk, decoded);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = Bookmark::from_bytes(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, LfsckError::CorruptBookmark(_)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Bookmark::default().to_bytes();
        bytes[0] = 0xff;
        let err = Bookmark::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, LfsckError::CorruptBookmark(_)));
    }

    #[test]
    fn fresh_bookmark_has_zero_lpf_fid() {
        assert!(Bookmark::default().lpf_fid_is_zero());
    }
}
