//! Wire types shared between `lfsckd` instances and between the daemon and
//! its control-plane clients (HTTP API, CLI).
//!
//! The fixed-layout records here mirror the on-the-wire `lfsck_request` and
//! on-disk `lfsck_bookmark` structures of the original checker: a handful of
//! scalar fields plus bitmask flags, never a variable-length payload.

pub mod bookmark;
pub mod error;
pub mod request;

pub use bookmark::Bookmark;
pub use error::LfsckError;
pub use request::{LfsckEvent, LfsckRequest, StartParam, StopParam};

/// Target pointers held per page of a target-descriptor table.
pub const TGT_PTRS_PER_BLOCK: usize = 256;

/// Upper bound on the async scan-request window size (`lb_async_windows`).
pub const ASYNC_WIN_MAX: u16 = 1024;

/// Number of scanned items between bookmark checkpoints.
pub const CHECKPOINT_INTERVAL: u64 = 1024;

/// Hard bound on `needs_scan_dir`'s parent-chain walk, guarding against the
/// cyclic or disconnected parent pointers a corrupted namespace can produce.
/// The original checker walked unbounded; this engine refuses to spin.
pub const MAX_PARENT_WALK_DEPTH: u32 = 4096;

/// Bit flags for [`LfsckRequest::active`] / [`Bookmark::active`], identifying
/// which components are part of a scan.
pub mod component_mask {
    pub const NAMESPACE: u32 = 1 << 0;
    pub const LAYOUT: u32 = 1 << 1;
    pub const ALL: u32 = NAMESPACE | LAYOUT;
}

/// Bit flags carried in [`LfsckRequest::valid`], marking which optional
/// fields of a START request the sender actually populated.
pub mod start_valid {
    pub const SPEED_LIMIT: u32 = 1 << 0;
    pub const ERROR_HANDLE: u32 = 1 << 1;
    pub const DRYRUN: u32 = 1 << 2;
    pub const ASYNC_WINDOWS: u32 = 1 << 3;
}

/// Flags carried in [`LfsckRequest::param`] / [`StartParam::flags`].
pub mod start_flags {
    /// Request originated from a broadcast rather than a direct client call.
    pub const BROADCAST: u32 = 1 << 0;
    /// Stop only after completing the running phase, do not abort mid-scan.
    pub const ORPHAN: u32 = 1 << 1;
    pub const RESET: u32 = 1 << 2;
}
