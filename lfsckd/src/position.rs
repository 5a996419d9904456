//! Resumable scan cursors: the `(oit_cookie, dir_parent_fid, dir_cookie)`
//! position tuple plus the two iterator flavors (object-index table, and
//! directory entries) that produce and consume it.

use async_trait::async_trait;

use crate::fid::Fid;

/// `END_OFF` sentinel: a `dir_cookie` at or past this value collapses to
/// "no directory position" on `fill`.
pub const END_OFF: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub oit_cookie: u64,
    pub dir_parent_fid: Fid,
    pub dir_cookie: u64,
}

impl Position {
    pub fn is_unstarted(&self) -> bool {
        self.oit_cookie == 0 && self.dir_parent_fid.is_zero()
    }

    pub fn is_in_directory(&self) -> bool {
        !self.dir_parent_fid.is_zero()
    }
}

/// Outcome of loading a persisted cookie into an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Found,
    PastEnd,
}

/// A resumable cursor, modeling the OIT and directory iterators uniformly:
/// `init/load/next/store/put/fini` plus the "past end" convention of a
/// positive return code, here a dedicated `LoadOutcome` variant instead.
#[async_trait]
pub trait ScanCursor: Send + Sync {
    async fn load(&mut self, cookie: u64) -> Result<LoadOutcome, lfsck_proto::LfsckError>;
    async fn next(&mut self) -> Option<Fid>;
    fn store(&self) -> u64;
}

/// Whole-volume cursor over every object on a target.
pub struct OitCursor {
    cookie: u64,
    over: bool,
    objects: Vec<Fid>,
}

impl OitCursor {
    pub fn new(objects: Vec<Fid>) -> Self {
        OitCursor { cookie: 0, over: false, objects }
    }

    pub fn is_over(&self) -> bool {
        self.over
    }

    pub fn current(&self) -> Option<Fid> {
        self.objects.get(self.cookie as usize).copied()
    }
}

#[async_trait]
impl ScanCursor for OitCursor {
    async fn load(&mut self, cookie: u64) -> Result<LoadOutcome, lfsck_proto::LfsckError> {
        if cookie as usize >= self.objects.len() {
            self.over = true;
            self.cookie = cookie;
            return Ok(LoadOutcome::PastEnd);
        }
        self.cookie = cookie;
        self.over = false;
        Ok(LoadOutcome::Found)
    }

    async fn next(&mut self) -> Option<Fid> {
        let item = self.objects.get(self.cookie as usize).copied();
        if item.is_some() {
            self.cookie += 1;
        } else {
            self.over = true;
        }
        item
    }

    fn store(&self) -> u64 {
        self.cookie
    }
}

/// Cursor over the entries of a single directory.
pub struct DirCursor {
    parent: Fid,
    cookie: u64,
    entries: Vec<(String, Fid)>,
}

impl DirCursor {
    pub fn new(parent: Fid, entries: Vec<(String, Fid)>) -> Self {
        DirCursor { parent, cookie: 0, entries }
    }

    pub fn parent(&self) -> Fid {
        self.parent
    }
}

#[async_trait]
impl ScanCursor for DirCursor {
    async fn load(&mut self, cookie: u64) -> Result<LoadOutcome, lfsck_proto::LfsckError> {
        if cookie >= END_OFF || cookie as usize >= self.entries.len() {
            self.cookie = self.entries.len() as u64;
            return Ok(LoadOutcome::PastEnd);
        }
        self.cookie = cookie;
        Ok(LoadOutcome::Found)
    }

    async fn next(&mut self) -> Option<Fid> {
        let item = self.entries.get(self.cookie as usize).map(|(_, fid)| *fid);
        if item.is_some() {
            self.cookie += 1;
        }
        item
    }

    fn store(&self) -> u64 {
        self.cookie
    }
}

/// Snapshots the current position from the active iterators. `init` marks a
/// fresh `prep` call (no rewind); a restart after an interrupted run
/// decrements `oit_cookie` by one so that object is reprocessed.
pub fn fill(oit: &OitCursor, dir: Option<&DirCursor>, init: bool, oit_processed: bool) -> Position {
    let mut oit_cookie = oit.store();
    if !init && !oit_processed && oit_cookie > 0 {
        oit_cookie -= 1;
    }
    match dir {
        Some(d) if d.store() < END_OFF => Position {
            oit_cookie,
            dir_parent_fid: d.parent(),
            dir_cookie: d.store(),
        },
        _ => Position {
            oit_cookie,
            dir_parent_fid: Fid::ZERO,
            dir_cookie: 0,
        },
    }
}
