//! Target-descriptor table: a dense bitmap plus a paged pointer table,
//! kept literally as that shape (rather than flattened into a single map)
//! because `tgtnr == popcount(bitmap)` is part of the tested surface.

use std::sync::Arc;

use lfsck_proto::{LfsckError, TGT_PTRS_PER_BLOCK};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub index: u16,
    pub key: String,
    pub dead: bool,
}

impl TargetDescriptor {
    pub fn new(index: u16, key: impl Into<String>) -> Self {
        TargetDescriptor {
            index,
            key: key.into(),
            dead: false,
        }
    }
}

type Page = Box<[Option<Arc<TargetDescriptor>>; TGT_PTRS_PER_BLOCK]>;

struct TdtInner {
    bitmap: Vec<u64>,
    pages: Vec<Option<Page>>,
    tgtnr: usize,
    orphans: Vec<Arc<TargetDescriptor>>,
}

fn new_page() -> Page {
    Box::new(std::array::from_fn(|_| None))
}

impl TdtInner {
    fn new() -> Self {
        TdtInner {
            bitmap: Vec::new(),
            pages: Vec::new(),
            tgtnr: 0,
            orphans: Vec::new(),
        }
    }

    fn bit_is_set(&self, index: u16) -> bool {
        let word = index as usize / 64;
        let bit = index as usize % 64;
        self.bitmap.get(word).map(|w| w & (1 << bit) != 0).unwrap_or(false)
    }

    fn set_bit(&mut self, index: u16) {
        let word = index as usize / 64;
        let bit = index as usize % 64;
        if word >= self.bitmap.len() {
            // Grow geometrically: double until the new size covers `word`.
            let mut newsize = self.bitmap.len().max(1);
            while newsize <= word {
                newsize *= 2;
            }
            self.bitmap.resize(newsize, 0);
        }
        self.bitmap[word] |= 1 << bit;
    }

    fn clear_bit(&mut self, index: u16) {
        let word = index as usize / 64;
        let bit = index as usize % 64;
        if let Some(w) = self.bitmap.get_mut(word) {
            *w &= !(1 << bit);
        }
    }

    fn popcount(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn slot(&self, index: u16) -> Option<&Arc<TargetDescriptor>> {
        let page_idx = index as usize / TGT_PTRS_PER_BLOCK;
        let slot_idx = index as usize % TGT_PTRS_PER_BLOCK;
        self.pages.get(page_idx)?.as_ref()?[slot_idx].as_ref()
    }

    fn set_slot(&mut self, index: u16, td: Arc<TargetDescriptor>) {
        let page_idx = index as usize / TGT_PTRS_PER_BLOCK;
        let slot_idx = index as usize % TGT_PTRS_PER_BLOCK;
        if page_idx >= self.pages.len() {
            self.pages.resize_with(page_idx + 1, || None);
        }
        if self.pages[page_idx].is_none() {
            self.pages[page_idx] = Some(new_page());
        }
        self.pages[page_idx].as_mut().unwrap()[slot_idx] = Some(td);
    }

    fn clear_slot(&mut self, index: u16) {
        let page_idx = index as usize / TGT_PTRS_PER_BLOCK;
        let slot_idx = index as usize % TGT_PTRS_PER_BLOCK;
        if let Some(Some(page)) = self.pages.get_mut(page_idx) {
            page[slot_idx] = None;
        }
    }
}

/// Bitmap-indexed registry of per-target descriptors for one Instance, with
/// an orphan sublist for descriptors staged before an Instance existed.
pub struct TargetDescriptorTable {
    inner: RwLock<TdtInner>,
}

impl TargetDescriptorTable {
    pub fn new() -> Self {
        TargetDescriptorTable {
            inner: RwLock::new(TdtInner::new()),
        }
    }

    pub async fn add(&self, td: TargetDescriptor) -> Result<(), LfsckError> {
        let index = td.index;
        let mut inner = self.inner.write().await;
        if inner.bit_is_set(index) {
            return Err(LfsckError::AlreadyExists(td.key));
        }
        inner.set_bit(index);
        inner.set_slot(index, Arc::new(td));
        inner.tgtnr += 1;
        Ok(())
    }

    pub async fn remove(&self, index: u16) -> Result<Arc<TargetDescriptor>, LfsckError> {
        let mut inner = self.inner.write().await;
        let td = inner
            .slot(index)
            .cloned()
            .ok_or(LfsckError::no_such_target(index))?;
        inner.clear_slot(index);
        inner.clear_bit(index);
        inner.tgtnr -= 1;
        Ok(td)
    }

    pub async fn get(&self, index: u16) -> Option<Arc<TargetDescriptor>> {
        self.inner.read().await.slot(index).cloned()
    }

    pub async fn tgtnr(&self) -> usize {
        self.inner.read().await.tgtnr
    }

    pub async fn bit_is_set(&self, index: u16) -> bool {
        self.inner.read().await.bit_is_set(index)
    }

    /// The testable invariant of §8.1: `tgtnr == popcount(bitmap)`.
    pub async fn invariant_holds(&self) -> bool {
        let inner = self.inner.read().await;
        inner.tgtnr == inner.popcount()
    }

    pub async fn foreach_bit<F: FnMut(u16, &Arc<TargetDescriptor>)>(&self, mut f: F) {
        let inner = self.inner.read().await;
        for word in 0..inner.bitmap.len() {
            let mut bits = inner.bitmap[word];
            while bits != 0 {
                let bit = bits.trailing_zeros();
                let index = (word * 64 + bit as usize) as u16;
                if let Some(td) = inner.slot(index) {
                    f(index, td);
                }
                bits &= bits - 1;
            }
        }
    }

    pub async fn stage_orphan(&self, td: TargetDescriptor) {
        self.inner.write().await.orphans.push(Arc::new(td));
    }

    /// Drains the orphan sublist into this table, as done when an Instance
    /// is registered after earlier `add_target` calls staged descriptors.
    pub async fn drain_orphans(&self) -> Result<usize, LfsckError> {
        let orphans = {
            let mut inner = self.inner.write().await;
            std::mem::take(&mut inner.orphans)
        };
        let mut moved = 0;
        for td in orphans {
            let index = td.index;
            let mut inner = self.inner.write().await;
            if inner.bit_is_set(index) {
                return Err(LfsckError::AlreadyExists(td.key.clone()));
            }
            inner.set_bit(index);
            inner.set_slot(index, td);
            inner.tgtnr += 1;
            moved += 1;
        }
        Ok(moved)
    }

    pub async fn fini(&self) {
        let mut inner = self.inner.write().await;
        inner.orphans.clear();
        for word in 0..inner.bitmap.len() {
            inner.bitmap[word] = 0;
        }
        inner.pages.clear();
        inner.tgtnr = 0;
    }
}

impl Default for TargetDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_sets_bit_and_slot() {
        let tdt = TargetDescriptorTable::new();
        tdt.add(TargetDescriptor::new(7, "ost7")).await.unwrap();
        assert!(tdt.bit_is_set(7).await);
        assert_eq!(tdt.tgtnr().await, 1);
        assert!(tdt.invariant_holds().await);
    }

    #[tokio::test]
    async fn duplicate_add_fails() {
        let tdt = TargetDescriptorTable::new();
        tdt.add(TargetDescriptor::new(7, "ost7")).await.unwrap();
        let err = tdt.add(TargetDescriptor::new(7, "ost7")).await.unwrap_err();
        assert!(matches!(err, LfsckError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn bitmap_grows_across_word_boundary() {
        let tdt = TargetDescriptorTable::new();
        tdt.add(TargetDescriptor::new(200, "ost200")).await.unwrap();
        assert!(tdt.bit_is_set(200).await);
        assert!(tdt.invariant_holds().await);
    }

    #[tokio::test]
    async fn remove_clears_bit_and_slot() {
        let tdt = TargetDescriptorTable::new();
        tdt.add(TargetDescriptor::new(3, "ost3")).await.unwrap();
        tdt.remove(3).await.unwrap();
        assert!(!tdt.bit_is_set(3).await);
        assert_eq!(tdt.tgtnr().await, 0);
        assert!(tdt.get(3).await.is_none());
    }

    #[tokio::test]
    async fn remove_unknown_index_errors() {
        let tdt = TargetDescriptorTable::new();
        let err = tdt.remove(1).await.unwrap_err();
        assert!(matches!(err, LfsckError::NotFound(_)));
    }

    #[tokio::test]
    async fn foreach_bit_visits_every_member_once() {
        let tdt = TargetDescriptorTable::new();
        for i in [1u16, 65, 130] {
            tdt.add(TargetDescriptor::new(i, format!("ost{i}"))).await.unwrap();
        }
        let mut seen = Vec::new();
        tdt.foreach_bit(|idx, _| seen.push(idx)).await;
        seen.sort();
        assert_eq!(seen, vec![1, 65, 130]);
    }

    #[tokio::test]
    async fn orphan_reconciliation_moves_staged_descriptors() {
        let tdt = TargetDescriptorTable::new();
        tdt.stage_orphan(TargetDescriptor::new(7, "ost7")).await;
        let moved = tdt.drain_orphans().await.unwrap();
        assert_eq!(moved, 1);
        assert!(tdt.bit_is_set(7).await);
        assert_eq!(tdt.tgtnr().await, 1);
    }
}
