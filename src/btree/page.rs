use std::{
    cmp::Ordering as CmpOrdering,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use bit_vec::BitVec;
use bytes::Bytes;

use crate::{
    btree::{
        insert_list::{InsertKey, InsertList},
        refs::PageRef,
        update::{TimeWindow, UpdateChain},
    },
    types::Recno,
    utils::HandyRwLock,
};

pub type PageId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Internal,
    RowLeaf,
    ColVarLeaf,
    ColFixLeaf,
}

impl PageType {
    pub fn is_leaf(&self) -> bool {
        !matches!(self, PageType::Internal)
    }
}

/// The ordered array of child refs owned by an internal page. Replaced
/// wholesale by splits; never mutated in place.
#[derive(Debug)]
pub struct ChildIndex {
    pub refs: Vec<Arc<PageRef>>,
}

impl ChildIndex {
    pub fn new(refs: Vec<Arc<PageRef>>) -> Self {
        Self { refs }
    }

    pub fn entries(&self) -> usize {
        self.refs.len()
    }

    /// Slot of the child subtree containing `key`. The first child acts
    /// as negative infinity so descent never falls off the left edge.
    pub fn search_row(&self, key: &[u8]) -> usize {
        let mut lo = 1usize;
        let mut hi = self.refs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.refs[mid].row_key().cmp(key) {
                CmpOrdering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        lo - 1
    }

    pub fn search_recno(&self, recno: Recno) -> usize {
        let mut lo = 1usize;
        let mut hi = self.refs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.refs[mid].start_recno() > recno {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo - 1
    }

    /// Position of a specific ref, verified by pointer identity. The
    /// caller usually has a hint to try first.
    pub fn slot_of(&self, child: &Arc<PageRef>, hint: usize) -> Option<usize> {
        if hint < self.refs.len() && Arc::ptr_eq(&self.refs[hint], child) {
            return Some(hint);
        }
        self.refs.iter().position(|r| Arc::ptr_eq(r, child))
    }
}

#[derive(Debug)]
pub struct InternalPage {
    index: RwLock<Arc<ChildIndex>>,
}

impl InternalPage {
    pub fn new(index: ChildIndex) -> Self {
        Self {
            index: RwLock::new(Arc::new(index)),
        }
    }

    /// Acquire-load of the current child index. Readers keep the Arc for
    /// as long as they need a consistent view.
    pub fn load_index(&self) -> Arc<ChildIndex> {
        self.index.rl().clone()
    }

    /// Publish a replacement child index, returning the retired one for
    /// deferred free. Callers must hold the page's modify lock and issue
    /// the split-generation bookkeeping.
    pub fn replace_index(&self, new_index: Arc<ChildIndex>) -> Arc<ChildIndex> {
        let mut guard = self.index.wl();
        let old = Arc::clone(&guard);
        *guard = new_index;
        old
    }
}

/// One on-page row entry: key, value and the value's time window.
#[derive(Clone, Debug)]
pub struct RowSlot {
    pub key: Vec<u8>,
    pub value: Bytes,
    pub tw: TimeWindow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowSearch {
    /// Slot of the match, or of the nearest smaller key.
    pub slot: usize,
    /// -1: sought key is before the slot, 0: exact, +1: after the slot.
    pub cmp: i8,
}

#[derive(Debug)]
pub struct RowLeafPage {
    pub slots: Vec<RowSlot>,
    /// Per-slot update chains, same length as `slots`.
    pub updates: Vec<UpdateChain>,
    /// Insert lists: `inserts[0]` holds keys smaller than any on-page
    /// key, `inserts[i + 1]` holds keys between slot i and slot i + 1.
    pub inserts: Vec<InsertList>,
}

impl RowLeafPage {
    pub fn new(slots: Vec<RowSlot>) -> Self {
        let n = slots.len();
        let mut updates = Vec::with_capacity(n);
        for _ in 0..n {
            updates.push(UpdateChain::new());
        }
        let mut inserts = Vec::with_capacity(n + 1);
        for _ in 0..=n {
            inserts.push(InsertList::new());
        }
        Self {
            slots,
            updates,
            inserts,
        }
    }

    /// Binary search the on-page keys.
    pub fn search(&self, key: &[u8]) -> RowSearch {
        if self.slots.is_empty() {
            return RowSearch { slot: 0, cmp: -1 };
        }
        let mut lo = 0usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.slots[mid].key.as_slice().cmp(key) {
                CmpOrdering::Equal => return RowSearch { slot: mid, cmp: 0 },
                CmpOrdering::Less => lo = mid + 1,
                CmpOrdering::Greater => hi = mid,
            }
        }
        if lo == 0 {
            RowSearch { slot: 0, cmp: -1 }
        } else {
            RowSearch {
                slot: lo - 1,
                cmp: 1,
            }
        }
    }

    /// The insert list where `key` belongs given a search result.
    pub fn insert_list_for(&self, search: &RowSearch) -> &InsertList {
        if search.cmp < 0 && search.slot == 0 {
            &self.inserts[0]
        } else {
            &self.inserts[search.slot + 1]
        }
    }

    pub fn last_on_page_key(&self) -> Option<&[u8]> {
        self.slots.last().map(|s| s.key.as_slice())
    }

    /// Largest key on the page, counting insert lists. Used for split
    /// key promotion.
    pub fn largest_key(&self) -> Option<Vec<u8>> {
        let mut best: Option<Vec<u8>> = self.slots.last().map(|s| s.key.clone());
        if let Some(node) = self.inserts.last().and_then(|l| l.last()) {
            let k = node.key.as_row().to_vec();
            if best.as_ref().map_or(true, |b| k > *b) {
                best = Some(k);
            }
        }
        best
    }

    pub fn entry_count(&self) -> usize {
        let mut count = self.slots.len();
        for list in &self.inserts {
            count += list.len();
        }
        count
    }

    pub fn mem_size(&self) -> usize {
        let mut size = std::mem::size_of::<RowLeafPage>();
        for s in &self.slots {
            size += s.key.len() + s.value.len() + std::mem::size_of::<RowSlot>();
        }
        for c in &self.updates {
            size += c.mem_size();
        }
        for l in &self.inserts {
            size += l.mem_size();
        }
        size
    }
}

/// One on-page variable-length column cell. `rle` > 1 means the value
/// repeats for a run of consecutive record numbers. A missing value is a
/// deleted cell.
#[derive(Clone, Debug)]
pub struct ColVarSlot {
    pub recno: Recno,
    pub rle: u64,
    pub value: Option<(Bytes, TimeWindow)>,
}

#[derive(Debug)]
pub struct ColVarLeafPage {
    pub start_recno: Recno,
    pub slots: Vec<ColVarSlot>,
    /// Updates to on-page records, keyed by recno. A visible entry here
    /// wins over the on-page cell; the cell is only consulted when no
    /// visible update exists.
    pub inserts: InsertList,
    /// Records past the on-page range.
    pub append: InsertList,
}

impl ColVarLeafPage {
    pub fn new(start_recno: Recno, slots: Vec<ColVarSlot>) -> Self {
        Self {
            start_recno,
            slots,
            inserts: InsertList::new(),
            append: InsertList::new(),
        }
    }

    /// The on-page slot covering `recno`, if any.
    pub fn slot_for(&self, recno: Recno) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let s = &self.slots[mid];
            if recno < s.recno {
                hi = mid;
            } else if recno >= s.recno + s.rle {
                lo = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// One past the last on-page record number.
    pub fn stop_recno(&self) -> Recno {
        self.slots
            .last()
            .map(|s| s.recno + s.rle)
            .unwrap_or(self.start_recno)
    }

    pub fn entry_count(&self) -> usize {
        let on_page: u64 = self.slots.iter().map(|s| s.rle).sum();
        on_page as usize + self.append.len()
    }

    pub fn mem_size(&self) -> usize {
        let mut size = std::mem::size_of::<ColVarLeafPage>();
        for s in &self.slots {
            size += std::mem::size_of::<ColVarSlot>()
                + s.value.as_ref().map_or(0, |(v, _)| v.len());
        }
        size + self.inserts.mem_size() + self.append.mem_size()
    }
}

#[derive(Debug)]
pub struct ColFixLeafPage {
    pub start_recno: Recno,
    pub bit_width: u8,
    /// On-page bit-field values, `entry_count * bit_width` bits.
    bits: RwLock<BitVec>,
    entries: usize,
    /// Updates to on-page records, keyed by recno.
    pub inserts: InsertList,
    /// Records past the on-page range.
    pub append: InsertList,
}

impl ColFixLeafPage {
    pub fn new(start_recno: Recno, bit_width: u8, values: &[u8]) -> Self {
        let mut bits = BitVec::from_elem(values.len() * bit_width as usize, false);
        for (i, v) in values.iter().enumerate() {
            Self::set_bits(&mut bits, i, bit_width, *v);
        }
        Self {
            start_recno,
            bit_width,
            bits: RwLock::new(bits),
            entries: values.len(),
            inserts: InsertList::new(),
            append: InsertList::new(),
        }
    }

    fn set_bits(bits: &mut BitVec, index: usize, width: u8, value: u8) {
        for b in 0..width as usize {
            let bit = (value >> (width as usize - 1 - b)) & 1 == 1;
            bits.set(index * width as usize + b, bit);
        }
    }

    fn get_bits(bits: &BitVec, index: usize, width: u8) -> u8 {
        let mut v = 0u8;
        for b in 0..width as usize {
            v <<= 1;
            if bits.get(index * width as usize + b).unwrap_or(false) {
                v |= 1;
            }
        }
        v
    }

    pub fn entry_total(&self) -> usize {
        self.entries
    }

    /// On-page value for `recno`; records inside the on-page range that
    /// were never written read as zero.
    pub fn on_page_value(&self, recno: Recno) -> Option<u8> {
        if recno < self.start_recno {
            return None;
        }
        let idx = (recno - self.start_recno) as usize;
        if idx >= self.entries {
            return None;
        }
        Some(Self::get_bits(&self.bits.rl(), idx, self.bit_width))
    }

    pub fn stop_recno(&self) -> Recno {
        self.start_recno + self.entries as u64
    }

    pub fn raw_values(&self) -> Vec<u8> {
        let bits = self.bits.rl();
        (0..self.entries)
            .map(|i| Self::get_bits(&bits, i, self.bit_width))
            .collect()
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<ColFixLeafPage>()
            + self.bits.rl().len() / 8
            + self.inserts.mem_size()
            + self.append.mem_size()
    }
}

#[derive(Debug)]
pub enum PagePayload {
    Internal(InternalPage),
    RowLeaf(RowLeafPage),
    ColVarLeaf(ColVarLeafPage),
    ColFixLeaf(ColFixLeafPage),
}

/// The in-memory representation of one page. The page exclusively owns
/// its slot arrays, insert lists and update chains; parent/child wiring
/// goes through refs.
#[derive(Debug)]
pub struct Page {
    pub id: PageId,
    pub btree_id: u32,
    payload: PagePayload,

    dirty: AtomicBool,
    evict_soon: AtomicBool,
    /// Some versions of this page's content live in the history store.
    hs_content: AtomicBool,
    mem_size: AtomicUsize,
    write_gen: AtomicU64,

    /// The ref currently naming this page, used to ascend the tree.
    own_ref: RwLock<Weak<crate::btree::refs::PageRef>>,

    /// Serializes split preparation, modify-structure init and overflow
    /// bookkeeping. Held only for bounded work.
    pub modify_lock: Mutex<()>,
}

impl Page {
    pub fn new(id: PageId, btree_id: u32, payload: PagePayload) -> Self {
        let page = Self {
            id,
            btree_id,
            payload,
            dirty: AtomicBool::new(false),
            evict_soon: AtomicBool::new(false),
            hs_content: AtomicBool::new(false),
            mem_size: AtomicUsize::new(0),
            write_gen: AtomicU64::new(0),
            own_ref: RwLock::new(Weak::new()),
            modify_lock: Mutex::new(()),
        };
        page.refresh_mem_size();
        page
    }

    pub fn own_ref(&self) -> Option<Arc<crate::btree::refs::PageRef>> {
        self.own_ref.rl().upgrade()
    }

    pub fn set_own_ref(&self, r: &Arc<crate::btree::refs::PageRef>) {
        *self.own_ref.wl() = Arc::downgrade(r);
    }

    pub fn page_type(&self) -> PageType {
        match &self.payload {
            PagePayload::Internal(_) => PageType::Internal,
            PagePayload::RowLeaf(_) => PageType::RowLeaf,
            PagePayload::ColVarLeaf(_) => PageType::ColVarLeaf,
            PagePayload::ColFixLeaf(_) => PageType::ColFixLeaf,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type().is_leaf()
    }

    pub fn as_internal(&self) -> &InternalPage {
        match &self.payload {
            PagePayload::Internal(p) => p,
            _ => panic!("not an internal page"),
        }
    }

    pub fn as_row_leaf(&self) -> &RowLeafPage {
        match &self.payload {
            PagePayload::RowLeaf(p) => p,
            _ => panic!("not a row-store leaf"),
        }
    }

    pub fn as_col_var_leaf(&self) -> &ColVarLeafPage {
        match &self.payload {
            PagePayload::ColVarLeaf(p) => p,
            _ => panic!("not a variable-length column-store leaf"),
        }
    }

    pub fn as_col_fix_leaf(&self) -> &ColFixLeafPage {
        match &self.payload {
            PagePayload::ColFixLeaf(p) => p,
            _ => panic!("not a fixed-length column-store leaf"),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_evict_soon(&self) {
        self.evict_soon.store(true, Ordering::Release);
    }

    pub fn set_hs_content(&self) {
        self.hs_content.store(true, Ordering::Release);
    }

    pub fn has_hs_content(&self) -> bool {
        self.hs_content.load(Ordering::Acquire)
    }

    pub fn evict_soon(&self) -> bool {
        self.evict_soon.load(Ordering::Acquire)
    }

    pub fn write_gen(&self) -> u64 {
        self.write_gen.load(Ordering::Acquire)
    }

    pub fn bump_write_gen(&self) -> u64 {
        self.write_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_write_gen(&self, gen: u64) {
        self.write_gen.store(gen, Ordering::Release);
    }

    /// Cached footprint; recomputed on demand since chains and insert
    /// lists grow behind our back.
    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Acquire)
    }

    pub fn refresh_mem_size(&self) -> usize {
        let size = match &self.payload {
            PagePayload::Internal(p) => {
                std::mem::size_of::<Page>() + p.load_index().entries() * std::mem::size_of::<usize>()
            }
            PagePayload::RowLeaf(p) => std::mem::size_of::<Page>() + p.mem_size(),
            PagePayload::ColVarLeaf(p) => std::mem::size_of::<Page>() + p.mem_size(),
            PagePayload::ColFixLeaf(p) => std::mem::size_of::<Page>() + p.mem_size(),
        };
        self.mem_size.store(size, Ordering::Release);
        size
    }

    pub fn entry_count(&self) -> usize {
        match &self.payload {
            PagePayload::Internal(p) => p.load_index().entries(),
            PagePayload::RowLeaf(p) => p.entry_count(),
            PagePayload::ColVarLeaf(p) => p.entry_count(),
            PagePayload::ColFixLeaf(p) => p.entry_total() + p.append.len(),
        }
    }
}

/// Helper building the insert-list key type for a leaf.
pub fn leaf_insert_key(page_type: PageType, row_key: &[u8], recno: Recno) -> InsertKey {
    match page_type {
        PageType::RowLeaf => InsertKey::Row(row_key.to_vec()),
        PageType::ColVarLeaf | PageType::ColFixLeaf => InsertKey::Recno(recno),
        PageType::Internal => panic!("internal pages have no insert lists"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_slot(key: &str, value: &str) -> RowSlot {
        RowSlot {
            key: key.as_bytes().to_vec(),
            value: Bytes::copy_from_slice(value.as_bytes()),
            tw: TimeWindow::default(),
        }
    }

    #[test]
    fn test_row_leaf_search() {
        let page = RowLeafPage::new(vec![
            row_slot("b", "1"),
            row_slot("d", "2"),
            row_slot("f", "3"),
        ]);

        assert_eq!(page.search(b"d"), RowSearch { slot: 1, cmp: 0 });
        assert_eq!(page.search(b"a"), RowSearch { slot: 0, cmp: -1 });
        assert_eq!(page.search(b"c"), RowSearch { slot: 0, cmp: 1 });
        assert_eq!(page.search(b"z"), RowSearch { slot: 2, cmp: 1 });
    }

    #[test]
    fn test_row_leaf_insert_list_routing() {
        let page = RowLeafPage::new(vec![row_slot("b", "1"), row_slot("d", "2")]);

        // smaller than everything: the smallest list
        let search = page.search(b"a");
        assert!(std::ptr::eq(page.insert_list_for(&search), &page.inserts[0]));

        // between b and d: slot 0's trailing list
        let search = page.search(b"c");
        assert!(std::ptr::eq(page.insert_list_for(&search), &page.inserts[1]));

        // after everything: the last list
        let search = page.search(b"z");
        assert!(std::ptr::eq(page.insert_list_for(&search), &page.inserts[2]));
    }

    #[test]
    fn test_col_var_slot_lookup() {
        let page = ColVarLeafPage::new(
            1,
            vec![
                ColVarSlot {
                    recno: 1,
                    rle: 3,
                    value: Some((Bytes::from_static(b"x"), TimeWindow::default())),
                },
                ColVarSlot {
                    recno: 4,
                    rle: 1,
                    value: Some((Bytes::from_static(b"y"), TimeWindow::default())),
                },
            ],
        );

        assert_eq!(page.slot_for(1), Some(0));
        assert_eq!(page.slot_for(3), Some(0));
        assert_eq!(page.slot_for(4), Some(1));
        assert_eq!(page.slot_for(5), None);
        assert_eq!(page.stop_recno(), 5);
    }

    #[test]
    fn test_col_fix_bit_values() {
        let page = ColFixLeafPage::new(1, 8, &[0x00, 0x07, 0xff]);
        assert_eq!(page.on_page_value(1), Some(0x00));
        assert_eq!(page.on_page_value(2), Some(0x07));
        assert_eq!(page.on_page_value(3), Some(0xff));
        assert_eq!(page.on_page_value(4), None);

        let narrow = ColFixLeafPage::new(1, 3, &[0b101, 0b010]);
        assert_eq!(narrow.on_page_value(1), Some(0b101));
        assert_eq!(narrow.on_page_value(2), Some(0b010));
        assert_eq!(narrow.raw_values(), vec![0b101, 0b010]);
    }
}
