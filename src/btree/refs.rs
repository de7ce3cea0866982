use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc, RwLock, Weak,
};

use bytes::Bytes;

use crate::{
    btree::{page::Page, update::TimeWindow},
    error::Error,
    types::{Recno, Timestamp, TreeResult, TxnId, TS_NONE, TXN_NONE},
    utils::HandyRwLock,
};

/// Block-manager cookie naming a persisted page image. Opaque bytes with
/// a bounded length.
pub type BlockAddr = Bytes;

pub const BLOCK_ADDR_MAX: usize = 255;

/// Aggregated time window over everything a persisted page contains.
/// Carried on the ref's address so stability checks can skip reading the
/// page.
#[derive(Clone, Debug, Default)]
pub struct TimeAggregate {
    pub newest_start_durable_ts: Timestamp,
    pub newest_stop_durable_ts: Timestamp,
    pub newest_txn: TxnId,
    pub oldest_start_ts: Timestamp,
    pub newest_stop_ts: Timestamp,
    pub prepared: bool,
}

impl TimeAggregate {
    pub fn merge_tw(&mut self, tw: &TimeWindow) {
        self.newest_start_durable_ts =
            std::cmp::max(self.newest_start_durable_ts, tw.durable_start_ts);
        if tw.has_stop() {
            self.newest_stop_durable_ts =
                std::cmp::max(self.newest_stop_durable_ts, tw.durable_stop_ts);
            self.newest_stop_ts = std::cmp::max(self.newest_stop_ts, tw.stop_ts);
            self.newest_txn = std::cmp::max(self.newest_txn, tw.stop_txn);
        }
        self.newest_txn = std::cmp::max(self.newest_txn, tw.start_txn);
        if self.oldest_start_ts == TS_NONE || tw.start_ts < self.oldest_start_ts {
            self.oldest_start_ts = tw.start_ts;
        }
        self.prepared |= tw.prepare;
    }

    pub fn newest_durable_ts(&self) -> Timestamp {
        std::cmp::max(self.newest_start_durable_ts, self.newest_stop_durable_ts)
    }

    /// Nothing under this aggregate changes after `stable_ts`.
    pub fn is_stable(&self, stable_ts: Timestamp) -> bool {
        !self.prepared && self.newest_durable_ts() <= stable_ts
    }
}

#[derive(Clone, Debug)]
pub struct RefAddr {
    pub addr: BlockAddr,
    pub ta: TimeAggregate,
}

/// Record of a range truncate that logically deleted an entire subtree
/// without reading it.
#[derive(Clone, Debug)]
pub struct FastDelete {
    pub txn_id: TxnId,
    pub ts: Timestamp,
    pub durable_ts: Timestamp,
}

/// Summary of history-store content relevant to a page, produced by a
/// multi-block reconciliation that spilled versions to the history store.
#[derive(Clone, Debug)]
pub struct HsHint {
    pub hs_page_min: u64,
    pub max_txn: TxnId,
    pub max_ts: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RefState {
    /// The page image is on disk and not in memory.
    Disk = 0,
    /// Fast-truncated; the on-disk subtree is logically deleted.
    Deleted = 1,
    /// Exclusively held (eviction, instantiation).
    Locked = 2,
    /// In memory and available.
    Mem = 3,
    /// Being read from disk.
    Reading = 4,
    /// The owning internal page was replaced by a split; restart.
    Split = 5,
}

impl RefState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RefState::Disk,
            1 => RefState::Deleted,
            2 => RefState::Locked,
            3 => RefState::Mem,
            4 => RefState::Reading,
            5 => RefState::Split,
            _ => unreachable!("bad ref state"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefKey {
    Row(Vec<u8>),
    Recno(Recno),
}

/// Parent-to-child handle. The ref owns its key and fast-delete record;
/// the parent's child index owns the ref pointer; ref and page point at
/// each other through an atomic state plus a swappable page pointer, so
/// there is no ownership cycle.
pub struct PageRef {
    state: AtomicU8,
    page: RwLock<Option<Arc<Page>>>,
    /// The parent ("home") internal page. Changes when splits move the
    /// subtree. Empty for the root ref.
    home: RwLock<Weak<Page>>,
    /// Advisory slot in the parent's child index, verified on use.
    pindex_hint: AtomicUsize,
    key: RefKey,
    addr: RwLock<Option<RefAddr>>,
    page_del: RwLock<Option<FastDelete>>,
    hs_hint: RwLock<Option<HsHint>>,
    is_root: bool,
}

impl PageRef {
    pub fn new_mem(key: RefKey, page: Arc<Page>) -> Self {
        Self {
            state: AtomicU8::new(RefState::Mem as u8),
            page: RwLock::new(Some(page)),
            home: RwLock::new(Weak::new()),
            pindex_hint: AtomicUsize::new(0),
            key,
            addr: RwLock::new(None),
            page_del: RwLock::new(None),
            hs_hint: RwLock::new(None),
            is_root: false,
        }
    }

    pub fn new_root(key: RefKey, page: Arc<Page>) -> Self {
        let mut r = Self::new_mem(key, page);
        r.is_root = true;
        r
    }

    pub fn new_disk(key: RefKey, addr: RefAddr) -> Self {
        Self {
            state: AtomicU8::new(RefState::Disk as u8),
            page: RwLock::new(None),
            home: RwLock::new(Weak::new()),
            pindex_hint: AtomicUsize::new(0),
            key,
            addr: RwLock::new(Some(addr)),
            page_del: RwLock::new(None),
            hs_hint: RwLock::new(None),
            is_root: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn key(&self) -> &RefKey {
        &self.key
    }

    pub fn row_key(&self) -> &[u8] {
        match &self.key {
            RefKey::Row(k) => k,
            RefKey::Recno(_) => panic!("recno ref in a row-store context"),
        }
    }

    pub fn start_recno(&self) -> Recno {
        match &self.key {
            RefKey::Recno(r) => *r,
            RefKey::Row(_) => panic!("row ref in a column-store context"),
        }
    }

    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RefState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Compare-and-swap the state, the only legal way to take LOCKED.
    pub fn cas_state(&self, expected: RefState, new: RefState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.rl().clone()
    }

    pub fn set_page(&self, page: Option<Arc<Page>>) {
        *self.page.wl() = page;
    }

    /// Wire both directions: the ref names the page and the page knows
    /// the ref it hangs from.
    pub fn attach_page(self: &Arc<Self>, page: &Arc<Page>) {
        page.set_own_ref(self);
        *self.page.wl() = Some(Arc::clone(page));
    }

    /// Publish a hazard on the page: clone the counted reference, then
    /// re-check the state. If the state moved (eviction locked it, a
    /// split retired it) the hazard is retracted by dropping the clone
    /// and the caller restarts.
    pub fn hazard_page(&self) -> TreeResult<Arc<Page>> {
        let page = match self.page.rl().clone() {
            Some(p) => p,
            None => return Err(Error::restart()),
        };
        if self.state() != RefState::Mem {
            return Err(Error::restart());
        }
        Ok(page)
    }

    pub fn home(&self) -> Option<Arc<Page>> {
        self.home.rl().upgrade()
    }

    pub fn set_home(&self, parent: &Arc<Page>) {
        *self.home.wl() = Arc::downgrade(parent);
    }

    pub fn pindex_hint(&self) -> usize {
        self.pindex_hint.load(Ordering::Acquire)
    }

    pub fn set_pindex_hint(&self, hint: usize) {
        self.pindex_hint.store(hint, Ordering::Release);
    }

    pub fn addr(&self) -> Option<RefAddr> {
        self.addr.rl().clone()
    }

    pub fn set_addr(&self, addr: Option<RefAddr>) {
        *self.addr.wl() = addr;
    }

    pub fn page_del(&self) -> Option<FastDelete> {
        self.page_del.rl().clone()
    }

    pub fn set_page_del(&self, del: Option<FastDelete>) {
        *self.page_del.wl() = del;
    }

    pub fn hs_hint(&self) -> Option<HsHint> {
        self.hs_hint.rl().clone()
    }

    pub fn set_hs_hint(&self, hint: Option<HsHint>) {
        *self.hs_hint.wl() = hint;
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "<ref key: {:?}, state: {:?}, root: {}>",
            self.key,
            self.state(),
            self.is_root
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::{PagePayload, RowLeafPage};

    fn leaf() -> Arc<Page> {
        Arc::new(Page::new(
            1,
            1,
            PagePayload::RowLeaf(RowLeafPage::new(vec![])),
        ))
    }

    #[test]
    fn test_state_cas() {
        let r = PageRef::new_mem(RefKey::Row(vec![]), leaf());
        assert_eq!(r.state(), RefState::Mem);
        assert!(r.cas_state(RefState::Mem, RefState::Locked));
        assert!(!r.cas_state(RefState::Mem, RefState::Locked));
        r.set_state(RefState::Mem);
        assert_eq!(r.state(), RefState::Mem);
    }

    #[test]
    fn test_hazard_rechecks_state() {
        let r = PageRef::new_mem(RefKey::Row(vec![]), leaf());
        assert!(r.hazard_page().is_ok());

        r.set_state(RefState::Locked);
        assert!(r.hazard_page().unwrap_err().is_restart());
    }

    #[test]
    fn test_time_aggregate_merge() {
        let mut ta = TimeAggregate::default();
        let mut tw = TimeWindow::default();
        tw.start_ts = 10;
        tw.durable_start_ts = 10;
        tw.start_txn = 3;
        ta.merge_tw(&tw);

        tw.start_ts = 5;
        tw.durable_start_ts = 5;
        tw.stop_ts = 20;
        tw.stop_txn = 9;
        tw.durable_stop_ts = 20;
        ta.merge_tw(&tw);

        assert_eq!(ta.oldest_start_ts, 5);
        assert_eq!(ta.newest_durable_ts(), 20);
        assert_eq!(ta.newest_txn, 9);
        assert!(ta.is_stable(20));
        assert!(!ta.is_stable(15));
    }
}
