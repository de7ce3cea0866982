//! The cursor engine: point, range and near-key operations over one
//! B-tree.
//!
//! Every entry point saves the caller-visible cursor state up front and
//! restores it on any non-success path, so a failed operation never
//! leaves the cursor half-positioned. `Restart` errors from structural
//! races are consumed here by re-searching from the saved key; they are
//! never surfaced.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::{
    btree::{
        insert_list::{InsertKey, InsertNode},
        page::{Page, PageType, RowLeafPage},
        refs::{PageRef, RefState},
        split,
        update::{
            modify_apply, modify_encode, ChainValue, ModifyOp, UpdateType,
        },
        walk::{self, WalkDirection, WalkFlags},
        BTree,
    },
    error::Error,
    stats,
    txn::{Isolation, OnPageVisibility, Transaction},
    types::{CoreResult, Recno, TreeResult},
};

/// Pinned position: the leaf the cursor last touched, held through a
/// hazard (the page Arc).
struct Pinned {
    r: Arc<PageRef>,
    page: Arc<Page>,
}

/// Where a row-store key lives on a leaf.
enum RowPos {
    Slot(usize),
    Ins(Arc<InsertNode>),
}

#[derive(Clone)]
struct SavedState {
    key: Vec<u8>,
    recno: Recno,
    value: Bytes,
    key_set: bool,
    value_set: bool,
    compare: i8,
}

pub struct Cursor {
    tree: Arc<BTree>,

    /// History store for point-in-time fallback reads; absent on the
    /// history store's own cursors.
    hs: Option<Arc<crate::history::HistoryStore>>,

    pinned: Option<Pinned>,

    /// External key state: row key bytes or a record number.
    key: Vec<u8>,
    recno: Recno,
    value: Bytes,
    key_set: bool,
    value_set: bool,

    /// Comparison result of the last search: -1, 0 or +1.
    pub compare: i8,

    /// Insert semantics: overwrite an existing key instead of failing.
    pub overwrite: bool,
    /// Column-store appends: ignore the caller's recno, allocate the
    /// next one.
    pub append: bool,
    /// Bias search-near forward, for prefix scans.
    pub prefix_search: bool,
    /// Walk policy: pass over fast-deleted subtrees without
    /// instantiating them. Only safe when their content is known to be
    /// invisible to this cursor (the truncating transaction itself).
    pub skip_deleted: bool,

    /// Key of the last position returned by next/prev.
    iter_key: Option<InsertKey>,
}

impl Cursor {
    pub fn new(tree: Arc<BTree>) -> Self {
        Self {
            tree,
            hs: None,
            pinned: None,
            key: Vec::new(),
            recno: 0,
            value: Bytes::new(),
            key_set: false,
            value_set: false,
            compare: 0,
            overwrite: false,
            append: false,
            prefix_search: false,
            skip_deleted: false,
            iter_key: None,
        }
    }

    fn walk_flags(&self) -> WalkFlags {
        WalkFlags {
            skip_deleted: self.skip_deleted,
            ..Default::default()
        }
    }

    pub fn tree(&self) -> &Arc<BTree> {
        &self.tree
    }

    pub fn set_history_store(&mut self, hs: Arc<crate::history::HistoryStore>) {
        if !self.tree.is_hs {
            self.hs = Some(hs);
        }
    }

    /// Point-in-time fallback: when nothing on the page is visible but
    /// versions of its content were spilled to the history store, the
    /// read is served from there.
    fn hs_lookup(
        &self,
        txn: &Transaction,
        page: &Page,
        key: &InsertKey,
    ) -> TreeResult<Option<Bytes>> {
        let hs = match &self.hs {
            Some(h) => h,
            None => return Ok(None),
        };
        if !page.has_hs_content() {
            return Ok(None);
        }
        let read_ts = txn.read_timestamp().unwrap_or(crate::types::TS_MAX);
        match hs.read(self.tree.id, key, read_ts)? {
            Some(version) => Ok(version.value),
            None => Ok(None),
        }
    }

    pub fn set_key(&mut self, key: &[u8]) {
        self.key = key.to_vec();
        self.key_set = true;
        self.iter_key = None;
    }

    pub fn set_recno(&mut self, recno: Recno) {
        self.recno = recno;
        self.key_set = true;
        self.iter_key = None;
    }

    pub fn set_value(&mut self, value: &[u8]) {
        self.value = Bytes::copy_from_slice(value);
        self.value_set = true;
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn recno(&self) -> Recno {
        self.recno
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Forget the position and pinned page; external key/value survive.
    pub fn reset(&mut self) {
        self.pinned = None;
        self.iter_key = None;
        self.compare = 0;
    }

    fn save(&self) -> SavedState {
        SavedState {
            key: self.key.clone(),
            recno: self.recno,
            value: self.value.clone(),
            key_set: self.key_set,
            value_set: self.value_set,
            compare: self.compare,
        }
    }

    fn restore(&mut self, saved: SavedState) {
        self.key = saved.key;
        self.recno = saved.recno;
        self.value = saved.value;
        self.key_set = saved.key_set;
        self.value_set = saved.value_set;
        self.compare = saved.compare;
    }

    fn pin(&mut self, r: Arc<PageRef>, page: Arc<Page>) {
        self.pinned = Some(Pinned { r, page });
    }

    fn require_key(&self) -> CoreResult {
        if !self.key_set {
            return Err(Error::invalid("cursor key is not set"));
        }
        Ok(())
    }

    fn require_value(&self) -> CoreResult {
        if !self.value_set {
            return Err(Error::invalid("cursor value is not set"));
        }
        Ok(())
    }

    /// Validate item sizes against the btree maximums and the block
    /// manager's accepted write size.
    fn size_check(&self, key_len: usize, value_len: usize) -> CoreResult {
        let config = &self.tree.config;
        if key_len > config.key_max {
            return Err(Error::invalid("key larger than the btree maximum"));
        }
        if value_len > config.value_max {
            return Err(Error::invalid("value larger than the btree maximum"));
        }
        let accepted = self.tree.block.write_size(config.page_size);
        if key_len + value_len > std::cmp::max(accepted, config.value_max) {
            return Err(Error::invalid("item exceeds the block manager write size"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // positioning

    /// Pinned-page fast path: reuse the leaf from the previous call when
    /// the isolation level allows it, the page is not about to be
    /// evicted, and the key lands strictly inside the page. Falls back
    /// to a root-to-leaf descent otherwise.
    fn leaf_for_row(
        &mut self,
        txn: &Transaction,
        key: &[u8],
    ) -> TreeResult<(Arc<PageRef>, Arc<Page>)> {
        if txn.isolation() == Isolation::Snapshot {
            if let Some(p) = &self.pinned {
                if p.r.state() == RefState::Mem
                    && !p.page.evict_soon()
                    && p.page.page_type() == PageType::RowLeaf
                {
                    let leaf = p.page.as_row_leaf();
                    let sr = leaf.search(key);
                    let interior = sr.cmp == 0 || (sr.cmp > 0 && sr.slot + 1 < leaf.slots.len());
                    if interior {
                        return Ok((Arc::clone(&p.r), Arc::clone(&p.page)));
                    }
                }
            }
        } else {
            // read-committed refreshes its view per operation and skips
            // the fast path entirely
            txn.refresh_snapshot();
        }
        self.tree.search_leaf_row(key)
    }

    fn leaf_for_recno(
        &mut self,
        txn: &Transaction,
        recno: Recno,
    ) -> TreeResult<(Arc<PageRef>, Arc<Page>)> {
        if txn.isolation() == Isolation::Snapshot {
            if let Some(p) = &self.pinned {
                if p.r.state() == RefState::Mem && !p.page.evict_soon() {
                    let (start, stop) = match p.page.page_type() {
                        PageType::ColVarLeaf => {
                            let l = p.page.as_col_var_leaf();
                            (l.start_recno, l.stop_recno())
                        }
                        PageType::ColFixLeaf => {
                            let l = p.page.as_col_fix_leaf();
                            (l.start_recno, l.stop_recno())
                        }
                        _ => (1, 0),
                    };
                    if recno >= start && recno < stop {
                        return Ok((Arc::clone(&p.r), Arc::clone(&p.page)));
                    }
                }
            }
        } else {
            txn.refresh_snapshot();
        }
        self.tree.search_leaf_recno(recno)
    }

    // ------------------------------------------------------------------
    // reads

    /// Resolve a row position into the value visible to the
    /// transaction, or None when nothing is visible (or a tombstone is).
    fn row_resolve(
        &self,
        txn: &Transaction,
        leaf: &RowLeafPage,
        pos: &RowPos,
    ) -> TreeResult<Option<Bytes>> {
        let cap = self.tree.config.modify_chain_max;
        match pos {
            RowPos::Ins(node) => match node.chain.read(txn, None, cap)? {
                ChainValue::Value(v) => Ok(Some(v)),
                ChainValue::Tombstone | ChainValue::None => Ok(None),
            },
            RowPos::Slot(slot) => {
                let s = &leaf.slots[*slot];
                match leaf.updates[*slot].read(txn, Some(&s.value), cap)? {
                    ChainValue::Value(v) => Ok(Some(v)),
                    ChainValue::Tombstone => Ok(None),
                    ChainValue::None => match txn.tw_visible(&s.tw) {
                        OnPageVisibility::Visible => Ok(Some(s.value.clone())),
                        _ => Ok(None),
                    },
                }
            }
        }
    }

    fn row_read(
        &self,
        txn: &Transaction,
        leaf: &RowLeafPage,
        key: &[u8],
    ) -> TreeResult<Option<Bytes>> {
        let sr = leaf.search(key);
        if let Some(node) = leaf
            .insert_list_for(&sr)
            .find(&InsertKey::Row(key.to_vec()))
        {
            return self.row_resolve(txn, leaf, &RowPos::Ins(node));
        }
        if sr.cmp == 0 {
            return self.row_resolve(txn, leaf, &RowPos::Slot(sr.slot));
        }
        Ok(None)
    }

    fn col_var_read(
        &self,
        txn: &Transaction,
        page: &Page,
        recno: Recno,
    ) -> TreeResult<Option<Bytes>> {
        let leaf = page.as_col_var_leaf();
        let cap = self.tree.config.modify_chain_max;

        let on_page = leaf.slot_for(recno).map(|i| &leaf.slots[i]);
        let base = on_page.and_then(|s| s.value.as_ref()).map(|(v, _)| v);

        // a visible insert-list update wins; the on-page cell is only
        // consulted when no visible insert update exists
        let node = leaf
            .inserts
            .find(&InsertKey::Recno(recno))
            .or_else(|| leaf.append.find(&InsertKey::Recno(recno)));
        if let Some(node) = node {
            match node.chain.read(txn, base, cap)? {
                ChainValue::Value(v) => return Ok(Some(v)),
                ChainValue::Tombstone => return Ok(None),
                ChainValue::None => {}
            }
        }

        match on_page.and_then(|s| s.value.as_ref()) {
            Some((v, tw)) => match txn.tw_visible(tw) {
                OnPageVisibility::Visible => Ok(Some(v.clone())),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Fixed-length reads never fail inside the tree's record range:
    /// records that were never written (or were removed) read as zero.
    fn col_fix_read(&self, txn: &Transaction, page: &Page, recno: Recno) -> TreeResult<u8> {
        let leaf = page.as_col_fix_leaf();
        let cap = self.tree.config.modify_chain_max;

        let base_byte = leaf.on_page_value(recno).unwrap_or(0);
        let base = Bytes::copy_from_slice(&[base_byte]);

        let node = leaf
            .inserts
            .find(&InsertKey::Recno(recno))
            .or_else(|| leaf.append.find(&InsertKey::Recno(recno)));
        if let Some(node) = node {
            match node.chain.read(txn, Some(&base), cap)? {
                ChainValue::Value(v) => return Ok(v.first().copied().unwrap_or(0)),
                ChainValue::Tombstone => return Ok(0),
                ChainValue::None => {}
            }
        }
        Ok(base_byte)
    }

    /// Point lookup. `NotFound` when no version is visible to the
    /// transaction's snapshot and read timestamp.
    pub fn search(&mut self, txn: &Transaction) -> CoreResult {
        let saved = self.save();
        let result = self.search_inner(txn);
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    fn search_inner(&mut self, txn: &Transaction) -> CoreResult {
        self.require_key()?;

        match self.tree.leaf_type {
            PageType::RowLeaf => {
                let key = self.key.clone();
                loop {
                    let (r, page) = self.leaf_for_row(txn, &key)?;
                    match self.row_read(txn, page.as_row_leaf(), &key) {
                        Ok(Some(v)) => {
                            self.value = v;
                            self.value_set = true;
                            self.compare = 0;
                            self.iter_key = Some(InsertKey::Row(key.clone()));
                            self.pin(r, page);
                            return Ok(());
                        }
                        Ok(None) => {
                            if let Some(v) =
                                self.hs_lookup(txn, &page, &InsertKey::Row(key.clone()))?
                            {
                                self.value = v;
                                self.value_set = true;
                                self.compare = 0;
                                self.iter_key = Some(InsertKey::Row(key.clone()));
                                self.pin(r, page);
                                return Ok(());
                            }
                            self.pin(r, page);
                            return Err(Error::not_found());
                        }
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                            self.pinned = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            PageType::ColVarLeaf => {
                let recno = self.recno;
                loop {
                    let (r, page) = self.leaf_for_recno(txn, recno)?;
                    match self.col_var_read(txn, &page, recno) {
                        Ok(Some(v)) => {
                            self.value = v;
                            self.value_set = true;
                            self.compare = 0;
                            self.iter_key = Some(InsertKey::Recno(recno));
                            self.pin(r, page);
                            return Ok(());
                        }
                        Ok(None) => {
                            if let Some(v) =
                                self.hs_lookup(txn, &page, &InsertKey::Recno(recno))?
                            {
                                self.value = v;
                                self.value_set = true;
                                self.compare = 0;
                                self.iter_key = Some(InsertKey::Recno(recno));
                                self.pin(r, page);
                                return Ok(());
                            }
                            self.pin(r, page);
                            return Err(Error::not_found());
                        }
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                            self.pinned = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            PageType::ColFixLeaf => {
                let recno = self.recno;
                if recno == 0 || recno > self.tree.last_recno() {
                    return Err(Error::not_found());
                }
                loop {
                    let (r, page) = self.leaf_for_recno(txn, recno)?;
                    match self.col_fix_read(txn, &page, recno) {
                        Ok(v) => {
                            self.value = Bytes::copy_from_slice(&[v]);
                            self.value_set = true;
                            self.compare = 0;
                            self.iter_key = Some(InsertKey::Recno(recno));
                            self.pin(r, page);
                            return Ok(());
                        }
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                            self.pinned = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            PageType::Internal => unreachable!(),
        }
    }

    /// Like `search` but lands on the nearest visible record when the
    /// exact key is absent. Returns the side: 0 exact, +1 the record
    /// after the key, -1 the record before.
    pub fn search_near(&mut self, txn: &Transaction) -> TreeResult<i8> {
        let saved = self.save();
        let result = self.search_near_inner(txn);
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    fn search_near_inner(&mut self, txn: &Transaction) -> TreeResult<i8> {
        self.require_key()?;

        match self.search_inner(txn) {
            Ok(()) => return Ok(0),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let bound = self.current_iter_bound();

        // advance forward, then backward, preferring the forward side
        // (prefix searches always do)
        if let Some((key, value)) = self.next_visible_after(txn, Some(&bound))? {
            self.load_position(&key, value);
            self.compare = 1;
            return Ok(1);
        }
        if self.prefix_search {
            return Err(Error::not_found());
        }
        if let Some((key, value)) = self.prev_visible_before(txn, Some(&bound))? {
            self.load_position(&key, value);
            self.compare = -1;
            return Ok(-1);
        }
        Err(Error::not_found())
    }

    fn current_iter_bound(&self) -> InsertKey {
        match self.tree.leaf_type {
            PageType::RowLeaf => InsertKey::Row(self.key.clone()),
            _ => InsertKey::Recno(self.recno),
        }
    }

    fn load_position(&mut self, key: &InsertKey, value: Bytes) {
        match key {
            InsertKey::Row(k) => {
                self.key = k.clone();
            }
            InsertKey::Recno(r) => {
                self.recno = *r;
            }
        }
        self.key_set = true;
        self.value = value;
        self.value_set = true;
        self.iter_key = Some(key.clone());
    }

    // ------------------------------------------------------------------
    // iteration

    /// Move to the next visible record in key order.
    pub fn next(&mut self, txn: &Transaction) -> CoreResult {
        let saved = self.save();
        let bound = self.iter_key.clone();
        match self.next_visible_after(txn, bound.as_ref()) {
            Ok(Some((key, value))) => {
                self.load_position(&key, value);
                self.compare = 0;
                Ok(())
            }
            Ok(None) => {
                self.restore(saved);
                Err(Error::not_found())
            }
            Err(e) => {
                self.restore(saved);
                Err(e)
            }
        }
    }

    /// Move to the previous visible record in key order.
    pub fn prev(&mut self, txn: &Transaction) -> CoreResult {
        let saved = self.save();
        let bound = self.iter_key.clone();
        match self.prev_visible_before(txn, bound.as_ref()) {
            Ok(Some((key, value))) => {
                self.load_position(&key, value);
                self.compare = 0;
                Ok(())
            }
            Ok(None) => {
                self.restore(saved);
                Err(Error::not_found())
            }
            Err(e) => {
                self.restore(saved);
                Err(e)
            }
        }
    }

    /// The workhorse of forward iteration: the smallest visible record
    /// with key strictly greater than `bound` (or the first record when
    /// unbounded). Splits mid-scan are absorbed by re-searching from
    /// the bound.
    fn next_visible_after(
        &mut self,
        txn: &Transaction,
        bound: Option<&InsertKey>,
    ) -> TreeResult<Option<(InsertKey, Bytes)>> {
        if self.tree.leaf_type == PageType::ColFixLeaf {
            return self.col_fix_next(txn, bound);
        }

        let mut bound: Option<InsertKey> = bound.cloned();
        let mut current: Option<(Arc<PageRef>, Arc<Page>)> = None;
        loop {
            // establish a leaf to scan: continue on the one we walked
            // to, or re-search from the bound
            let (r, page) = match current.take() {
                Some(c) => c,
                None => {
                    let entry = match &bound {
                        None => walk::tree_walk(
                            &self.tree,
                            None,
                            WalkDirection::Next,
                            self.walk_flags(),
                        ),
                        Some(k) => self.leaf_containing(txn, k).map(Some),
                    };
                    match entry {
                        Ok(Some(e)) => {
                            let page = e
                                .page
                                .ok_or_else(|| Error::panic("walk returned a pageless entry"))?;
                            (e.r, page)
                        }
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            match self.scan_leaf_forward(txn, &page, &bound) {
                Ok(Some(found)) => {
                    self.pin(r, page);
                    return Ok(Some(found));
                }
                Ok(None) => {
                    // leaf exhausted: everything at or below its content
                    // is behind us now
                    bound = std::cmp::max(bound.clone(), self.leaf_upper_key(&page));
                    match walk::tree_walk(
                        &self.tree,
                        Some(&r),
                        WalkDirection::Next,
                        self.walk_flags(),
                    ) {
                        Ok(Some(e)) => {
                            let page = e
                                .page
                                .ok_or_else(|| Error::panic("walk returned a pageless entry"))?;
                            current = Some((e.r, page));
                        }
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_restart() => {
                    stats::incr(&self.tree.stats.cursor_restart);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Largest key this leaf can contain, used to advance the iteration
    /// bound across empty leaves.
    fn leaf_upper_key(&self, page: &Page) -> Option<InsertKey> {
        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                leaf.largest_key().map(InsertKey::Row)
            }
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                let last = leaf
                    .append
                    .last()
                    .map(|n| n.key.as_recno())
                    .unwrap_or(0)
                    .max(leaf.stop_recno().saturating_sub(1));
                Some(InsertKey::Recno(last))
            }
            PageType::ColFixLeaf => {
                let leaf = page.as_col_fix_leaf();
                let last = leaf
                    .append
                    .last()
                    .map(|n| n.key.as_recno())
                    .unwrap_or(0)
                    .max(leaf.stop_recno().saturating_sub(1));
                Some(InsertKey::Recno(last))
            }
            PageType::Internal => None,
        }
    }

    /// Search the tree for the leaf whose range covers `key`.
    fn leaf_containing(
        &mut self,
        _txn: &Transaction,
        key: &InsertKey,
    ) -> TreeResult<walk::WalkEntry> {
        let (r, page) = match key {
            InsertKey::Row(k) => self.tree.search_leaf_row(k)?,
            InsertKey::Recno(rn) => self.tree.search_leaf_recno(*rn)?,
        };
        Ok(walk::WalkEntry {
            r,
            page: Some(page),
        })
    }

    fn scan_leaf_forward(
        &self,
        txn: &Transaction,
        page: &Page,
        bound: &Option<InsertKey>,
    ) -> TreeResult<Option<(InsertKey, Bytes)>> {
        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                let mut after: Option<Vec<u8>> = match bound {
                    Some(InsertKey::Row(k)) => Some(k.clone()),
                    _ => None,
                };
                loop {
                    match row_next_pos(leaf, after.as_deref()) {
                        Some((key, pos)) => {
                            if let Some(v) = self.row_resolve(txn, leaf, &pos)? {
                                return Ok(Some((InsertKey::Row(key), v)));
                            }
                            after = Some(key);
                        }
                        None => return Ok(None),
                    }
                }
            }
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                let mut after: Option<Recno> = match bound {
                    Some(InsertKey::Recno(r)) => Some(*r),
                    _ => None,
                };
                loop {
                    match col_var_next_recno(leaf, after) {
                        Some(recno) => {
                            if let Some(v) = self.col_var_read(txn, page, recno)? {
                                return Ok(Some((InsertKey::Recno(recno), v)));
                            }
                            after = Some(recno);
                        }
                        None => return Ok(None),
                    }
                }
            }
            _ => Err(Error::panic("row scan of a fixed-length leaf")),
        }
    }

    /// Fixed-length column stores are dense: iteration is recno + 1 up
    /// to the tree's last allocated record.
    fn col_fix_next(
        &mut self,
        txn: &Transaction,
        bound: Option<&InsertKey>,
    ) -> TreeResult<Option<(InsertKey, Bytes)>> {
        let last = self.tree.last_recno();
        let recno = match bound {
            Some(k) => k.as_recno() + 1,
            None => 1,
        };
        if recno > last {
            return Ok(None);
        }
        loop {
            let (r, page) = self.leaf_for_recno(txn, recno)?;
            match self.col_fix_read(txn, &page, recno) {
                Ok(v) => {
                    self.pin(r, page);
                    return Ok(Some((InsertKey::Recno(recno), Bytes::copy_from_slice(&[v]))));
                }
                Err(e) if e.is_restart() => {
                    stats::incr(&self.tree.stats.cursor_restart);
                    self.pinned = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn prev_visible_before(
        &mut self,
        txn: &Transaction,
        bound: Option<&InsertKey>,
    ) -> TreeResult<Option<(InsertKey, Bytes)>> {
        if self.tree.leaf_type == PageType::ColFixLeaf {
            let last = self.tree.last_recno();
            let mut recno = match bound {
                Some(k) => k.as_recno().saturating_sub(1),
                None => last,
            };
            while recno >= 1 {
                let (r, page) = self.leaf_for_recno(txn, recno)?;
                match self.col_fix_read(txn, &page, recno) {
                    Ok(v) => {
                        self.pin(r, page);
                        return Ok(Some((InsertKey::Recno(recno), Bytes::copy_from_slice(&[v]))));
                    }
                    Err(e) if e.is_restart() => {
                        stats::incr(&self.tree.stats.cursor_restart);
                        self.pinned = None;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(None);
        }

        let mut bound: Option<InsertKey> = bound.cloned();
        let mut current: Option<(Arc<PageRef>, Arc<Page>)> = None;
        loop {
            let (r, page) = match current.take() {
                Some(c) => c,
                None => {
                    let entry = match &bound {
                        None => walk::tree_walk(
                            &self.tree,
                            None,
                            WalkDirection::Prev,
                            self.walk_flags(),
                        ),
                        Some(k) => self.leaf_containing(txn, k).map(Some),
                    };
                    match entry {
                        Ok(Some(e)) => {
                            let page = e
                                .page
                                .ok_or_else(|| Error::panic("walk returned a pageless entry"))?;
                            (e.r, page)
                        }
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            match self.scan_leaf_backward(txn, &page, &bound) {
                Ok(Some(found)) => {
                    self.pin(r, page);
                    return Ok(Some(found));
                }
                Ok(None) => {
                    // leaf exhausted toward the front
                    bound = match (bound.clone(), self.leaf_lower_key(&page)) {
                        (Some(b), Some(l)) => Some(b.min(l)),
                        (b, l) => l.or(b),
                    };
                    match walk::tree_walk(
                        &self.tree,
                        Some(&r),
                        WalkDirection::Prev,
                        self.walk_flags(),
                    ) {
                        Ok(Some(e)) => {
                            let page = e
                                .page
                                .ok_or_else(|| Error::panic("walk returned a pageless entry"))?;
                            current = Some((e.r, page));
                        }
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_restart() => {
                    stats::incr(&self.tree.stats.cursor_restart);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn leaf_lower_key(&self, page: &Page) -> Option<InsertKey> {
        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                let first_slot = leaf.slots.first().map(|s| s.key.clone());
                let first_ins = leaf.inserts[0].first().map(|n| n.key.as_row().to_vec());
                match (first_ins, first_slot) {
                    (Some(a), Some(b)) => Some(InsertKey::Row(a.min(b))),
                    (a, b) => a.or(b).map(InsertKey::Row),
                }
            }
            PageType::ColVarLeaf => Some(InsertKey::Recno(page.as_col_var_leaf().start_recno)),
            PageType::ColFixLeaf => Some(InsertKey::Recno(page.as_col_fix_leaf().start_recno)),
            PageType::Internal => None,
        }
    }

    fn scan_leaf_backward(
        &self,
        txn: &Transaction,
        page: &Page,
        bound: &Option<InsertKey>,
    ) -> TreeResult<Option<(InsertKey, Bytes)>> {
        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                let mut before: Option<Vec<u8>> = match bound {
                    Some(InsertKey::Row(k)) => Some(k.clone()),
                    _ => None,
                };
                loop {
                    match row_prev_pos(leaf, before.as_deref()) {
                        Some((key, pos)) => {
                            if let Some(v) = self.row_resolve(txn, leaf, &pos)? {
                                return Ok(Some((InsertKey::Row(key), v)));
                            }
                            before = Some(key);
                        }
                        None => return Ok(None),
                    }
                }
            }
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                let mut before: Option<Recno> = match bound {
                    Some(InsertKey::Recno(r)) => Some(*r),
                    _ => None,
                };
                loop {
                    match col_var_prev_recno(leaf, before) {
                        Some(recno) => {
                            if let Some(v) = self.col_var_read(txn, page, recno)? {
                                return Ok(Some((InsertKey::Recno(recno), v)));
                            }
                            before = Some(recno);
                        }
                        None => return Ok(None),
                    }
                }
            }
            _ => Err(Error::panic("row scan of a fixed-length leaf")),
        }
    }

    // ------------------------------------------------------------------
    // writes

    /// Prepend an update for a row key, holding the page's modify lock
    /// so the prepend cannot race a split of the same page.
    fn prepend_row(
        &self,
        txn: &Transaction,
        r: &Arc<PageRef>,
        page: &Arc<Page>,
        key: &[u8],
        utype: UpdateType,
        data: Bytes,
    ) -> CoreResult {
        let _page_lock = page.modify_lock.lock().unwrap();
        if r.state() != RefState::Mem {
            return Err(Error::restart());
        }
        let leaf = page.as_row_leaf();
        let sr = leaf.search(key);
        if sr.cmp == 0 {
            leaf.updates[sr.slot].check_and_prepend(txn, utype, data)?;
        } else {
            let (node, _) = leaf
                .insert_list_for(&sr)
                .insert_or_get(InsertKey::Row(key.to_vec()));
            node.chain.check_and_prepend(txn, utype, data)?;
        }
        page.mark_dirty();
        Ok(())
    }

    fn prepend_col(
        &self,
        txn: &Transaction,
        r: &Arc<PageRef>,
        page: &Arc<Page>,
        recno: Recno,
        utype: UpdateType,
        data: Bytes,
    ) -> CoreResult {
        let _page_lock = page.modify_lock.lock().unwrap();
        if r.state() != RefState::Mem {
            return Err(Error::restart());
        }
        let list = match page.page_type() {
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                if recno >= leaf.stop_recno() {
                    &leaf.append
                } else {
                    &leaf.inserts
                }
            }
            PageType::ColFixLeaf => {
                let leaf = page.as_col_fix_leaf();
                if recno >= leaf.stop_recno() {
                    &leaf.append
                } else {
                    &leaf.inserts
                }
            }
            _ => return Err(Error::panic("column write on a row page")),
        };
        let (node, _) = list.insert_or_get(InsertKey::Recno(recno));
        node.chain.check_and_prepend(txn, utype, data)?;
        page.mark_dirty();
        Ok(())
    }

    /// Insert. Without OVERWRITE an existing visible key fails with
    /// `DuplicateKey`. Column-store APPEND allocates the next recno.
    pub fn insert(&mut self, txn: &Transaction) -> CoreResult {
        let saved = self.save();
        let result = self.insert_inner(txn);
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    fn insert_inner(&mut self, txn: &Transaction) -> CoreResult {
        self.require_key()?;
        self.require_value()?;

        match self.tree.leaf_type {
            PageType::RowLeaf => {
                let key = self.key.clone();
                let value = self.value.clone();
                self.size_check(key.len(), value.len())?;
                loop {
                    let (r, page) = self.leaf_for_row(txn, &key)?;
                    if !self.overwrite {
                        match self.row_read(txn, page.as_row_leaf(), &key) {
                            Ok(Some(_)) => {
                                self.pin(r, page);
                                return Err(Error::duplicate_key());
                            }
                            Ok(None) => {}
                            Err(e) if e.is_restart() => {
                                self.pinned = None;
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    match self.prepend_row(txn, &r, &page, &key, UpdateType::Standard, value.clone())
                    {
                        Ok(()) => {
                            self.pin(Arc::clone(&r), Arc::clone(&page));
                            self.after_write(&r, &page);
                            return Ok(());
                        }
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                            self.pinned = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            PageType::ColVarLeaf | PageType::ColFixLeaf => {
                let recno = if self.append {
                    let r = self.tree.alloc_recno();
                    self.recno = r;
                    r
                } else {
                    if self.recno == 0 {
                        return Err(Error::invalid("record numbers start at 1"));
                    }
                    self.tree.note_recno(self.recno);
                    self.recno
                };
                let value = if self.tree.leaf_type == PageType::ColFixLeaf {
                    Bytes::copy_from_slice(&[self.value.first().copied().unwrap_or(0)])
                } else {
                    self.value.clone()
                };
                self.size_check(std::mem::size_of::<Recno>(), value.len())?;
                loop {
                    let (r, page) = self.leaf_for_recno(txn, recno)?;
                    if !self.overwrite && self.tree.leaf_type == PageType::ColVarLeaf {
                        match self.col_var_read(txn, &page, recno) {
                            Ok(Some(_)) => {
                                self.pin(r, page);
                                return Err(Error::duplicate_key());
                            }
                            Ok(None) => {}
                            Err(e) if e.is_restart() => {
                                self.pinned = None;
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    match self.prepend_col(txn, &r, &page, recno, UpdateType::Standard, value.clone())
                    {
                        Ok(()) => {
                            self.pin(Arc::clone(&r), Arc::clone(&page));
                            self.after_write(&r, &page);
                            return Ok(());
                        }
                        Err(e) if e.is_restart() => {
                            stats::incr(&self.tree.stats.cursor_restart);
                            self.pinned = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            PageType::Internal => unreachable!(),
        }
    }

    /// Length of the update chain a write to this key would extend.
    fn chain_len_at(&self, page: &Page, key: &[u8], recno: Recno) -> usize {
        let head = match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                let sr = leaf.search(key);
                if sr.cmp == 0 {
                    leaf.updates[sr.slot].head()
                } else {
                    leaf.insert_list_for(&sr)
                        .find(&InsertKey::Row(key.to_vec()))
                        .and_then(|n| n.chain.head())
                }
            }
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                leaf.inserts
                    .find(&InsertKey::Recno(recno))
                    .or_else(|| leaf.append.find(&InsertKey::Recno(recno)))
                    .and_then(|n| n.chain.head())
            }
            PageType::ColFixLeaf => {
                let leaf = page.as_col_fix_leaf();
                leaf.inserts
                    .find(&InsertKey::Recno(recno))
                    .or_else(|| leaf.append.find(&InsertKey::Recno(recno)))
                    .and_then(|n| n.chain.head())
            }
            PageType::Internal => None,
        };

        let mut len = 0;
        let mut cur = head;
        while let Some(u) = cur {
            len += 1;
            if len > self.tree.config.modify_chain_max {
                break;
            }
            cur = u.next.clone();
        }
        len
    }

    /// Post-write housekeeping: trigger an insert split when the page
    /// has outgrown its thresholds. Best effort, `Busy` is fine.
    fn after_write(&mut self, r: &Arc<PageRef>, page: &Arc<Page>) {
        if self.tree.leaf_needs_insert_split(page) {
            match split::split_insert(&self.tree, r) {
                Ok(()) => {
                    // position is gone with the old ref
                    self.pinned = None;
                }
                Err(e) => {
                    debug!("insert split declined: {}", e);
                }
            }
        }
    }

    /// Update an existing record. Without OVERWRITE a missing key fails
    /// with `NotFound`.
    pub fn update(&mut self, txn: &Transaction) -> CoreResult {
        let saved = self.save();
        let result = self.write_existing(txn, UpdateType::Standard, None);
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    /// Delete a record by prepending a tombstone. With OVERWRITE the
    /// removal of an absent key succeeds (and is idempotent).
    pub fn remove(&mut self, txn: &Transaction) -> CoreResult {
        let saved = self.save();
        let result = self.write_existing(txn, UpdateType::Tombstone, None);
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    /// Establish a write intent with no value: concurrent writers fail
    /// with a conflict, readers skip it.
    pub fn reserve(&mut self, txn: &Transaction) -> CoreResult {
        let saved = self.save();
        let result = self.write_existing(txn, UpdateType::Reserve, None);
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    /// Apply a reverse delta to an existing value. The engine
    /// materializes the pre-image, validates the delta against it, and
    /// stores whichever of delta/full value is cheaper.
    pub fn modify(&mut self, txn: &Transaction, ops: &[ModifyOp]) -> CoreResult {
        if txn.isolation() != Isolation::Snapshot {
            return Err(Error::invalid(
                "modify requires a snapshot-isolation transaction",
            ));
        }
        let saved = self.save();
        let result = self.write_existing(txn, UpdateType::Modify, Some(ops));
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    fn write_existing(
        &mut self,
        txn: &Transaction,
        utype: UpdateType,
        modify_ops: Option<&[ModifyOp]>,
    ) -> CoreResult {
        self.require_key()?;
        if utype == UpdateType::Standard {
            self.require_value()?;
        }

        let is_row = self.tree.leaf_type == PageType::RowLeaf;
        let key = self.key.clone();
        let recno = self.recno;

        loop {
            let (r, page) = if is_row {
                self.leaf_for_row(txn, &key)?
            } else {
                self.leaf_for_recno(txn, recno)?
            };

            // existence check: required unless this is an overwrite
            // remove/update; fixed-length stores treat in-range records
            // as always existing
            let existing = if is_row {
                match self.row_read(txn, page.as_row_leaf(), &key) {
                    Ok(v) => v,
                    Err(e) if e.is_restart() => {
                        self.pinned = None;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else if self.tree.leaf_type == PageType::ColVarLeaf {
                match self.col_var_read(txn, &page, recno) {
                    Ok(v) => v,
                    Err(e) if e.is_restart() => {
                        self.pinned = None;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                if recno >= 1 && recno <= self.tree.last_recno() {
                    match self.col_fix_read(txn, &page, recno) {
                        Ok(v) => Some(Bytes::copy_from_slice(&[v])),
                        Err(e) if e.is_restart() => {
                            self.pinned = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    None
                }
            };

            let needs_existing =
                !(self.overwrite && matches!(utype, UpdateType::Standard | UpdateType::Tombstone));
            if existing.is_none() && needs_existing {
                self.pin(r, page);
                return Err(Error::not_found());
            }

            // build the payload
            let data = match (utype, modify_ops) {
                (UpdateType::Modify, Some(ops)) => {
                    let full = existing.clone().ok_or_else(Error::not_found)?;
                    let new_value = modify_apply(&full, ops);
                    self.size_check(key.len(), new_value.len())?;
                    let encoded = modify_encode(ops);
                    // store the delta while the chain stays short and
                    // the delta pays for itself (the fixed encoding
                    // overhead gets an allowance for small values)
                    let chain_len = self.chain_len_at(&page, &key, recno);
                    let store_delta = chain_len < self.tree.config.modify_chain_max
                        && encoded.len() < std::cmp::max(new_value.len(), 64);
                    if store_delta {
                        encoded
                    } else {
                        // fall back to a full standard value
                        let value = Bytes::from(new_value);
                        let result = if is_row {
                            self.prepend_row(txn, &r, &page, &key, UpdateType::Standard, value)
                        } else {
                            self.prepend_col(txn, &r, &page, recno, UpdateType::Standard, value)
                        };
                        match result {
                            Ok(()) => {
                                self.pin(r, page);
                                return Ok(());
                            }
                            Err(e) if e.is_restart() => {
                                stats::incr(&self.tree.stats.cursor_restart);
                                self.pinned = None;
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                (UpdateType::Standard, _) => {
                    self.size_check(key.len(), self.value.len())?;
                    self.value.clone()
                }
                _ => Bytes::new(),
            };

            let result = if is_row {
                self.prepend_row(txn, &r, &page, &key, utype, data)
            } else {
                self.prepend_col(txn, &r, &page, recno, utype, data)
            };
            match result {
                Ok(()) => {
                    self.pin(r, page);
                    return Ok(());
                }
                Err(e) if e.is_restart() => {
                    stats::incr(&self.tree.stats.cursor_restart);
                    self.pinned = None;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ----------------------------------------------------------------------
// leaf scan helpers

/// The next position on a row leaf after `after` (or the first one).
/// Regions alternate: inserts[0], slot 0, inserts[1], slot 1, ...
fn row_next_pos(leaf: &RowLeafPage, after: Option<&[u8]>) -> Option<(Vec<u8>, RowPos)> {
    let nslots = leaf.slots.len();
    let start_region = match after {
        None => 0,
        Some(k) => {
            let sr = leaf.search(k);
            if sr.cmp < 0 {
                0
            } else {
                2 * sr.slot + 1
            }
        }
    };
    for region in start_region..=(2 * nslots) {
        if region % 2 == 0 {
            let list = &leaf.inserts[region / 2];
            let cand = match after {
                None => list.first(),
                Some(k) => list.next_after(&InsertKey::Row(k.to_vec())),
            };
            if let Some(node) = cand {
                return Some((node.key.as_row().to_vec(), RowPos::Ins(node)));
            }
        } else {
            let slot = region / 2;
            let sk = &leaf.slots[slot].key;
            if after.map_or(true, |k| sk.as_slice() > k) {
                return Some((sk.clone(), RowPos::Slot(slot)));
            }
        }
    }
    None
}

/// The previous position on a row leaf before `before` (or the last
/// one).
fn row_prev_pos(leaf: &RowLeafPage, before: Option<&[u8]>) -> Option<(Vec<u8>, RowPos)> {
    let nslots = leaf.slots.len();
    let start_region = match before {
        None => 2 * nslots,
        Some(k) => {
            let sr = leaf.search(k);
            if sr.cmp < 0 {
                0
            } else if sr.cmp == 0 {
                2 * sr.slot
            } else {
                2 * (sr.slot + 1)
            }
        }
    };
    let mut region = start_region as i64;
    while region >= 0 {
        if region % 2 == 0 {
            let list = &leaf.inserts[(region / 2) as usize];
            let cand = match before {
                None => list.last(),
                Some(k) => list.prev_before(&InsertKey::Row(k.to_vec())),
            };
            if let Some(node) = cand {
                return Some((node.key.as_row().to_vec(), RowPos::Ins(node)));
            }
        } else {
            let slot = (region / 2) as usize;
            let sk = &leaf.slots[slot].key;
            if before.map_or(true, |k| sk.as_slice() < k) {
                return Some((sk.clone(), RowPos::Slot(slot)));
            }
        }
        region -= 1;
    }
    None
}

/// Smallest record number with any trace on this leaf strictly after
/// `after`.
fn col_var_next_recno(
    leaf: &crate::btree::page::ColVarLeafPage,
    after: Option<Recno>,
) -> Option<Recno> {
    let a = after.unwrap_or(0);
    let mut best: Option<Recno> = None;

    // on-page cells
    if leaf.slot_for(a + 1).is_some() {
        best = Some(a + 1);
    } else {
        for s in &leaf.slots {
            if s.recno > a {
                best = Some(best.map_or(s.recno, |b| b.min(s.recno)));
                break;
            }
        }
    }

    for list in [&leaf.inserts, &leaf.append] {
        if let Some(node) = list.next_after(&InsertKey::Recno(a)) {
            let rn = node.key.as_recno();
            best = Some(best.map_or(rn, |b| b.min(rn)));
        }
    }
    best
}

fn col_var_prev_recno(
    leaf: &crate::btree::page::ColVarLeafPage,
    before: Option<Recno>,
) -> Option<Recno> {
    let b = before.unwrap_or(Recno::MAX);
    let mut best: Option<Recno> = None;

    // on-page cells: the largest record strictly below `b`
    if b > 0 {
        if leaf.slot_for(b - 1).is_some() {
            best = Some(b - 1);
        } else {
            for s in leaf.slots.iter().rev() {
                let last = s.recno + s.rle - 1;
                if last < b {
                    best = Some(best.map_or(last, |x| x.max(last)));
                    break;
                }
            }
        }
    }

    for list in [&leaf.inserts, &leaf.append] {
        if let Some(node) = list.prev_before(&InsertKey::Recno(b)) {
            let rn = node.key.as_recno();
            best = Some(best.map_or(rn, |x| x.max(rn)));
        }
    }
    best
}

/// Mark on-disk children wholly inside [lo, hi] as fast-deleted: the
/// subtree is logically deleted without reading it, and a reader that
/// does land there later instantiates the page under tombstones.
fn fast_truncate_walk(txn: &Transaction, page: &Arc<Page>, lo: &[u8], hi: &[u8]) {
    use crate::btree::refs::FastDelete;
    use crate::types::TS_NONE;

    if page.page_type() != PageType::Internal {
        return;
    }
    let index = page.as_internal().load_index();
    for i in 0..index.entries() {
        let child = &index.refs[i];
        match child.state() {
            RefState::Disk => {
                // slot 0 has no reliable lower separator, leave it to
                // the per-key pass
                if i == 0 || i + 1 >= index.entries() {
                    continue;
                }
                let lower = child.row_key();
                let upper = index.refs[i + 1].row_key();
                if lower >= lo && upper <= hi {
                    if child.cas_state(RefState::Disk, RefState::Locked) {
                        child.set_page_del(Some(FastDelete {
                            txn_id: txn.id(),
                            ts: TS_NONE,
                            durable_ts: TS_NONE,
                        }));
                        txn.remember_fast_delete(child);
                        child.set_state(RefState::Deleted);
                    }
                }
            }
            RefState::Mem => {
                if let Ok(child_page) = child.hazard_page() {
                    if child_page.page_type() == PageType::Internal {
                        fast_truncate_walk(txn, &child_page, lo, hi);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Delete every record in [start, stop] inclusive by prepending
/// tombstones. Page splits encountered mid-iteration are absorbed and
/// the scan restarts from the last removed key. Fixed-length records
/// that are implicitly zero are left alone.
pub fn truncate(
    tree: &Arc<BTree>,
    txn: &Transaction,
    start: &mut Cursor,
    stop: &mut Cursor,
) -> CoreResult {
    match tree.leaf_type {
        PageType::RowLeaf => {
            let lo = start.key().to_vec();
            let hi = stop.key().to_vec();
            if lo > hi {
                return Err(Error::invalid("truncate range is inverted"));
            }

            // mark fully-contained on-disk subtrees deleted without
            // reading them; the leftovers get per-key tombstones below
            if let Ok(root) = tree.root().hazard_page() {
                fast_truncate_walk(txn, &root, &lo, &hi);
            }

            let mut worker = Cursor::new(Arc::clone(tree));
            worker.overwrite = true;
            // subtrees this truncate just fast-deleted hold nothing the
            // per-key pass needs; skip them instead of instantiating
            worker.skip_deleted = true;

            // delete the start key itself if present
            worker.set_key(&lo);
            match worker.search(txn) {
                Ok(()) => worker.remove(txn)?,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            let mut bound = InsertKey::Row(lo);
            loop {
                match worker.next_visible_after(txn, Some(&bound))? {
                    Some((InsertKey::Row(k), _)) => {
                        if k > hi {
                            return Ok(());
                        }
                        worker.set_key(&k);
                        worker.remove(txn)?;
                        bound = InsertKey::Row(k);
                    }
                    Some(_) => unreachable!(),
                    None => return Ok(()),
                }
            }
        }
        PageType::ColVarLeaf | PageType::ColFixLeaf => {
            let lo = start.recno().max(1);
            let hi = stop.recno();
            if lo > hi {
                return Err(Error::invalid("truncate range is inverted"));
            }
            let fixed = tree.leaf_type == PageType::ColFixLeaf;

            let mut worker = Cursor::new(Arc::clone(tree));
            worker.overwrite = true;
            for recno in lo..=hi {
                worker.set_recno(recno);
                match worker.search(txn) {
                    Ok(()) => {
                        if fixed && worker.value().first().copied().unwrap_or(0) == 0 {
                            // implicitly zero, leave it alone
                            continue;
                        }
                        worker.remove(txn)?;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        PageType::Internal => unreachable!(),
    }
}
