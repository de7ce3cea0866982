pub mod cursor;
pub mod insert_list;
pub mod page;
pub mod rec;
pub mod refs;
pub mod split;
pub mod update;
pub mod walk;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use log::debug;

use crate::{
    block::{image, image::DecodedPage, BlockManager},
    btree::{
        insert_list::InsertKey,
        page::{
            ChildIndex, ColFixLeafPage, ColVarLeafPage, InternalPage, Page, PageId, PagePayload,
            PageType, RowLeafPage,
        },
        refs::{FastDelete, PageRef, RefKey, RefState},
        update::{backoff, Update, UpdateType},
    },
    config::BtreeConfig,
    error::Error,
    session::GenerationTracker,
    stats::Stats,
    txn::{TxnGlobal, TxnState},
    types::{Recno, TreeResult, RECNO_NONE},
};

/// One B-tree: the in-memory page tree plus the services it needs. The
/// root ref always names an internal page; leaves hang off it.
pub struct BTree {
    pub id: u32,
    pub name: String,
    pub config: BtreeConfig,
    pub leaf_type: PageType,

    root: Arc<PageRef>,

    next_page_id: AtomicU64,
    last_recno: AtomicU64,
    /// Serializes record-number allocation for column-store appends.
    recno_alloc_lock: Mutex<()>,

    pub gen: Arc<GenerationTracker>,
    pub block: Arc<dyn BlockManager>,
    pub stats: Arc<Stats>,
    pub txn_global: Arc<TxnGlobal>,

    /// The history store itself; exempt from timestamp-based rollback.
    pub is_hs: bool,
}

impl BTree {
    pub fn create(
        id: u32,
        name: &str,
        leaf_type: PageType,
        config: BtreeConfig,
        block: Arc<dyn BlockManager>,
        gen: Arc<GenerationTracker>,
        stats: Arc<Stats>,
        txn_global: Arc<TxnGlobal>,
    ) -> Arc<Self> {
        assert!(leaf_type.is_leaf());

        let tree = Arc::new(Self {
            id,
            name: name.to_string(),
            config,
            leaf_type,
            root: Arc::new(PageRef::new_root(
                Self::smallest_key_for(leaf_type),
                // placeholder, replaced right below
                Arc::new(Page::new(0, id, PagePayload::Internal(InternalPage::new(ChildIndex::new(vec![]))))),
            )),
            next_page_id: AtomicU64::new(1),
            last_recno: AtomicU64::new(RECNO_NONE),
            recno_alloc_lock: Mutex::new(()),
            gen,
            block,
            stats,
            txn_global,
            is_hs: false,
        });

        // an empty tree is a root internal page over one empty leaf
        let leaf = tree.new_leaf_page();
        let leaf_ref = Arc::new(PageRef::new_mem(
            Self::smallest_key_for(leaf_type),
            Arc::clone(&leaf),
        ));
        leaf_ref.attach_page(&leaf);
        let root_page = Arc::new(Page::new(
            tree.new_page_id(),
            id,
            PagePayload::Internal(InternalPage::new(ChildIndex::new(vec![Arc::clone(
                &leaf_ref,
            )]))),
        ));
        leaf_ref.set_home(&root_page);
        leaf_ref.set_pindex_hint(0);
        tree.root.attach_page(&root_page);

        debug!("btree created, id: {}, name: {}, type: {:?}", id, name, leaf_type);
        tree
    }

    pub(crate) fn mark_history_store(self: &mut Arc<Self>) {
        Arc::get_mut(self).expect("history store marked after sharing").is_hs = true;
    }

    fn smallest_key_for(leaf_type: PageType) -> RefKey {
        match leaf_type {
            PageType::RowLeaf => RefKey::Row(Vec::new()),
            _ => RefKey::Recno(RECNO_NONE),
        }
    }

    pub fn root(&self) -> &Arc<PageRef> {
        &self.root
    }

    pub fn new_page_id(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn new_leaf_page(&self) -> Arc<Page> {
        self.new_leaf_page_starting(1)
    }

    pub fn new_leaf_page_starting(&self, start_recno: Recno) -> Arc<Page> {
        let payload = match self.leaf_type {
            PageType::RowLeaf => PagePayload::RowLeaf(RowLeafPage::new(vec![])),
            PageType::ColVarLeaf => {
                PagePayload::ColVarLeaf(ColVarLeafPage::new(start_recno, vec![]))
            }
            PageType::ColFixLeaf => PagePayload::ColFixLeaf(ColFixLeafPage::new(
                start_recno,
                self.config.fixed_bit_width,
                &[],
            )),
            PageType::Internal => unreachable!(),
        };
        Arc::new(Page::new(self.new_page_id(), self.id, payload))
    }

    /// Allocate the next record number for an APPEND insert. Serialized
    /// so concurrent appenders get distinct, dense numbers.
    pub fn alloc_recno(&self) -> Recno {
        let _guard = self.recno_alloc_lock.lock().unwrap();
        self.last_recno.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Keep the append allocator ahead of an explicitly written recno.
    pub fn note_recno(&self, recno: Recno) {
        let _guard = self.recno_alloc_lock.lock().unwrap();
        let mut cur = self.last_recno.load(Ordering::Acquire);
        while recno > cur {
            match self.last_recno.compare_exchange(
                cur,
                recno,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
    }

    pub fn last_recno(&self) -> Recno {
        self.last_recno.load(Ordering::Acquire)
    }

    /// Get the in-memory page for a ref, reading it from disk or
    /// instantiating a fast-deleted subtree as needed. Returns `Restart`
    /// when a split retired the ref or contention forced a retry.
    pub fn page_in(&self, r: &Arc<PageRef>) -> TreeResult<Arc<Page>> {
        let mut attempt = 0u32;
        loop {
            match r.state() {
                RefState::Mem => match r.hazard_page() {
                    Ok(page) => return Ok(page),
                    Err(_) => {
                        attempt += 1;
                        backoff(attempt);
                    }
                },
                RefState::Disk => {
                    if r.cas_state(RefState::Disk, RefState::Reading) {
                        match self.read_ref_page(r) {
                            Ok(page) => {
                                r.attach_page(&page);
                                r.set_state(RefState::Mem);
                            }
                            Err(e) => {
                                r.set_state(RefState::Disk);
                                return Err(e);
                            }
                        }
                    }
                }
                RefState::Reading | RefState::Locked => {
                    attempt += 1;
                    if attempt > 1000 {
                        return Err(Error::restart());
                    }
                    backoff(attempt);
                }
                RefState::Deleted => {
                    if r.cas_state(RefState::Deleted, RefState::Locked) {
                        match self.instantiate_deleted(r) {
                            Ok(page) => {
                                r.attach_page(&page);
                                r.set_state(RefState::Mem);
                            }
                            Err(e) => {
                                r.set_state(RefState::Deleted);
                                return Err(e);
                            }
                        }
                    }
                }
                RefState::Split => return Err(Error::restart()),
            }
        }
    }

    fn read_ref_page(&self, r: &Arc<PageRef>) -> TreeResult<Arc<Page>> {
        let addr = r
            .addr()
            .ok_or_else(|| Error::panic("disk ref carries no address"))?;
        let image = self.block.read(&addr.addr)?;
        let page = self.build_page_from_image(&image)?;
        debug!(
            "page read in, btree: {}, page: {}, bytes: {}",
            self.id,
            page.id,
            image.len()
        );
        Ok(page)
    }

    pub(crate) fn build_page_from_image(&self, image: &[u8]) -> TreeResult<Arc<Page>> {
        let decoded = image::decode(image)?;
        let page = match decoded {
            DecodedPage::RowLeaf { header, slots } => {
                let p = Arc::new(Page::new(
                    self.new_page_id(),
                    self.id,
                    PagePayload::RowLeaf(RowLeafPage::new(slots)),
                ));
                p.set_write_gen(header.write_gen);
                if header.flags & image::IMG_HS_UPDATE != 0 {
                    p.set_hs_content();
                }
                p
            }
            DecodedPage::ColVarLeaf {
                header,
                start_recno,
                slots,
            } => {
                let last = slots.last().map(|s| s.recno + s.rle - 1).unwrap_or(0);
                self.note_recno(last);
                let p = Arc::new(Page::new(
                    self.new_page_id(),
                    self.id,
                    PagePayload::ColVarLeaf(ColVarLeafPage::new(start_recno, slots)),
                ));
                p.set_write_gen(header.write_gen);
                if header.flags & image::IMG_HS_UPDATE != 0 {
                    p.set_hs_content();
                }
                p
            }
            DecodedPage::ColFixLeaf {
                header,
                start_recno,
                bit_width,
                values,
            } => {
                if !values.is_empty() {
                    self.note_recno(start_recno + values.len() as u64 - 1);
                }
                let p = Arc::new(Page::new(
                    self.new_page_id(),
                    self.id,
                    PagePayload::ColFixLeaf(ColFixLeafPage::new(start_recno, bit_width, &values)),
                ));
                p.set_write_gen(header.write_gen);
                p
            }
            DecodedPage::Internal { header, children } => {
                let mut refs = Vec::with_capacity(children.len());
                for child in children {
                    let r = Arc::new(PageRef::new_disk(child.key, child.addr));
                    if let Some(del) = child.fast_del {
                        r.set_page_del(Some(del));
                        r.set_state(RefState::Deleted);
                    }
                    refs.push(r);
                }
                let p = Arc::new(Page::new(
                    self.new_page_id(),
                    self.id,
                    PagePayload::Internal(InternalPage::new(ChildIndex::new(refs))),
                ));
                for (i, r) in p.as_internal().load_index().refs.iter().enumerate() {
                    r.set_home(&p);
                    r.set_pindex_hint(i);
                }
                p.set_write_gen(header.write_gen);
                p
            }
        };
        Ok(page)
    }

    /// A reader hit a fast-deleted ref: read the on-disk page and cover
    /// every key with a tombstone carrying the truncation's identity.
    fn instantiate_deleted(&self, r: &Arc<PageRef>) -> TreeResult<Arc<Page>> {
        let del = r
            .page_del()
            .ok_or_else(|| Error::panic("deleted ref carries no fast-delete record"))?;
        let page = self.read_ref_page(r)?;

        let state = self.txn_global.state_of(del.txn_id);
        let committed = matches!(state, Some(TxnState::Committed) | None);
        let aborted = matches!(state, Some(TxnState::Aborted));
        let make_tombstone = || {
            let upd = Arc::new(Update::new(
                del.txn_id,
                UpdateType::Tombstone,
                bytes::Bytes::new(),
                None,
            ));
            if committed {
                upd.commit(del.ts, del.durable_ts);
            } else if aborted {
                upd.abort();
            }
            upd
        };

        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                for chain in &leaf.updates {
                    chain.replace(Some(make_tombstone()));
                }
            }
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                for slot in &leaf.slots {
                    for i in 0..slot.rle {
                        let (node, _) = leaf
                            .inserts
                            .insert_or_get(InsertKey::Recno(slot.recno + i));
                        node.chain.replace(Some(make_tombstone()));
                    }
                }
            }
            PageType::ColFixLeaf => {
                let leaf = page.as_col_fix_leaf();
                for i in 0..leaf.entry_total() as u64 {
                    let (node, _) = leaf
                        .inserts
                        .insert_or_get(InsertKey::Recno(leaf.start_recno + i));
                    node.chain.replace(Some(make_tombstone()));
                }
            }
            PageType::Internal => {
                return Err(Error::panic("fast-delete of an internal page"));
            }
        }
        page.mark_dirty();
        debug!(
            "instantiated fast-deleted page, btree: {}, page: {}",
            self.id, page.id
        );
        Ok(page)
    }

    /// Hazard-coupled root-to-leaf descent for a row key. The returned
    /// page Arc is the caller's hazard on the leaf.
    pub fn search_leaf_row(&self, key: &[u8]) -> TreeResult<(Arc<PageRef>, Arc<Page>)> {
        let mut attempt = 0u32;
        'restart: loop {
            let _gen_guard = self.gen.enter();
            let mut cur_ref = Arc::clone(&self.root);
            let mut cur_page = match cur_ref.hazard_page() {
                Ok(p) => p,
                Err(_) => {
                    attempt += 1;
                    backoff(attempt);
                    continue 'restart;
                }
            };
            loop {
                if cur_page.is_leaf() {
                    return Ok((cur_ref, cur_page));
                }
                let index = cur_page.as_internal().load_index();
                let slot = index.search_row(key);
                let child = Arc::clone(&index.refs[slot]);
                child.set_pindex_hint(slot);
                // hazard coupling: acquiring the child then dropping our
                // clone of the parent page
                match self.page_in(&child) {
                    Ok(page) => {
                        cur_ref = child;
                        cur_page = page;
                    }
                    Err(e) if e.is_restart() => {
                        attempt += 1;
                        backoff(attempt);
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Hazard-coupled descent for a record number. Record numbers past
    /// the end of the tree land on the last leaf (the append target).
    pub fn search_leaf_recno(&self, recno: Recno) -> TreeResult<(Arc<PageRef>, Arc<Page>)> {
        let mut attempt = 0u32;
        'restart: loop {
            let _gen_guard = self.gen.enter();
            let mut cur_ref = Arc::clone(&self.root);
            let mut cur_page = match cur_ref.hazard_page() {
                Ok(p) => p,
                Err(_) => {
                    attempt += 1;
                    backoff(attempt);
                    continue 'restart;
                }
            };
            loop {
                if cur_page.is_leaf() {
                    return Ok((cur_ref, cur_page));
                }
                let index = cur_page.as_internal().load_index();
                let slot = index.search_recno(recno);
                let child = Arc::clone(&index.refs[slot]);
                child.set_pindex_hint(slot);
                match self.page_in(&child) {
                    Ok(page) => {
                        cur_ref = child;
                        cur_page = page;
                    }
                    Err(e) if e.is_restart() => {
                        attempt += 1;
                        backoff(attempt);
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Should an insert split be attempted after an insert landed on
    /// this leaf: the trailing insert list has grown large, or the page
    /// footprint blew past the split threshold.
    pub fn leaf_needs_insert_split(&self, page: &Page) -> bool {
        let trailing_len = match page.page_type() {
            PageType::RowLeaf => page
                .as_row_leaf()
                .inserts
                .last()
                .map(|l| l.len())
                .unwrap_or(0),
            PageType::ColVarLeaf => page.as_col_var_leaf().append.len(),
            PageType::ColFixLeaf => page.as_col_fix_leaf().append.len(),
            PageType::Internal => return false,
        };
        trailing_len >= self.config.split_insert_count
            || page.refresh_mem_size() > self.config.split_mem_size
    }

    /// Release in-memory structures; retired indexes are freed
    /// immediately since the caller is exclusive.
    pub fn close(&self) {
        self.gen.reap(true);
    }

    /// Validate in-memory structural invariants: child refs point home,
    /// keys are ordered, leaf content sits within its parent bounds.
    pub fn check_integrity(&self) -> TreeResult<()> {
        let root_page = self
            .root
            .hazard_page()
            .map_err(|_| Error::invalid("root page not in memory"))?;
        self.check_page(&root_page, None, None)
    }

    fn check_page(
        &self,
        page: &Arc<Page>,
        lower: Option<&RefKey>,
        upper: Option<&RefKey>,
    ) -> TreeResult<()> {
        if !matches!(page.page_type(), PageType::Internal) {
            return self.check_leaf(page, lower, upper);
        }

        let index = page.as_internal().load_index();
        let mut prev_key: Option<RefKey> = None;
        for (i, child) in index.refs.iter().enumerate() {
            if let Some(prev) = &prev_key {
                let ordered = match (prev, child.key()) {
                    (RefKey::Row(a), RefKey::Row(b)) => a < b,
                    (RefKey::Recno(a), RefKey::Recno(b)) => a <= b,
                    _ => false,
                };
                if !ordered {
                    return Err(Error::panic("parent keys out of order"));
                }
            }
            prev_key = Some(child.key().clone());

            if child.state() == RefState::Mem {
                let child_page = match child.hazard_page() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                // every in-memory child must consider this page home
                match child.home() {
                    Some(home) if Arc::ptr_eq(&home, page) => {}
                    _ => return Err(Error::panic("child ref home does not match parent")),
                }
                let next_key = index.refs.get(i + 1).map(|r| r.key().clone());
                self.check_page(
                    &child_page,
                    if i == 0 { lower } else { Some(child.key()) },
                    next_key.as_ref().or(upper),
                )?;
            }
        }
        Ok(())
    }

    fn check_leaf(
        &self,
        page: &Arc<Page>,
        lower: Option<&RefKey>,
        upper: Option<&RefKey>,
    ) -> TreeResult<()> {
        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                let mut prev: Option<Vec<u8>> = match lower {
                    Some(RefKey::Row(k)) if !k.is_empty() => Some(k.clone()),
                    _ => None,
                };
                for slot in &leaf.slots {
                    if let Some(p) = &prev {
                        if *p > slot.key {
                            return Err(Error::panic("leaf keys out of order"));
                        }
                    }
                    prev = Some(slot.key.clone());
                }
                if let (Some(RefKey::Row(up)), Some(last)) = (upper, prev) {
                    if last >= *up {
                        return Err(Error::panic("leaf key exceeds parent bound"));
                    }
                }
            }
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                let mut prev_stop = leaf.start_recno;
                for slot in &leaf.slots {
                    if slot.recno < prev_stop {
                        return Err(Error::panic("column cells overlap"));
                    }
                    prev_stop = slot.recno + slot.rle;
                }
            }
            PageType::ColFixLeaf => {}
            PageType::Internal => unreachable!(),
        }
        Ok(())
    }

    /// Debug dump of the in-memory tree shape.
    pub fn draw_tree(&self) {
        if let Ok(root) = self.root.hazard_page() {
            let mut out = String::new();
            self.draw_page(&root, 0, &mut out);
            debug!("tree {}:\n{}", self.name, out);
        }
    }

    fn draw_page(&self, page: &Arc<Page>, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match page.page_type() {
            PageType::Internal => {
                let index = page.as_internal().load_index();
                out.push_str(&format!(
                    "{}internal page {} ({} children)\n",
                    pad,
                    page.id,
                    index.entries()
                ));
                for child in &index.refs {
                    match child.state() {
                        RefState::Mem => {
                            if let Ok(p) = child.hazard_page() {
                                self.draw_page(&p, depth + 1, out);
                            }
                        }
                        state => {
                            out.push_str(&format!(
                                "{}  ref {:?} [{:?}]\n",
                                pad,
                                child.key(),
                                state
                            ));
                        }
                    }
                }
            }
            _ => {
                out.push_str(&format!(
                    "{}leaf page {} ({} entries, {} bytes)\n",
                    pad,
                    page.id,
                    page.entry_count(),
                    page.mem_size()
                ));
            }
        }
    }
}
