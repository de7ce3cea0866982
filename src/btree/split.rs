//! Page splits: insert splits, multi-block splits from reconciliation,
//! internal splits, root deepening and reverse splits.
//!
//! Every split runs through three phases with distinct error semantics:
//! RETURN before any published change (errors unwind cleanly), PANIC
//! after the first structural publication (errors are fatal, the tree
//! would be left inconsistent), IGNORE once the split stands (cleanup
//! errors are logged and suppressed).

use std::sync::Arc;

use itertools::Itertools;
use log::{debug, warn};

use crate::{
    btree::{
        insert_list::InsertKey,
        page::{ChildIndex, InternalPage, Page, PagePayload, PageType, RowLeafPage},
        refs::{HsHint, PageRef, RefAddr, RefKey, RefState},
        update::Update,
        BTree,
    },
    error::Error,
    stats,
    types::{CoreResult, TreeResult},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitPhase {
    /// Nothing published: free allocations and surface the error.
    Return,
    /// Past the publication point: errors are fatal.
    Panic,
    /// Split complete and verified: cleanup errors are suppressed.
    Ignore,
}

/// Map an error through the current split phase.
fn at_phase(phase: SplitPhase, result: CoreResult) -> CoreResult {
    match result {
        Ok(()) => Ok(()),
        Err(e) => match phase {
            SplitPhase::Return => Err(e),
            SplitPhase::Panic => Err(Error::panic(&format!(
                "split failed past its publication point: {}",
                e
            ))),
            SplitPhase::Ignore => {
                warn!("split cleanup error ignored: {}", e);
                Ok(())
            }
        },
    }
}

/// One output block of a multi-block reconciliation, to be turned into
/// a ref by `split_multi`.
pub struct MultiBlock {
    pub key: RefKey,
    /// Persisted image address, when the block was fully resolved.
    pub addr: Option<RefAddr>,
    /// History-store summary when versions were spilled.
    pub hs_hint: Option<HsHint>,
    /// Disk image for re-instantiation when unresolved updates remain.
    pub image: Option<Vec<u8>>,
    /// Updates that could not be written, re-applied to the
    /// re-instantiated page.
    pub saved_updates: Vec<(InsertKey, Arc<Update>)>,
}

/// The smallest prefix of `right_first` sorting strictly after
/// `left_largest`. Keeps internal pages small while staying correct for
/// any key saved in the left page's update lists (the caller passes the
/// largest such key).
pub fn suffix_truncate(left_largest: &[u8], right_first: &[u8]) -> Vec<u8> {
    debug_assert!(left_largest < right_first);
    for len in 1..=right_first.len() {
        if &right_first[..len] > left_largest {
            return right_first[..len].to_vec();
        }
    }
    right_first.to_vec()
}

/// Migrate the trailing insert node of a leaf to a new right sibling.
/// Cheap relief for append-heavy workloads: one node moves, the page
/// image stays put.
pub fn split_insert(tree: &BTree, r: &Arc<PageRef>) -> CoreResult {
    if r.is_root() {
        return Err(Error::busy("cannot insert-split the root"));
    }
    if !r.cas_state(RefState::Mem, RefState::Locked) {
        return Err(Error::busy("page is not idle in memory"));
    }

    // from here on, any early exit must restore the ref state
    let result = split_insert_locked(tree, r);
    match result {
        Ok(parent) => {
            // keep the parent healthy; its locks are released by now
            let _ = maybe_split_parent(tree, &parent);
            Ok(())
        }
        Err(e) => {
            if r.state() == RefState::Locked {
                r.set_state(RefState::Mem);
            }
            Err(e)
        }
    }
}

fn split_insert_locked(tree: &BTree, r: &Arc<PageRef>) -> TreeResult<Arc<Page>> {
    // errors in this stretch are phase RETURN: nothing is published yet
    let phase = SplitPhase::Return;
    let page = r.page().ok_or_else(|| Error::busy("no page in memory"))?;
    let parent = r.home().ok_or_else(|| Error::busy("ref has no parent"))?;

    let _parent_lock = parent.modify_lock.lock().unwrap();
    // the page lock keeps writers off the insert lists while the
    // trailing node migrates
    let _page_lock = page.modify_lock.lock().unwrap();

    let old_index = parent.as_internal().load_index();
    let slot = old_index
        .slot_of(r, r.pindex_hint())
        .ok_or_else(|| Error::busy("ref no longer in its parent"))?;

    // ---- phase RETURN: allocate everything off to the side ----

    // the trailing node is the tail of its list, so its forward
    // pointers are all empty: it can be the sole member of the new
    // sibling's list while still linked as the old list's tail. It is
    // unlinked from the old list only after the split publishes, so
    // searches always find it on one side or the other.
    let (moved, right_key) = match page.page_type() {
        PageType::RowLeaf => {
            let leaf = page.as_row_leaf();
            let list = leaf.inserts.last().expect("row leaf has a trailing list");
            let node = match list.last() {
                Some(n) => n,
                None => return Err(Error::busy("no trailing insert to migrate")),
            };
            // the promoted separator must sort after everything staying
            // on the left, update lists included (the migrating node
            // itself excluded)
            let mut left_largest = leaf
                .last_on_page_key()
                .map(|k| k.to_vec())
                .unwrap_or_default();
            if let Some(prev) = list.prev_before(&node.key) {
                let k = prev.key.as_row().to_vec();
                if k > left_largest {
                    left_largest = k;
                }
            }
            if left_largest.as_slice() >= node.key.as_row() {
                return Err(Error::busy("trailing insert is not the largest key"));
            }
            let key = suffix_truncate(&left_largest, node.key.as_row());
            (node, RefKey::Row(key))
        }
        PageType::ColVarLeaf => {
            let leaf = page.as_col_var_leaf();
            let node = match leaf.append.last() {
                Some(n) => n,
                None => return Err(Error::busy("no trailing append to migrate")),
            };
            let key = RefKey::Recno(node.key.as_recno());
            (node, key)
        }
        PageType::ColFixLeaf => {
            let leaf = page.as_col_fix_leaf();
            let node = match leaf.append.last() {
                Some(n) => n,
                None => return Err(Error::busy("no trailing append to migrate")),
            };
            let key = RefKey::Recno(node.key.as_recno());
            (node, key)
        }
        PageType::Internal => return Err(Error::invalid("insert split of an internal page")),
    };

    let right_page = match &right_key {
        RefKey::Row(_) => {
            let p = Arc::new(Page::new(
                tree.new_page_id(),
                tree.id,
                PagePayload::RowLeaf(RowLeafPage::new(vec![])),
            ));
            p.as_row_leaf().inserts[0].adopt(Arc::clone(&moved));
            p
        }
        RefKey::Recno(start) => {
            let p = tree.new_leaf_page_starting(*start);
            match p.page_type() {
                PageType::ColVarLeaf => p.as_col_var_leaf().append.adopt(Arc::clone(&moved)),
                PageType::ColFixLeaf => p.as_col_fix_leaf().append.adopt(Arc::clone(&moved)),
                _ => unreachable!(),
            }
            p
        }
    };
    right_page.mark_dirty();
    page.mark_dirty();

    // two new refs: the left one keeps the original page, the right one
    // carries the migrated node
    let left_ref = Arc::new(PageRef::new_mem(r.key().clone(), Arc::clone(&page)));
    left_ref.set_addr(r.addr());
    left_ref.set_hs_hint(r.hs_hint());
    let right_ref = Arc::new(PageRef::new_mem(right_key, Arc::clone(&right_page)));

    // prepare: home and hint point at the (existing) parent
    left_ref.set_home(&parent);
    right_ref.set_home(&parent);
    left_ref.set_pindex_hint(slot);
    right_ref.set_pindex_hint(slot + 1);

    let mut refs = Vec::with_capacity(old_index.entries() + 1);
    refs.extend(old_index.refs[..slot].iter().cloned());
    refs.push(Arc::clone(&left_ref));
    refs.push(Arc::clone(&right_ref));
    refs.extend(old_index.refs[slot + 1..].iter().cloned());
    let new_index = Arc::new(ChildIndex::new(refs));

    // re-wire the page to its new ref before publication so ascents
    // through the new index find a consistent home
    left_ref.attach_page(&page);
    right_ref.attach_page(&right_page);

    at_phase(phase, Ok(()))?;

    // ---- publication: atomic swap of the parent's child index ----
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    let retired = parent.as_internal().replace_index(new_index);
    let phase = SplitPhase::Panic;

    // the original ref is retired; readers holding it restart
    r.set_state(RefState::Split);

    let gen = tree.gen.next();
    at_phase(phase, Ok(()))?;

    // ---- phase IGNORE: deferred free and accounting ----
    let phase = SplitPhase::Ignore;
    tree.gen.retire(gen, retired);

    // unlink the migrated node from the old page's list; lookups have
    // been routed to the new sibling since the index swap
    let _ = at_phase(phase, {
        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                if let Some(list) = leaf.inserts.last() {
                    list.remove_last();
                }
            }
            PageType::ColVarLeaf => {
                page.as_col_var_leaf().append.remove_last();
            }
            PageType::ColFixLeaf => {
                page.as_col_fix_leaf().append.remove_last();
            }
            PageType::Internal => {}
        }
        Ok(())
    });
    let _ = at_phase(phase, {
        parent.refresh_mem_size();
        page.refresh_mem_size();
        Ok(())
    });

    stats::incr(&tree.stats.leaf_split);
    debug!(
        "insert split, btree: {}, page: {} -> new sibling {}, parent slot: {}, gen: {}",
        tree.id, page.id, right_page.id, slot, gen
    );
    Ok(Arc::clone(&parent))
}

/// Convert a multi-block reconciliation result into refs and rewire the
/// parent. Blocks with an address become DISK children, blocks with a
/// history-store summary carry the hint, blocks with unresolved updates
/// are re-instantiated in memory from their image.
pub fn split_multi(tree: &BTree, r: &Arc<PageRef>, blocks: Vec<MultiBlock>) -> CoreResult {
    // errors in this stretch are phase RETURN
    let phase = SplitPhase::Return;

    if blocks.is_empty() {
        return Err(Error::invalid("multi-block split with no blocks"));
    }
    if r.is_root() {
        return Err(Error::busy("cannot multi-block split the root"));
    }
    // the caller (eviction) holds the ref LOCKED
    if r.state() != RefState::Locked {
        return Err(Error::invalid("multi-block split requires a locked ref"));
    }

    let parent = r.home().ok_or_else(|| Error::busy("ref has no parent"))?;
    let parent_lock = parent.modify_lock.lock().unwrap();

    let old_index = parent.as_internal().load_index();
    let slot = old_index
        .slot_of(r, r.pindex_hint())
        .ok_or_else(|| Error::busy("ref no longer in its parent"))?;

    // ---- phase RETURN: build the replacement refs ----
    let mut new_refs = Vec::with_capacity(blocks.len());
    for (i, block) in blocks.into_iter().enumerate() {
        // the first block inherits the replaced ref's boundary key so
        // the subtree's key range is preserved exactly
        let key = if i == 0 {
            r.key().clone()
        } else {
            block.key.clone()
        };
        let new_ref = match (&block.addr, &block.image) {
            (Some(addr), _) => {
                let nr = Arc::new(PageRef::new_disk(key, addr.clone()));
                if block.hs_hint.is_some() {
                    nr.set_hs_hint(block.hs_hint.clone());
                }
                nr
            }
            (None, Some(image)) => {
                // unresolved updates remain: bring the block back into
                // memory and re-apply them
                let page = tree.build_page_from_image(image)?;
                reapply_saved_updates(&page, &block.saved_updates)?;
                page.mark_dirty();
                let nr = Arc::new(PageRef::new_mem(key, Arc::clone(&page)));
                nr.attach_page(&page);
                nr
            }
            (None, None) => {
                return Err(Error::invalid("multi-block entry with neither address nor image"))
            }
        };
        new_ref.set_home(&parent);
        new_refs.push(new_ref);
    }

    let mut refs = Vec::with_capacity(old_index.entries() + new_refs.len() - 1);
    refs.extend(old_index.refs[..slot].iter().cloned());
    refs.extend(new_refs.iter().cloned());
    refs.extend(old_index.refs[slot + 1..].iter().cloned());
    for (i, nr) in refs.iter().enumerate() {
        nr.set_pindex_hint(i);
    }
    let new_index = Arc::new(ChildIndex::new(refs));

    at_phase(phase, Ok(()))?;

    // ---- publication ----
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    let retired = parent.as_internal().replace_index(new_index);
    let phase = SplitPhase::Panic;

    r.set_state(RefState::Split);
    let gen = tree.gen.next();
    at_phase(phase, Ok(()))?;

    let phase = SplitPhase::Ignore;
    tree.gen.retire(gen, retired);

    // the replaced page's old address is no longer reachable
    if let Some(old_addr) = r.addr() {
        let _ = at_phase(phase, tree.block.free(&old_addr.addr));
    }
    let _ = at_phase(phase, {
        parent.refresh_mem_size();
        Ok(())
    });

    stats::incr(&tree.stats.leaf_split);
    debug!(
        "multi-block split, btree: {}, parent slot: {}, gen: {}",
        tree.id, slot, gen
    );

    drop(parent_lock);
    let _ = maybe_split_parent(tree, &parent);
    Ok(())
}

pub(crate) fn reapply_saved_updates(
    page: &Arc<Page>,
    saved: &[(InsertKey, Arc<Update>)],
) -> CoreResult {
    for (key, head) in saved {
        match page.page_type() {
            PageType::RowLeaf => {
                let leaf = page.as_row_leaf();
                let search = leaf.search(key.as_row());
                if search.cmp == 0 {
                    leaf.updates[search.slot].replace(Some(Arc::clone(head)));
                } else {
                    let (node, _) = leaf
                        .insert_list_for(&search)
                        .insert_or_get(key.clone());
                    node.chain.replace(Some(Arc::clone(head)));
                }
            }
            PageType::ColVarLeaf => {
                let leaf = page.as_col_var_leaf();
                let recno = key.as_recno();
                let list = if recno >= leaf.stop_recno() {
                    &leaf.append
                } else {
                    &leaf.inserts
                };
                let (node, _) = list.insert_or_get(key.clone());
                node.chain.replace(Some(Arc::clone(head)));
            }
            PageType::ColFixLeaf => {
                let leaf = page.as_col_fix_leaf();
                let recno = key.as_recno();
                let list = if recno >= leaf.stop_recno() {
                    &leaf.append
                } else {
                    &leaf.inserts
                };
                let (node, _) = list.insert_or_get(key.clone());
                node.chain.replace(Some(Arc::clone(head)));
            }
            PageType::Internal => {
                return Err(Error::panic("saved updates on an internal page"))
            }
        }
    }
    Ok(())
}

/// Split an over-full internal page in half, or deepen the tree when the
/// over-full page is the root.
pub fn split_internal(tree: &BTree, page: &Arc<Page>) -> CoreResult {
    let r = page
        .own_ref()
        .ok_or_else(|| Error::busy("internal page has no ref"))?;
    if r.is_root() {
        return root_deepen(tree, &r, page);
    }

    if !r.cas_state(RefState::Mem, RefState::Locked) {
        return Err(Error::busy("internal page is not idle"));
    }
    match split_internal_locked(tree, &r, page) {
        Ok(parent) => {
            let _ = maybe_split_parent(tree, &parent);
            Ok(())
        }
        Err(e) => {
            if r.state() == RefState::Locked {
                r.set_state(RefState::Mem);
            }
            Err(e)
        }
    }
}

fn split_internal_locked(tree: &BTree, r: &Arc<PageRef>, page: &Arc<Page>) -> TreeResult<Arc<Page>> {
    let parent = r.home().ok_or_else(|| Error::busy("ref has no parent"))?;
    let _parent_lock = parent.modify_lock.lock().unwrap();
    let _page_lock = page.modify_lock.lock().unwrap();

    let grand_index = parent.as_internal().load_index();
    let slot = grand_index
        .slot_of(r, r.pindex_hint())
        .ok_or_else(|| Error::busy("ref no longer in its parent"))?;

    let old_index = page.as_internal().load_index();
    let n = old_index.entries();
    if n < 2 {
        return Err(Error::busy("nothing to split"));
    }
    let half = n / 2;

    // ---- phase RETURN ----
    let left_children: Vec<_> = old_index.refs[..half].to_vec();
    let right_children: Vec<_> = old_index.refs[half..].to_vec();
    let right_key = right_children[0].key().clone();

    let left_page = Arc::new(Page::new(
        tree.new_page_id(),
        tree.id,
        PagePayload::Internal(InternalPage::new(ChildIndex::new(left_children.clone()))),
    ));
    let right_page = Arc::new(Page::new(
        tree.new_page_id(),
        tree.id,
        PagePayload::Internal(InternalPage::new(ChildIndex::new(right_children.clone()))),
    ));

    let left_ref = Arc::new(PageRef::new_mem(r.key().clone(), Arc::clone(&left_page)));
    let right_ref = Arc::new(PageRef::new_mem(right_key, Arc::clone(&right_page)));
    left_ref.set_home(&parent);
    right_ref.set_home(&parent);
    left_ref.set_pindex_hint(slot);
    right_ref.set_pindex_hint(slot + 1);
    left_ref.attach_page(&left_page);
    right_ref.attach_page(&right_page);

    // prepare the moved children: each ref is carried by pointer, only
    // its home and hint change
    for (i, child) in left_children.iter().enumerate() {
        child.set_home(&left_page);
        child.set_pindex_hint(i);
    }
    for (i, child) in right_children.iter().enumerate() {
        child.set_home(&right_page);
        child.set_pindex_hint(i);
    }

    let mut refs = Vec::with_capacity(grand_index.entries() + 1);
    refs.extend(grand_index.refs[..slot].iter().cloned());
    refs.push(Arc::clone(&left_ref));
    refs.push(Arc::clone(&right_ref));
    refs.extend(grand_index.refs[slot + 1..].iter().cloned());
    let new_grand_index = Arc::new(ChildIndex::new(refs));

    // ---- publication ----
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    let retired = parent.as_internal().replace_index(new_grand_index);
    r.set_state(RefState::Split);
    let gen = tree.gen.next();

    // ---- phase IGNORE ----
    let phase = SplitPhase::Ignore;
    tree.gen.retire(gen, retired);
    // the split page's own index is retired with it
    tree.gen.retire(gen, old_index);
    let _ = at_phase(phase, {
        parent.refresh_mem_size();
        left_page.refresh_mem_size();
        right_page.refresh_mem_size();
        Ok(())
    });

    stats::incr(&tree.stats.internal_split);
    debug!(
        "internal split, btree: {}, page: {} -> {} + {}, gen: {}",
        tree.id, page.id, left_page.id, right_page.id, gen
    );
    Ok(Arc::clone(&parent))
}

/// The root's child count blew past its threshold: replace the root page
/// with a new root whose children carry slices of the original index.
fn root_deepen(tree: &BTree, root_ref: &Arc<PageRef>, root_page: &Arc<Page>) -> CoreResult {
    let _root_lock = root_page.modify_lock.lock().unwrap();

    let old_index = root_page.as_internal().load_index();
    let n = old_index.entries();
    let per_child = tree.config.internal_max_entries.max(2);
    if n <= per_child {
        return Ok(());
    }

    // ---- phase RETURN: build the new level ----
    let mut child_refs: Vec<Arc<PageRef>> = Vec::new();
    for chunk in &old_index.refs.iter().cloned().chunks(per_child) {
        let slice: Vec<Arc<PageRef>> = chunk.collect();
        let key = slice[0].key().clone();
        let page = Arc::new(Page::new(
            tree.new_page_id(),
            tree.id,
            PagePayload::Internal(InternalPage::new(ChildIndex::new(slice.clone()))),
        ));
        let r = Arc::new(PageRef::new_mem(key, Arc::clone(&page)));
        r.attach_page(&page);
        for (i, moved) in slice.iter().enumerate() {
            moved.set_home(&page);
            moved.set_pindex_hint(i);
        }
        child_refs.push(r);
    }

    let new_root_page = Arc::new(Page::new(
        tree.new_page_id(),
        tree.id,
        PagePayload::Internal(InternalPage::new(ChildIndex::new(child_refs.clone()))),
    ));
    for (i, r) in child_refs.iter().enumerate() {
        r.set_home(&new_root_page);
        r.set_pindex_hint(i);
    }

    // ---- publication: swap the root ref's page ----
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    root_ref.attach_page(&new_root_page);
    let gen = tree.gen.next();

    // ---- phase IGNORE ----
    tree.gen.retire(gen, old_index);
    new_root_page.refresh_mem_size();

    stats::incr(&tree.stats.root_deepen);
    debug!(
        "root deepen, btree: {}, {} children -> {} subtrees, gen: {}",
        tree.id,
        n,
        child_refs.len(),
        gen
    );
    Ok(())
}

/// Split the parent if a just-published split pushed it past its
/// thresholds.
pub fn maybe_split_parent(tree: &BTree, parent: &Arc<Page>) -> CoreResult {
    let entries = parent.as_internal().load_index().entries();
    let is_root = parent
        .own_ref()
        .map(|r| r.is_root())
        .unwrap_or(false);

    if is_root {
        if entries > tree.config.internal_max_entries * tree.config.deepen_ratio {
            if let Some(r) = parent.own_ref() {
                return root_deepen(tree, &r, parent);
            }
        }
        return Ok(());
    }

    if entries > tree.config.internal_max_entries {
        return split_internal(tree, parent);
    }
    Ok(())
}

/// A subtree emptied out: remove its entry from the parent. Never
/// leaves an empty internal page behind: the root reports `Busy`, other
/// parents that would empty are flagged for urgent eviction instead.
pub fn reverse_split(tree: &BTree, r: &Arc<PageRef>) -> CoreResult {
    if r.is_root() {
        return Err(Error::busy("cannot reverse-split the root"));
    }
    let parent = r.home().ok_or_else(|| Error::busy("ref has no parent"))?;
    let _parent_lock = parent.modify_lock.lock().unwrap();

    let old_index = parent.as_internal().load_index();
    let slot = match old_index.slot_of(r, r.pindex_hint()) {
        Some(s) => s,
        None => return Ok(()), // already gone
    };

    if old_index.entries() == 1 {
        let parent_is_root = parent
            .own_ref()
            .map(|pr| pr.is_root())
            .unwrap_or(false);
        if parent_is_root {
            return Err(Error::busy("reverse split would empty the root"));
        }
        parent.set_evict_soon();
        return Err(Error::busy("reverse split would empty the parent"));
    }

    let mut refs = Vec::with_capacity(old_index.entries() - 1);
    refs.extend(old_index.refs[..slot].iter().cloned());
    refs.extend(old_index.refs[slot + 1..].iter().cloned());
    for (i, kept) in refs.iter().enumerate() {
        kept.set_pindex_hint(i);
    }
    let new_index = Arc::new(ChildIndex::new(refs));

    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    let retired = parent.as_internal().replace_index(new_index);
    r.set_state(RefState::Split);
    let gen = tree.gen.next();

    tree.gen.retire(gen, retired);
    parent.refresh_mem_size();

    stats::incr(&tree.stats.reverse_split);
    debug!(
        "reverse split, btree: {}, removed slot {} from page {}, gen: {}",
        tree.id, slot, parent.id, gen
    );
    Ok(())
}
