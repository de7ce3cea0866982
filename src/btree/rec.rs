//! Leaf reconciliation: turn an in-memory page back into disk images,
//! spilling older versions to the history store, and drive eviction.
//!
//! Reconciliation chooses one base value per key (the newest committed
//! update), packages older-but-still-readable versions into history
//! store entries, and emits either a single block or a multi-block
//! result for the split engine. Uncommitted updates cannot be written;
//! they are carried as saved updates that force the page to be
//! re-instantiated in memory.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::{
    block::image,
    btree::{
        insert_list::InsertKey,
        page::{ColVarSlot, Page, PageType, RowSlot},
        refs::{PageRef, RefAddr, RefState, TimeAggregate},
        split::{self, MultiBlock},
        update::{
            ChainValue, PrepareState, TimeWindow, Update, UpdateChain, UpdateType, UPD_HS_SPILLED,
        },
        BTree,
    },
    error::Error,
    history::{HistoryStore, HsRecord, HsType},
    stats,
    types::{CoreResult, Timestamp, TreeResult, TS_NONE},
};

pub enum RecOutcome {
    /// The page holds nothing live at all.
    Empty,
    Single {
        image: Vec<u8>,
        /// Unwritable (uncommitted/prepared) chains, keyed.
        saved: Vec<(InsertKey, Arc<Update>)>,
        hs_spilled: bool,
        ta: TimeAggregate,
    },
    Multi(Vec<MultiBlock>),
}

/// One key's fate during reconciliation.
struct KeyRec {
    key: InsertKey,
    /// Slot emitted into the image, None when the key is (visibly)
    /// deleted.
    slot_value: Option<(Bytes, TimeWindow)>,
    saved: Option<Arc<Update>>,
}

/// Versions of one key ordered oldest-first, ready for the history
/// store.
struct Spill {
    start_ts: Timestamp,
    start_txn: crate::types::TxnId,
    durable_ts: Timestamp,
    hs_type: HsType,
    payload: Bytes,
}

fn chain_updates(chain: &UpdateChain) -> Vec<Arc<Update>> {
    let mut out = Vec::new();
    let mut cur = chain.head();
    while let Some(u) = cur {
        cur = u.next.clone();
        out.push(u);
    }
    out
}

/// Analyze one key's update chain against its on-page base value.
fn rec_key(
    tree: &BTree,
    hs: Option<&HistoryStore>,
    key: InsertKey,
    chain: &UpdateChain,
    base: Option<(Bytes, TimeWindow)>,
    pinned_ts: Timestamp,
) -> TreeResult<(KeyRec, bool)> {
    let updates = chain_updates(chain);

    let mut saved: Option<Arc<Update>> = None;
    let mut chosen: Option<Arc<Update>> = None;
    let mut older: Vec<Arc<Update>> = Vec::new();

    for u in &updates {
        if u.is_aborted()
            || u.utype == UpdateType::Reserve
            || u.utype == UpdateType::Birthmark
        {
            continue;
        }
        let unresolved =
            !u.is_committed() || u.prepare_state() == PrepareState::InProgress;
        if unresolved {
            if saved.is_none() {
                saved = Some(updates[0].clone());
            }
            continue;
        }
        if chosen.is_none() {
            chosen = Some(u.clone());
        } else {
            older.push(u.clone());
        }
    }

    // resolve the chosen update into the block value
    let cap = tree.config.modify_chain_max;
    let base_value = base.as_ref().map(|(v, _)| v);
    let slot_value: Option<(Bytes, TimeWindow)> = match &chosen {
        Some(u) => match chain.materialize(u, base_value, cap)? {
            ChainValue::Value(v) => {
                let tw = TimeWindow {
                    start_ts: u.start_ts(),
                    start_txn: u.txn_id,
                    durable_start_ts: u.durable_ts(),
                    ..Default::default()
                };
                Some((v, tw))
            }
            ChainValue::Tombstone => None,
            ChainValue::None => None,
        },
        None => base.clone(),
    };

    // a non-timestamped chosen value invalidates the key's history
    let mut hs_spilled = false;
    if let (Some(u), Some(hs)) = (&chosen, hs) {
        if u.start_ts() == TS_NONE && !tree.is_hs {
            hs.delete_key(tree.id, &key)?;
        } else if !tree.is_hs {
            // spill the on-page base and the older committed versions,
            // oldest first, so counters preserve chronology
            let mut spills: Vec<Spill> = Vec::new();

            if let Some((v, tw)) = &base {
                // only a base value older than the chosen update is
                // history; a newer one was rolled back and must not be
                // resurrected
                if (tw.start_ts != TS_NONE || tw.start_txn != 0)
                    && tw.start_ts < u.start_ts()
                {
                    spills.push(Spill {
                        start_ts: tw.start_ts,
                        start_txn: tw.start_txn,
                        durable_ts: tw.durable_start_ts,
                        hs_type: HsType::Standard,
                        payload: v.clone(),
                    });
                }
            }
            for v in older.iter().rev() {
                // already written out by an earlier reconciliation
                if v.has_flag(UPD_HS_SPILLED) {
                    continue;
                }
                let (hs_type, payload) = match v.utype {
                    UpdateType::Standard => (HsType::Standard, v.data.clone()),
                    UpdateType::Modify => (HsType::Modify, v.data.clone()),
                    UpdateType::Tombstone => (HsType::Tombstone, Bytes::new()),
                    _ => continue,
                };
                spills.push(Spill {
                    start_ts: v.start_ts(),
                    start_txn: v.txn_id,
                    durable_ts: v.durable_ts(),
                    hs_type,
                    payload,
                });
            }

            // stop of each version is the start of the next one; the
            // newest spilled version stops at the chosen value
            let chosen_start = u.start_ts();
            let chosen_durable = u.durable_ts();
            let chosen_txn = u.txn_id;

            for i in 0..spills.len() {
                let spill = &spills[i];

                // a version with the same identity as the value staying
                // on the page is redundant
                if spill.start_ts == chosen_start && spill.start_txn == chosen_txn {
                    stats::incr(&tree.stats.hs_write_squash);
                    continue;
                }

                // obsolete: superseded before the pinned timestamp, no
                // reader can reach it anymore
                let stop_ts = spills
                    .get(i + 1)
                    .map(|n| n.start_ts)
                    .unwrap_or(chosen_start);
                if pinned_ts != TS_NONE && stop_ts != TS_NONE && stop_ts <= pinned_ts {
                    continue;
                }

                let stop_durable = spills
                    .get(i + 1)
                    .map(|n| n.durable_ts)
                    .unwrap_or(chosen_durable);
                hs.insert(
                    tree.id,
                    &key,
                    spill.start_ts,
                    HsRecord {
                        stop_durable_ts: stop_durable,
                        durable_ts: spill.durable_ts,
                        hs_type: spill.hs_type,
                        payload: spill.payload.clone(),
                    },
                )?;
                hs_spilled = true;

                // mark the source update so a later reconciliation of a
                // re-instantiated chain does not spill it twice
                if let Some(src) = older
                    .iter()
                    .find(|o| o.start_ts() == spill.start_ts && o.txn_id == spill.start_txn)
                {
                    src.set_flag(UPD_HS_SPILLED);
                }
            }
            if hs_spilled {
                u.set_flag(UPD_HS_SPILLED);
            }
        }
    }

    Ok((
        KeyRec {
            key,
            slot_value,
            saved,
        },
        hs_spilled,
    ))
}

/// Reconcile a row-store leaf into its key records.
fn rec_row_leaf(
    tree: &BTree,
    page: &Page,
    hs: Option<&HistoryStore>,
    pinned_ts: Timestamp,
) -> TreeResult<(Vec<KeyRec>, bool)> {
    let leaf = page.as_row_leaf();
    let mut recs = Vec::new();
    let mut any_spill = false;

    // lists interleave with slots: inserts[i] precedes slot i
    for (i, list) in leaf.inserts.iter().enumerate() {
        for node in list.iter() {
            let (rec, spilled) = rec_key(
                tree,
                hs,
                node.key.clone(),
                &node.chain,
                None,
                pinned_ts,
            )?;
            recs.push(rec);
            any_spill |= spilled;
        }
        if i < leaf.slots.len() {
            let slot = &leaf.slots[i];
            let (rec, spilled) = rec_key(
                tree,
                hs,
                InsertKey::Row(slot.key.clone()),
                &leaf.updates[i],
                Some((slot.value.clone(), slot.tw.clone())),
                pinned_ts,
            )?;
            recs.push(rec);
            any_spill |= spilled;
        }
    }

    recs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok((recs, any_spill))
}

fn rec_col_var_leaf(
    tree: &BTree,
    page: &Page,
    hs: Option<&HistoryStore>,
    pinned_ts: Timestamp,
) -> TreeResult<(Vec<KeyRec>, bool)> {
    let leaf = page.as_col_var_leaf();
    let mut recs = Vec::new();
    let mut any_spill = false;

    let empty_chain = UpdateChain::new();

    // on-page runs, one record at a time (runs re-expand; no RLE
    // recompression on the way out)
    for slot in &leaf.slots {
        for i in 0..slot.rle {
            let recno = slot.recno + i;
            let key = InsertKey::Recno(recno);
            let node = leaf.inserts.find(&key);
            let chain: &UpdateChain = node.as_ref().map(|n| &n.chain).unwrap_or(&empty_chain);
            let (rec, spilled) = rec_key(
                tree,
                hs,
                key,
                chain,
                slot.value.clone(),
                pinned_ts,
            )?;
            recs.push(rec);
            any_spill |= spilled;
        }
    }

    // inserts naming records with no on-page cell, and appends
    for node in leaf.inserts.iter() {
        if leaf.slot_for(node.key.as_recno()).is_none() {
            let (rec, spilled) =
                rec_key(tree, hs, node.key.clone(), &node.chain, None, pinned_ts)?;
            recs.push(rec);
            any_spill |= spilled;
        }
    }
    for node in leaf.append.iter() {
        let (rec, spilled) = rec_key(tree, hs, node.key.clone(), &node.chain, None, pinned_ts)?;
        recs.push(rec);
        any_spill |= spilled;
    }

    recs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok((recs, any_spill))
}

/// Reconcile one leaf. The caller holds the ref LOCKED.
pub fn reconcile(
    tree: &BTree,
    page: &Arc<Page>,
    hs: Option<&HistoryStore>,
) -> TreeResult<RecOutcome> {
    stats::incr(&tree.stats.pages_reconciled);
    let pinned_ts = tree.txn_global.pinned_timestamp();

    match page.page_type() {
        PageType::RowLeaf | PageType::ColVarLeaf => {
            let (recs, hs_spilled) = if page.page_type() == PageType::RowLeaf {
                rec_row_leaf(tree, page, hs, pinned_ts)?
            } else {
                rec_col_var_leaf(tree, page, hs, pinned_ts)?
            };
            build_blocks(tree, page, recs, hs_spilled)
        }
        PageType::ColFixLeaf => rec_col_fix(tree, page),
        PageType::Internal => Err(Error::invalid("internal pages are not reconciled here")),
    }
}

fn build_blocks(
    tree: &BTree,
    page: &Arc<Page>,
    recs: Vec<KeyRec>,
    hs_spilled: bool,
) -> TreeResult<RecOutcome> {
    let live: Vec<&KeyRec> = recs
        .iter()
        .filter(|r| r.slot_value.is_some() || r.saved.is_some())
        .collect();
    if live.is_empty() {
        return Ok(RecOutcome::Empty);
    }

    // estimate the image size and carve the keys into page-sized chunks
    let mut chunks: Vec<Vec<&KeyRec>> = Vec::new();
    let mut current: Vec<&KeyRec> = Vec::new();
    let mut current_size = image::PAGE_HEADER_SIZE;
    for rec in &live {
        let entry_size = match &rec.slot_value {
            Some((v, _)) => v.len() + key_size(&rec.key) + 64,
            None => key_size(&rec.key) + 64,
        };
        if !current.is_empty() && current_size + entry_size > tree.config.page_size {
            chunks.push(std::mem::take(&mut current));
            current_size = image::PAGE_HEADER_SIZE;
        }
        current.push(rec);
        current_size += entry_size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let write_gen = page.bump_write_gen();

    if chunks.len() == 1 {
        let chunk = &chunks[0];
        let (image, ta) = encode_chunk(tree, page, write_gen, chunk, hs_spilled)?;
        let saved: Vec<(InsertKey, Arc<Update>)> = chunk
            .iter()
            .filter_map(|r| r.saved.clone().map(|s| (r.key.clone(), s)))
            .collect();
        return Ok(RecOutcome::Single {
            image,
            saved,
            hs_spilled,
            ta,
        });
    }

    let mut blocks = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let (image, ta) = encode_chunk(tree, page, write_gen, chunk, hs_spilled)?;
        let saved: Vec<(InsertKey, Arc<Update>)> = chunk
            .iter()
            .filter_map(|r| r.saved.clone().map(|s| (r.key.clone(), s)))
            .collect();
        let key = chunk[0].key.clone();
        let block_key = match key {
            InsertKey::Row(k) => crate::btree::refs::RefKey::Row(k),
            InsertKey::Recno(r) => crate::btree::refs::RefKey::Recno(r),
        };
        if saved.is_empty() {
            // fully resolved: write it out now
            let addr = tree.block.write(&image)?;
            blocks.push(MultiBlock {
                key: block_key,
                addr: Some(RefAddr { addr, ta }),
                hs_hint: hs_hint_for(tree, hs_spilled),
                image: None,
                saved_updates: Vec::new(),
            });
        } else {
            blocks.push(MultiBlock {
                key: block_key,
                addr: None,
                hs_hint: None,
                image: Some(image),
                saved_updates: saved,
            });
        }
    }
    Ok(RecOutcome::Multi(blocks))
}

fn hs_hint_for(tree: &BTree, hs_spilled: bool) -> Option<crate::btree::refs::HsHint> {
    if !hs_spilled {
        return None;
    }
    Some(crate::btree::refs::HsHint {
        hs_page_min: 0,
        max_txn: tree.txn_global.current_id(),
        max_ts: tree.txn_global.durable_timestamp(),
    })
}

fn key_size(key: &InsertKey) -> usize {
    match key {
        InsertKey::Row(k) => k.len(),
        InsertKey::Recno(_) => 8,
    }
}

fn encode_chunk(
    tree: &BTree,
    page: &Page,
    write_gen: u64,
    chunk: &[&KeyRec],
    hs_spilled: bool,
) -> TreeResult<(Vec<u8>, TimeAggregate)> {
    let mut ta = TimeAggregate::default();

    match page.page_type() {
        PageType::RowLeaf => {
            let mut slots = Vec::new();
            for rec in chunk {
                if let Some((v, tw)) = &rec.slot_value {
                    ta.merge_tw(tw);
                    slots.push(RowSlot {
                        key: match &rec.key {
                            InsertKey::Row(k) => k.clone(),
                            InsertKey::Recno(_) => unreachable!(),
                        },
                        value: v.clone(),
                        tw: tw.clone(),
                    });
                }
            }
            let image =
                image::encode_row_leaf(write_gen, page.mem_size(), &slots, hs_spilled);
            Ok((image, ta))
        }
        PageType::ColVarLeaf => {
            let mut slots = Vec::new();
            for rec in chunk {
                if let Some((v, tw)) = &rec.slot_value {
                    ta.merge_tw(tw);
                    slots.push(ColVarSlot {
                        recno: rec.key.as_recno(),
                        rle: 1,
                        value: Some((v.clone(), tw.clone())),
                    });
                }
            }
            let start_recno = slots.first().map(|s| s.recno).unwrap_or(1);
            let image = image::encode_col_var_leaf(
                write_gen,
                page.mem_size(),
                start_recno,
                &slots,
                hs_spilled,
            );
            Ok((image, ta))
        }
        _ => Err(Error::panic("chunk encoding for an unexpected page type")),
    }
}

/// Fixed-length leaves reconcile to a dense bitmap; deleted records
/// become zeros and no history is kept.
fn rec_col_fix(tree: &BTree, page: &Arc<Page>) -> TreeResult<RecOutcome> {
    let leaf = page.as_col_fix_leaf();

    let mut last = leaf.stop_recno().saturating_sub(1);
    for node in leaf.inserts.iter().chain(leaf.append.iter()) {
        last = last.max(node.key.as_recno());
    }
    if last < leaf.start_recno {
        return Ok(RecOutcome::Empty);
    }

    let mut saved: Vec<(InsertKey, Arc<Update>)> = Vec::new();
    let mut values = Vec::with_capacity((last - leaf.start_recno + 1) as usize);
    for recno in leaf.start_recno..=last {
        let key = InsertKey::Recno(recno);
        let node = leaf.inserts.find(&key).or_else(|| leaf.append.find(&key));
        let mut value = leaf.on_page_value(recno).unwrap_or(0);
        if let Some(node) = node {
            let mut unresolved = false;
            for u in chain_updates(&node.chain) {
                if u.is_aborted() || u.utype == UpdateType::Reserve {
                    continue;
                }
                if !u.is_committed() || u.prepare_state() == PrepareState::InProgress {
                    unresolved = true;
                    continue;
                }
                value = match u.utype {
                    UpdateType::Tombstone => 0,
                    _ => u.data.first().copied().unwrap_or(0),
                };
                break;
            }
            if unresolved {
                saved.push((key, node.chain.head().unwrap()));
            }
        }
        values.push(value);
    }

    let write_gen = page.bump_write_gen();
    let image = image::encode_col_fix_leaf(
        write_gen,
        page.mem_size(),
        leaf.start_recno,
        leaf.bit_width,
        &values,
    );
    Ok(RecOutcome::Single {
        image,
        saved,
        hs_spilled: false,
        ta: TimeAggregate::default(),
    })
}

/// Evict one leaf: reconcile it and either push it to disk, split it
/// into multiple blocks, re-instantiate it (unresolved updates), or
/// reverse-split it away (empty).
pub fn evict(tree: &BTree, r: &Arc<PageRef>, hs: Option<&HistoryStore>) -> CoreResult {
    if r.is_root() {
        return Err(Error::busy("cannot evict the root"));
    }
    if !r.cas_state(RefState::Mem, RefState::Locked) {
        return Err(Error::busy("page is not idle in memory"));
    }

    let result = evict_locked(tree, r, hs);
    if result.is_err() && r.state() == RefState::Locked {
        r.set_state(RefState::Mem);
    }
    result
}

fn evict_locked(tree: &BTree, r: &Arc<PageRef>, hs: Option<&HistoryStore>) -> CoreResult {
    let page = r.page().ok_or_else(|| Error::busy("no page in memory"))?;

    // eviction never frees a page named by a hazard pointer: one count
    // for the ref, one for our local handle, anything else is a reader
    if Arc::strong_count(&page) > 2 {
        return Err(Error::busy("page has active readers"));
    }
    if !page.is_leaf() {
        return Err(Error::busy("only leaves are evicted here"));
    }

    let outcome = {
        let _page_lock = page.modify_lock.lock().unwrap();
        reconcile(tree, &page, hs)?
    };

    match outcome {
        RecOutcome::Empty => {
            // nothing live: take the subtree entry out of the parent
            match split::reverse_split(tree, r) {
                Ok(()) => {
                    r.set_page(None);
                    stats::incr(&tree.stats.pages_evicted);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        RecOutcome::Single {
            image,
            saved,
            hs_spilled,
            ta,
        } => {
            if saved.is_empty() {
                let old_addr = r.addr();
                let addr = tree.block.write(&image)?;
                r.set_addr(Some(RefAddr { addr, ta }));
                if hs_spilled {
                    r.set_hs_hint(hs_hint_for(tree, true));
                }
                r.set_page(None);
                page.clear_dirty();
                r.set_state(RefState::Disk);
                if let Some(old) = old_addr {
                    let _ = tree.block.free(&old.addr);
                }
                stats::incr(&tree.stats.pages_evicted);
                debug!("evicted page {} of btree {}", page.id, tree.id);
                Ok(())
            } else {
                // unresolved updates: keep the page in memory, rebuilt
                // from the image with the saved chains re-applied
                let new_page = tree.build_page_from_image(&image)?;
                split::reapply_saved_updates(&new_page, &saved)?;
                new_page.mark_dirty();
                r.attach_page(&new_page);
                r.set_state(RefState::Mem);
                debug!(
                    "eviction re-instantiated page {} of btree {} ({} saved chains)",
                    page.id,
                    tree.id,
                    saved.len()
                );
                Ok(())
            }
        }
        RecOutcome::Multi(blocks) => split::split_multi(tree, r, blocks),
    }
}

/// Best-effort checkpoint of one tree: evict every dirty leaf, then ask
/// the block manager to make it durable.
pub fn checkpoint_tree(tree: &BTree, hs: Option<&HistoryStore>) -> CoreResult {
    loop {
        let mut evicted_any = false;
        let mut entry = crate::btree::walk::tree_walk(
            tree,
            None,
            crate::btree::walk::WalkDirection::Next,
            crate::btree::walk::WalkFlags {
                cache_only: true,
                skip_deleted: true,
                ..Default::default()
            },
        );
        let mut dirty: Vec<Arc<PageRef>> = Vec::new();
        while let Ok(Some(e)) = entry {
            if let Some(p) = &e.page {
                if p.is_dirty() {
                    dirty.push(Arc::clone(&e.r));
                }
            }
            let r = e.r;
            entry = crate::btree::walk::tree_walk(
                tree,
                Some(&r),
                crate::btree::walk::WalkDirection::Next,
                crate::btree::walk::WalkFlags {
                    cache_only: true,
                    skip_deleted: true,
                    ..Default::default()
                },
            );
        }
        for r in dirty {
            if evict(tree, &r, hs).is_ok() {
                evicted_any = true;
            }
        }
        if !evicted_any {
            break;
        }
    }
    tree.block.checkpoint()
}
