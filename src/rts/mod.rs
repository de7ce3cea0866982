//! Rollback-to-stable: restore every B-tree to the state it would have
//! had if nothing with a durable timestamp past the stable timestamp
//! (or any unresolved prepare) had ever happened.
//!
//! Runs offline: entry fails with `Invalid` while other transactions
//! are active. The walk visits every page whose time aggregate might be
//! unstable, aborts unstable updates in place, and when the on-disk
//! value itself is unstable, lifts the newest stable version back out
//! of the history store (or tombstones the key when none exists).

use std::sync::Arc;

use log::{debug, info};

use crate::{
    btree::{
        insert_list::{InsertKey, InsertList},
        page::{Page, PageType},
        refs::{PageRef, RefState},
        update::{
            PrepareState, TimeWindow, Update, UpdateChain, UpdateType, UPD_HS_SPILLED,
            UPD_RESTORED_FROM_HS,
        },
        BTree,
    },
    error::Error,
    history::HistoryStore,
    stats,
    types::{CoreResult, Timestamp, TS_NONE, TXN_NONE},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct RollbackOptions {
    /// Mark and count, but mutate nothing.
    pub dry_run: bool,
}

/// Roll one tree back to the stable timestamp. The caller has verified
/// no transactions are active and holds the catalog stable.
pub fn rollback_tree(
    tree: &Arc<BTree>,
    hs: Option<&HistoryStore>,
    stable_ts: Timestamp,
    opts: RollbackOptions,
) -> CoreResult {
    if tree.is_hs {
        // the history store is exempt from timestamp rules
        return Ok(());
    }
    if tree.config.log_immediately_durable {
        return Err(Error::invalid(
            "cannot unwind a tree whose log is immediately durable",
        ));
    }

    if !tree_has_unstable(tree, stable_ts) {
        stats::incr(&tree.stats.rts_trees_skipped);
        debug!("rts skipping stable tree {}", tree.name);
        return Ok(());
    }

    info!(
        "rolling back tree {} to stable timestamp {}",
        tree.name, stable_ts
    );
    let root_page = tree
        .root()
        .hazard_page()
        .map_err(|_| Error::invalid("tree root is not in memory"))?;
    rollback_internal(tree, hs, &root_page, stable_ts, opts)
}

/// Cheap pre-check: anything dirty in memory, or any on-disk aggregate
/// past the stable point?
fn tree_has_unstable(tree: &Arc<BTree>, stable_ts: Timestamp) -> bool {
    let root_page = match tree.root().hazard_page() {
        Ok(p) => p,
        Err(_) => return false,
    };
    page_has_unstable(&root_page, stable_ts)
}

fn page_has_unstable(page: &Arc<Page>, stable_ts: Timestamp) -> bool {
    if page.page_type() != PageType::Internal {
        return page.is_dirty();
    }
    let index = page.as_internal().load_index();
    for child in &index.refs {
        match child.state() {
            RefState::Deleted => {
                if child.page_del().is_some() {
                    return true;
                }
            }
            RefState::Disk => {
                let stable = child
                    .addr()
                    .map(|a| a.ta.is_stable(stable_ts))
                    .unwrap_or(false);
                if !stable || child.hs_hint().is_some() {
                    return true;
                }
            }
            _ => {
                if let Ok(p) = child.hazard_page() {
                    if page_has_unstable(&p, stable_ts) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn rollback_internal(
    tree: &Arc<BTree>,
    hs: Option<&HistoryStore>,
    page: &Arc<Page>,
    stable_ts: Timestamp,
    opts: RollbackOptions,
) -> CoreResult {
    let index = page.as_internal().load_index();
    for child in &index.refs {
        match child.state() {
            RefState::Deleted => rollback_fast_delete(tree, child, stable_ts, opts)?,
            RefState::Disk => {
                // read the page only when its aggregate says it might
                // hold something unstable
                let needs_read = match child.addr() {
                    Some(a) => !a.ta.is_stable(stable_ts) || child.hs_hint().is_some(),
                    None => true,
                };
                if !needs_read {
                    continue;
                }
                let child_page = tree.page_in(child)?;
                stats::incr(&tree.stats.rts_pages_visited);
                rollback_leaf(tree, hs, &child_page, stable_ts, opts)?;
            }
            _ => {
                let child_page = match child.hazard_page() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if child_page.page_type() == PageType::Internal {
                    rollback_internal(tree, hs, &child_page, stable_ts, opts)?;
                } else {
                    stats::incr(&tree.stats.rts_pages_visited);
                    rollback_leaf(tree, hs, &child_page, stable_ts, opts)?;
                }
            }
        }
    }
    Ok(())
}

/// An unstable fast-delete record is cleared: the subtree contents are
/// still on disk, so dropping the marker restores them.
fn rollback_fast_delete(
    tree: &Arc<BTree>,
    r: &Arc<PageRef>,
    stable_ts: Timestamp,
    opts: RollbackOptions,
) -> CoreResult {
    let del = match r.page_del() {
        Some(d) => d,
        None => return Ok(()),
    };
    // non-timestamped truncates are never unwound; uncommitted or
    // prepared ones always are
    let committed = matches!(
        tree.txn_global.state_of(del.txn_id),
        Some(crate::txn::TxnState::Committed) | None
    );
    let unstable = !committed || (del.durable_ts != TS_NONE && del.durable_ts > stable_ts);
    if unstable {
        debug!(
            "rts clearing unstable fast-delete on tree {} (durable_ts {})",
            tree.name, del.durable_ts
        );
        if !opts.dry_run {
            r.set_page_del(None);
            r.cas_state(RefState::Deleted, RefState::Disk);
        }
    }
    Ok(())
}

fn rollback_leaf(
    tree: &Arc<BTree>,
    hs: Option<&HistoryStore>,
    page: &Arc<Page>,
    stable_ts: Timestamp,
    opts: RollbackOptions,
) -> CoreResult {
    match page.page_type() {
        PageType::RowLeaf => {
            let leaf = page.as_row_leaf();
            for list in &leaf.inserts {
                for node in list.iter() {
                    rollback_chain(tree, hs, &node.key, &node.chain, None, stable_ts, opts, page)?;
                }
            }
            for (i, slot) in leaf.slots.iter().enumerate() {
                rollback_chain(
                    tree,
                    hs,
                    &InsertKey::Row(slot.key.clone()),
                    &leaf.updates[i],
                    Some(&slot.tw),
                    stable_ts,
                    opts,
                    page,
                )?;
            }
        }
        PageType::ColVarLeaf => {
            let leaf = page.as_col_var_leaf();
            rollback_list(tree, hs, &leaf.inserts, stable_ts, opts, page)?;
            rollback_list(tree, hs, &leaf.append, stable_ts, opts, page)?;
            // on-page cells with no update chain still need their time
            // windows checked
            for slot in &leaf.slots {
                if let Some((_, tw)) = &slot.value {
                    for i in 0..slot.rle {
                        let key = InsertKey::Recno(slot.recno + i);
                        if leaf.inserts.find(&key).is_none() {
                            rollback_on_disk(tree, hs, &key, tw, None, stable_ts, opts, page)?;
                        }
                    }
                }
            }
        }
        PageType::ColFixLeaf => {
            let leaf = page.as_col_fix_leaf();
            rollback_list(tree, hs, &leaf.inserts, stable_ts, opts, page)?;
            rollback_list(tree, hs, &leaf.append, stable_ts, opts, page)?;
        }
        PageType::Internal => unreachable!(),
    }
    Ok(())
}

fn rollback_list(
    tree: &Arc<BTree>,
    hs: Option<&HistoryStore>,
    list: &InsertList,
    stable_ts: Timestamp,
    opts: RollbackOptions,
    page: &Arc<Page>,
) -> CoreResult {
    for node in list.iter() {
        rollback_chain(tree, hs, &node.key, &node.chain, None, stable_ts, opts, page)?;
    }
    Ok(())
}

fn upd_is_stable(upd: &Update, stable_ts: Timestamp) -> bool {
    if upd.prepare_state() == PrepareState::InProgress {
        return false;
    }
    if !upd.is_committed() {
        // invisible under the recovery snapshot
        return false;
    }
    upd.durable_ts() <= stable_ts
}

#[allow(clippy::too_many_arguments)]
fn rollback_chain(
    tree: &Arc<BTree>,
    hs: Option<&HistoryStore>,
    key: &InsertKey,
    chain: &UpdateChain,
    base_tw: Option<&TimeWindow>,
    stable_ts: Timestamp,
    opts: RollbackOptions,
    page: &Arc<Page>,
) -> CoreResult {
    let mut stable: Option<Arc<Update>> = None;

    let mut cur = chain.head();
    while let Some(u) = cur {
        cur = u.next.clone();
        if u.is_aborted() {
            continue;
        }
        if !upd_is_stable(&u, stable_ts) {
            debug!(
                "rts aborting update, tree: {}, txn: {}, durable_ts: {}",
                tree.name,
                u.txn_id,
                u.durable_ts()
            );
            if !opts.dry_run {
                u.abort();
                page.mark_dirty();
            }
            stats::incr(&tree.stats.rts_upd_aborted);
            continue;
        }

        // the first stable update terminates the scan
        stable = Some(Arc::clone(&u));
        break;
    }

    if let Some(u) = &stable {
        // keep the stable value from being re-spilled with a different
        // stop pair later, and drop everything younger from the history
        if u.has_flag(UPD_HS_SPILLED) {
            if !opts.dry_run {
                u.clear_flag(UPD_HS_SPILLED);
                if let Some(hs) = hs {
                    hs.delete_from(tree.id, key, u.start_ts())?;
                }
            }
        }
        return Ok(());
    }

    // no stable update in memory: the on-disk value decides
    if let Some(tw) = base_tw {
        rollback_on_disk(tree, hs, key, tw, Some(chain), stable_ts, opts, page)?;
    }
    Ok(())
}

/// The on-disk value is unstable: replace it with the newest stable
/// history-store version, or remove the key outright.
#[allow(clippy::too_many_arguments)]
fn rollback_on_disk(
    tree: &Arc<BTree>,
    hs: Option<&HistoryStore>,
    key: &InsertKey,
    tw: &TimeWindow,
    chain: Option<&UpdateChain>,
    stable_ts: Timestamp,
    opts: RollbackOptions,
    page: &Arc<Page>,
) -> CoreResult {
    if tw.is_stable(stable_ts) {
        return Ok(());
    }
    if opts.dry_run {
        stats::incr(&tree.stats.rts_keys_removed);
        return Ok(());
    }

    let target_chain = match chain {
        Some(c) => c,
        None => {
            // column cells route their fixes through the insert list
            match page.page_type() {
                PageType::ColVarLeaf => {
                    let leaf = page.as_col_var_leaf();
                    let (node, _) = leaf.inserts.insert_or_get(key.clone());
                    page.mark_dirty();
                    return apply_on_disk_fix(tree, hs, key, &node.chain, stable_ts);
                }
                _ => return Ok(()),
            }
        }
    };
    page.mark_dirty();
    apply_on_disk_fix(tree, hs, key, target_chain, stable_ts)
}

fn apply_on_disk_fix(
    tree: &Arc<BTree>,
    hs: Option<&HistoryStore>,
    key: &InsertKey,
    chain: &UpdateChain,
    stable_ts: Timestamp,
) -> CoreResult {
    let restored = match hs {
        Some(hs) => hs.newest_stable(tree.id, key, stable_ts)?,
        None => None,
    };

    match restored {
        Some(version) => {
            let restored_upd = match &version.value {
                Some(value) => chain.prepend_resolved(
                    TXN_NONE,
                    UpdateType::Standard,
                    value.clone(),
                    version.start_ts,
                    version.durable_ts,
                ),
                None => {
                    // the stable history is itself a tombstone
                    chain.prepend_resolved(
                        TXN_NONE,
                        UpdateType::Tombstone,
                        bytes::Bytes::new(),
                        version.start_ts,
                        version.durable_ts,
                    )
                }
            };
            restored_upd.set_flag(UPD_RESTORED_FROM_HS);
            if let Some(hs) = hs {
                // the restored entry moves back onto the leaf
                hs.delete_from(tree.id, key, version.start_ts)?;
            }
            stats::incr(&tree.stats.rts_hs_restored);
            debug!(
                "rts restored key from history store, tree: {}, start_ts: {}",
                tree.name, version.start_ts
            );
        }
        None => {
            chain.prepend_resolved(
                TXN_NONE,
                UpdateType::Tombstone,
                bytes::Bytes::new(),
                TS_NONE,
                TS_NONE,
            );
            stats::incr(&tree.stats.rts_keys_removed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // rollback-to-stable is exercised end to end in the integration
    // tests (update-then-rollback, truncate-then-rollback, prepared
    // transaction rollback)
}
