use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, RwLock,
    },
};

use log::{debug, info};

use crate::{
    block::{BlockManager, FileBlockManager, MemBlockManager},
    btree::{page::PageType, rec, refs::PageRef, walk, BTree},
    config::{BtreeConfig, ConnectionConfig},
    error::Error,
    history::HistoryStore,
    rts::{self, RollbackOptions},
    session::{GenerationTracker, Session},
    stats::Stats,
    txn::TxnGlobal,
    types::{CoreResult, Timestamp, TreeResult},
    utils::HandyRwLock,
};

/// The history store's reserved btree id.
const HS_BTREE_ID: u32 = 0;

/// A connection: one storage engine instance. Owns the catalog of
/// B-trees, the history store, the block manager and the global
/// transaction state. There are no ambient globals; everything flows
/// from here.
pub struct Connection {
    config: ConnectionConfig,
    txn_global: Arc<TxnGlobal>,
    block: Arc<dyn BlockManager>,
    gen: Arc<GenerationTracker>,
    stats: Arc<Stats>,

    trees: RwLock<HashMap<String, Arc<BTree>>>,
    hs: RwLock<Option<Arc<HistoryStore>>>,
    next_btree_id: AtomicU32,
}

impl Connection {
    pub fn open_in_memory(config: ConnectionConfig) -> Arc<Self> {
        Self::with_block_manager(config, Arc::new(MemBlockManager::new()))
    }

    pub fn open<P: AsRef<Path>>(path: P, config: ConnectionConfig) -> TreeResult<Arc<Self>> {
        let block = Arc::new(FileBlockManager::open(path)?);
        Ok(Self::with_block_manager(config, block))
    }

    fn with_block_manager(config: ConnectionConfig, block: Arc<dyn BlockManager>) -> Arc<Self> {
        let txn_global = Arc::new(TxnGlobal::new());
        if config.stable_timestamp != 0 {
            txn_global.set_stable_timestamp(config.stable_timestamp);
        }
        if config.oldest_timestamp != 0 {
            txn_global.set_oldest_timestamp(config.oldest_timestamp);
        }

        let conn = Arc::new(Self {
            config,
            txn_global,
            block,
            gen: Arc::new(GenerationTracker::new()),
            stats: Arc::new(Stats::new()),
            trees: RwLock::new(HashMap::new()),
            hs: RwLock::new(None),
            next_btree_id: AtomicU32::new(1),
        });
        conn.bootstrap_history_store();
        info!("connection opened");
        conn
    }

    /// The history store is an ordinary row-store B-tree with its own
    /// fixed configuration: 64 MiB value maximum, prefix compression
    /// on, no compressor unless one is built in.
    fn bootstrap_history_store(&self) {
        let hs_config = BtreeConfig {
            value_max: 64 << 20,
            prefix_compression: true,
            ..BtreeConfig::default()
        };
        let mut tree = BTree::create(
            HS_BTREE_ID,
            "history-store",
            PageType::RowLeaf,
            hs_config,
            Arc::clone(&self.block),
            Arc::clone(&self.gen),
            Arc::clone(&self.stats),
            Arc::clone(&self.txn_global),
        );
        tree.mark_history_store();
        let hs = HistoryStore::new(tree, Arc::clone(&self.txn_global));
        *self.hs.wl() = Some(Arc::new(hs));
    }

    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    pub fn txn_global(&self) -> &Arc<TxnGlobal> {
        &self.txn_global
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn block_manager(&self) -> &Arc<dyn BlockManager> {
        &self.block
    }

    pub fn history_store(&self) -> Arc<HistoryStore> {
        self.hs.rl().as_ref().expect("history store missing").clone()
    }

    pub fn set_stable_timestamp(&self, ts: Timestamp) {
        self.txn_global.set_stable_timestamp(ts);
    }

    pub fn set_oldest_timestamp(&self, ts: Timestamp) {
        self.txn_global.set_oldest_timestamp(ts);
    }

    pub fn create_tree(
        &self,
        name: &str,
        leaf_type: PageType,
        config: BtreeConfig,
    ) -> TreeResult<Arc<BTree>> {
        let mut trees = self.trees.wl();
        if trees.contains_key(name) {
            return Err(Error::invalid("a tree with this name already exists"));
        }
        let id = self.next_btree_id.fetch_add(1, Ordering::AcqRel);
        let tree = BTree::create(
            id,
            name,
            leaf_type,
            config,
            Arc::clone(&self.block),
            Arc::clone(&self.gen),
            Arc::clone(&self.stats),
            Arc::clone(&self.txn_global),
        );
        trees.insert(name.to_string(), Arc::clone(&tree));
        debug!("created tree {} (id {})", name, id);
        Ok(tree)
    }

    pub fn get_tree(&self, name: &str) -> Option<Arc<BTree>> {
        self.trees.rl().get(name).cloned()
    }

    /// Open a cursor on a tree, wired to the history store for
    /// point-in-time fallback reads.
    pub fn open_cursor(&self, tree: &Arc<BTree>) -> crate::btree::cursor::Cursor {
        let mut cursor = crate::btree::cursor::Cursor::new(Arc::clone(tree));
        if !tree.is_hs {
            cursor.set_history_store(self.history_store());
        }
        cursor
    }

    pub fn drop_tree(&self, name: &str) -> CoreResult {
        match self.trees.wl().remove(name) {
            Some(tree) => {
                tree.close();
                Ok(())
            }
            None => Err(Error::not_found()),
        }
    }

    /// Evict one leaf of a tree (reconcile + push to disk). `Busy` when
    /// readers hold it or the page is not idle.
    pub fn evict(&self, tree: &Arc<BTree>, r: &Arc<PageRef>) -> CoreResult {
        let hs = self.history_store();
        let hs_opt = if tree.is_hs { None } else { Some(hs.as_ref()) };
        rec::evict(tree, r, hs_opt)
    }

    /// Evict every leaf of a tree, best effort. Used to force
    /// reconciliation (and history-store spilling) in tests and
    /// maintenance paths.
    pub fn evict_tree(&self, tree: &Arc<BTree>) -> CoreResult {
        let hs = self.history_store();
        let hs_opt = if tree.is_hs { None } else { Some(hs.as_ref()) };

        let mut leaves: Vec<Arc<PageRef>> = Vec::new();
        let mut cur = walk::tree_walk(
            tree,
            None,
            walk::WalkDirection::Next,
            walk::WalkFlags {
                cache_only: true,
                skip_deleted: true,
                ..Default::default()
            },
        );
        while let Ok(Some(e)) = cur {
            leaves.push(Arc::clone(&e.r));
            let r = e.r;
            cur = walk::tree_walk(
                tree,
                Some(&r),
                walk::WalkDirection::Next,
                walk::WalkFlags {
                    cache_only: true,
                    skip_deleted: true,
                    ..Default::default()
                },
            );
        }
        for r in leaves {
            match rec::evict(tree, &r, hs_opt) {
                Ok(()) => {}
                Err(e) if *e.kind() == crate::error::ErrorKind::Busy => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Checkpoint every tree through the block manager.
    pub fn checkpoint(&self) -> CoreResult {
        let trees: Vec<Arc<BTree>> = self.trees.rl().values().cloned().collect();
        let hs = self.history_store();
        for tree in trees {
            rec::checkpoint_tree(&tree, Some(hs.as_ref()))?;
        }
        rec::checkpoint_tree(hs.tree(), None)?;
        Ok(())
    }

    /// Rollback-to-stable over every tree in the catalog. Fails with
    /// `Invalid` while transactions are active; a dry run previews the
    /// effect without mutating anything.
    pub fn rollback_to_stable(&self, opts: RollbackOptions) -> CoreResult {
        if self.txn_global.active_count() > 0 {
            return Err(Error::invalid(
                "rollback_to_stable requires no active transactions",
            ));
        }

        let stable_ts = self.txn_global.stable_timestamp();
        let hs = self.history_store();
        info!(
            "rollback_to_stable starting, stable timestamp: {}, dry_run: {}",
            stable_ts, opts.dry_run
        );

        let trees: Vec<Arc<BTree>> = self.trees.rl().values().cloned().collect();
        for tree in &trees {
            rts::rollback_tree(tree, Some(hs.as_ref()), stable_ts, opts)?;
        }

        if !opts.dry_run {
            // bring persisted state into agreement and pull the global
            // durable timestamp back to the stable point
            self.checkpoint()?;
            self.txn_global.set_durable_timestamp(stable_ts);
        }
        Ok(())
    }

    /// Rollback-to-stable with the connection's configured options.
    pub fn rollback_to_stable_default(&self) -> CoreResult {
        self.rollback_to_stable(RollbackOptions {
            dry_run: self.config.rollback.dry_run,
        })
    }

    pub fn close(&self) {
        let trees: Vec<Arc<BTree>> = self.trees.rl().values().cloned().collect();
        for tree in trees {
            tree.close();
        }
        self.gen.reap(true);
        info!("connection closed");
    }
}
