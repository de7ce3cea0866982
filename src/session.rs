use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::debug;

use crate::{
    btree::page::ChildIndex,
    connection::Connection,
    txn::{Isolation, Transaction},
    types::Timestamp,
};

/// Tracks split generations for the safe-free protocol. Every reader of
/// a page index publishes the generation it entered at; retired child
/// indexes are only dropped once the minimum published generation has
/// passed the generation recorded at their retirement.
pub struct GenerationTracker {
    current: AtomicU64,
    next_token: AtomicU64,
    published: Mutex<HashMap<u64, u64>>,
    deferred: Mutex<Vec<(u64, Arc<ChildIndex>)>>,
}

impl Default for GenerationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            published: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Obtain a new split generation; called once per published split.
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Publish the current generation for this reader. Dropping the
    /// guard retracts the publication.
    pub fn enter(self: &Arc<Self>) -> GenerationGuard {
        let token = self.next_token.fetch_add(1, Ordering::AcqRel);
        let gen = self.current();
        self.published.lock().unwrap().insert(token, gen);
        GenerationGuard {
            tracker: Arc::clone(self),
            token,
        }
    }

    /// Oldest generation any live reader is observing.
    pub fn oldest(&self) -> u64 {
        let published = self.published.lock().unwrap();
        published
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.current())
    }

    /// Schedule a retired child index for deferred free.
    pub fn retire(&self, gen: u64, index: Arc<ChildIndex>) {
        self.deferred.lock().unwrap().push((gen, index));
        self.reap(false);
    }

    /// Drop deferred indexes whose generation every reader has passed.
    /// With `exclusive` set (tree close) everything goes immediately.
    pub fn reap(&self, exclusive: bool) {
        let oldest = if exclusive { u64::MAX } else { self.oldest() };
        let mut deferred = self.deferred.lock().unwrap();
        let before = deferred.len();
        deferred.retain(|(gen, _)| *gen >= oldest);
        if before != deferred.len() {
            debug!(
                "safe-free reaped {} retired page indexes, oldest gen: {}",
                before - deferred.len(),
                oldest
            );
        }
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().unwrap().len()
    }
}

pub struct GenerationGuard {
    tracker: Arc<GenerationTracker>,
    token: u64,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.tracker.published.lock().unwrap().remove(&self.token);
        self.tracker.reap(false);
    }
}

/// A session: the unit of access to a connection. Sessions are cheap,
/// one per thread of control.
pub struct Session {
    conn: Arc<Connection>,
}

impl Session {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn begin(&self, read_ts: Option<Timestamp>) -> Transaction {
        self.conn.txn_global().begin(read_ts, Isolation::Snapshot)
    }

    pub fn begin_with(&self, isolation: Isolation, read_ts: Option<Timestamp>) -> Transaction {
        self.conn.txn_global().begin(read_ts, isolation)
    }

    pub fn open_cursor(&self, tree: &Arc<crate::btree::BTree>) -> crate::btree::cursor::Cursor {
        self.conn.open_cursor(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_safe_free() {
        let tracker = Arc::new(GenerationTracker::new());

        let guard = tracker.enter();
        let entered_at = tracker.oldest();

        let gen = tracker.next();
        tracker.retire(gen, Arc::new(ChildIndex::new(vec![])));

        // the reader entered before the split, the index must survive
        assert_eq!(tracker.deferred_count(), 1);
        assert!(entered_at < gen);

        drop(guard);
        tracker.reap(false);
        assert_eq!(tracker.deferred_count(), 0);
    }

    #[test]
    fn test_exclusive_reap() {
        let tracker = Arc::new(GenerationTracker::new());
        let _guard = tracker.enter();
        let gen = tracker.next();
        tracker.retire(gen, Arc::new(ChildIndex::new(vec![])));
        assert_eq!(tracker.deferred_count(), 1);

        tracker.reap(true);
        assert_eq!(tracker.deferred_count(), 0);
    }
}
