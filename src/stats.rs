use std::sync::atomic::{AtomicU64, Ordering};

/// Connection statistics. All counters are monotonic and relaxed, they
/// exist for observability and tests, not for control flow.
#[derive(Default)]
pub struct Stats {
    pub cursor_restart: AtomicU64,
    pub walk_restart: AtomicU64,

    pub leaf_split: AtomicU64,
    pub internal_split: AtomicU64,
    pub root_deepen: AtomicU64,
    pub reverse_split: AtomicU64,

    pub hs_insert: AtomicU64,
    pub hs_write_squash: AtomicU64,
    pub hs_read: AtomicU64,
    pub hs_read_squash: AtomicU64,
    pub hs_remove_key: AtomicU64,

    pub rts_pages_visited: AtomicU64,
    pub rts_trees_skipped: AtomicU64,
    pub rts_upd_aborted: AtomicU64,
    pub rts_hs_restored: AtomicU64,
    pub rts_keys_removed: AtomicU64,

    pub pages_evicted: AtomicU64,
    pub pages_reconciled: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
