use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
};

use log::debug;

use crate::{
    btree::update::{TimeWindow, Update},
    error::Error,
    types::{CoreResult, Timestamp, TxnId, TS_NONE, TXN_ABORTED, TXN_NONE},
    utils::HandyRwLock,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Isolation {
    /// Snapshot taken once at begin; the pinned-page fast path applies.
    Snapshot,
    /// Snapshot refreshed on every operation; the fast path is disabled
    /// because transaction-id handling differs between paths.
    ReadCommitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Prepared,
    Committed,
    Aborted,
}

/// The set of transactions a reader must not see: everything that was
/// running when the snapshot was taken, plus everything newer.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub snap_min: TxnId,
    pub snap_max: TxnId,
    pub active: BTreeSet<TxnId>,
}

impl Snapshot {
    pub fn contains(&self, id: TxnId) -> bool {
        id >= self.snap_max || self.active.contains(&id)
    }
}

struct TxnGlobalInner {
    active: BTreeSet<TxnId>,
    states: HashMap<TxnId, TxnState>,
    /// read timestamps pinned by running transactions
    read_timestamps: HashMap<TxnId, Timestamp>,
}

/// Connection-wide transaction state. Writers update under the lock,
/// readers use the ordered atomic loads.
pub struct TxnGlobal {
    next_id: AtomicU64,

    oldest_ts: AtomicU64,
    stable_ts: AtomicU64,
    durable_ts: AtomicU64,

    inner: Mutex<TxnGlobalInner>,
}

impl TxnGlobal {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            oldest_ts: AtomicU64::new(TS_NONE),
            stable_ts: AtomicU64::new(TS_NONE),
            durable_ts: AtomicU64::new(TS_NONE),
            inner: Mutex::new(TxnGlobalInner {
                active: BTreeSet::new(),
                states: HashMap::new(),
                read_timestamps: HashMap::new(),
            }),
        }
    }

    pub fn oldest_timestamp(&self) -> Timestamp {
        self.oldest_ts.load(Ordering::Acquire)
    }

    pub fn stable_timestamp(&self) -> Timestamp {
        self.stable_ts.load(Ordering::Acquire)
    }

    pub fn durable_timestamp(&self) -> Timestamp {
        self.durable_ts.load(Ordering::Acquire)
    }

    pub fn set_oldest_timestamp(&self, ts: Timestamp) {
        let _guard = self.inner.lock().unwrap();
        self.oldest_ts.store(ts, Ordering::Release);
    }

    pub fn set_stable_timestamp(&self, ts: Timestamp) {
        let _guard = self.inner.lock().unwrap();
        self.stable_ts.store(ts, Ordering::Release);
    }

    pub fn set_durable_timestamp(&self, ts: Timestamp) {
        let _guard = self.inner.lock().unwrap();
        self.durable_ts.store(ts, Ordering::Release);
    }

    /// The timestamp reads are pinned at: the oldest timestamp or the
    /// oldest read timestamp of a running transaction, whichever is
    /// older. History older than this can never be read again.
    pub fn pinned_timestamp(&self) -> Timestamp {
        let inner = self.inner.lock().unwrap();
        let oldest = self.oldest_ts.load(Ordering::Acquire);
        let reader_min = inner.read_timestamps.values().copied().min();
        match (oldest, reader_min) {
            (TS_NONE, Some(m)) => m,
            (o, Some(m)) => std::cmp::min(o, m),
            (o, None) => o,
        }
    }

    fn take_snapshot(inner: &TxnGlobalInner, snap_max: TxnId) -> Snapshot {
        let active = inner.active.clone();
        let snap_min = active.iter().next().copied().unwrap_or(snap_max);
        Snapshot {
            snap_min,
            snap_max,
            active,
        }
    }

    pub fn begin(
        self: &Arc<Self>,
        read_ts: Option<Timestamp>,
        isolation: Isolation,
    ) -> Transaction {
        let mut inner = self.inner.lock().unwrap();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let snapshot = match isolation {
            Isolation::Snapshot => Some(Self::take_snapshot(&inner, id)),
            Isolation::ReadCommitted => None,
        };

        inner.active.insert(id);
        inner.states.insert(id, TxnState::Active);
        if let Some(ts) = read_ts {
            inner.read_timestamps.insert(id, ts);
        }
        drop(inner);

        debug!("txn begin, id: {}, read_ts: {:?}", id, read_ts);

        Transaction {
            id,
            global: Arc::clone(self),
            isolation,
            read_ts: read_ts.unwrap_or(TS_NONE),
            has_read_ts: read_ts.is_some(),
            snapshot: RwLock::new(snapshot),
            ignore_prepare: false,
            writes: Mutex::new(Vec::new()),
            fast_deletes: Mutex::new(Vec::new()),
            state: AtomicU8::new(TXN_STATE_ACTIVE),
        }
    }

    pub fn is_committed(&self, id: TxnId) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(inner.states.get(&id), Some(TxnState::Committed))
    }

    pub fn state_of(&self, id: TxnId) -> Option<TxnState> {
        let inner = self.inner.lock().unwrap();
        inner.states.get(&id).copied()
    }

    /// Count of transactions that block rollback-to-stable. Prepared
    /// transactions do not count, their updates are aborted by RTS.
    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .iter()
            .filter(|id| matches!(inner.states.get(id), Some(TxnState::Active)))
            .count()
    }

    pub fn current_id(&self) -> TxnId {
        self.next_id.load(Ordering::SeqCst)
    }

    fn finish(&self, id: TxnId, state: TxnState) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(&id);
        inner.read_timestamps.remove(&id);
        inner.states.insert(id, state);
    }

    fn mark_prepared(&self, id: TxnId) {
        let mut inner = self.inner.lock().unwrap();
        inner.states.insert(id, TxnState::Prepared);
    }
}

impl Default for TxnGlobal {
    fn default() -> Self {
        Self::new()
    }
}

const TXN_STATE_ACTIVE: u8 = 0;
const TXN_STATE_PREPARED: u8 = 1;
const TXN_STATE_COMMITTED: u8 = 2;
const TXN_STATE_ABORTED: u8 = 3;

/// A transaction handle. One per thread of control; not shared.
pub struct Transaction {
    id: TxnId,
    global: Arc<TxnGlobal>,
    isolation: Isolation,
    read_ts: Timestamp,
    has_read_ts: bool,
    snapshot: RwLock<Option<Snapshot>>,
    ignore_prepare: bool,
    writes: Mutex<Vec<Arc<Update>>>,
    /// Refs this transaction fast-deleted; resolved at commit/abort.
    fast_deletes: Mutex<Vec<Arc<crate::btree::refs::PageRef>>>,
    state: AtomicU8,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn read_timestamp(&self) -> Option<Timestamp> {
        if self.has_read_ts {
            Some(self.read_ts)
        } else {
            None
        }
    }

    pub fn ignore_prepare(&self) -> bool {
        self.ignore_prepare
    }

    pub fn set_ignore_prepare(&mut self, ignore: bool) {
        self.ignore_prepare = ignore;
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == TXN_STATE_ACTIVE
    }

    pub fn is_prepared(&self) -> bool {
        self.state.load(Ordering::Acquire) == TXN_STATE_PREPARED
    }

    /// Refresh the snapshot for read-committed isolation. A no-op for
    /// snapshot isolation.
    pub fn refresh_snapshot(&self) {
        if self.isolation != Isolation::ReadCommitted {
            return;
        }
        let inner = self.global.inner.lock().unwrap();
        let snap_max = self.global.next_id.load(Ordering::SeqCst);
        let snap = TxnGlobal::take_snapshot(&inner, snap_max);
        drop(inner);
        *self.snapshot.wl() = Some(snap);
    }

    /// Is the given transaction id visible: committed within this
    /// transaction's snapshot, or this transaction's own id.
    pub fn txn_visible(&self, id: TxnId) -> bool {
        if id == TXN_NONE {
            return true;
        }
        if id == TXN_ABORTED {
            return false;
        }
        if id == self.id {
            return true;
        }
        match self.snapshot.rl().as_ref() {
            Some(snap) => !snap.contains(id),
            None => self.global.is_committed(id),
        }
    }

    fn ts_visible(&self, ts: Timestamp) -> bool {
        !self.has_read_ts || ts == TS_NONE || ts <= self.read_ts
    }

    /// Visibility of an in-memory update: its transaction must be in the
    /// committed set of our snapshot and its commit timestamp at or
    /// before our read timestamp. Prepare conflicts are the caller's
    /// business, this only answers "visible or not".
    pub fn upd_visible(&self, upd: &Update) -> bool {
        if upd.is_aborted() {
            return false;
        }
        if upd.txn_id == self.id {
            return true;
        }
        if !self.txn_visible(upd.txn_id) {
            return false;
        }
        self.ts_visible(upd.start_ts())
    }

    /// Visibility of an on-page value through its time window: the start
    /// must be visible and no visible stop may exist.
    pub fn tw_visible(&self, tw: &TimeWindow) -> OnPageVisibility {
        let start_visible = self.txn_visible(tw.start_txn) && self.ts_visible(tw.start_ts);
        if !start_visible {
            return OnPageVisibility::NotVisible;
        }
        if tw.has_stop() && self.txn_visible(tw.stop_txn) && self.ts_visible(tw.stop_ts) {
            return OnPageVisibility::Deleted;
        }
        OnPageVisibility::Visible
    }

    pub(crate) fn remember_write(&self, upd: &Arc<Update>) {
        self.writes.lock().unwrap().push(Arc::clone(upd));
    }

    pub(crate) fn remember_fast_delete(&self, r: &Arc<crate::btree::refs::PageRef>) {
        self.fast_deletes.lock().unwrap().push(Arc::clone(r));
    }

    pub fn prepare(&self, prepare_ts: Timestamp) -> CoreResult {
        if !self.is_active() {
            return Err(Error::invalid("prepare on a finished transaction"));
        }
        if prepare_ts == TS_NONE {
            return Err(Error::invalid("prepare requires a timestamp"));
        }
        for upd in self.writes.lock().unwrap().iter() {
            upd.set_prepared(prepare_ts);
        }
        self.global.mark_prepared(self.id);
        self.state.store(TXN_STATE_PREPARED, Ordering::Release);
        debug!("txn prepared, id: {}, prepare_ts: {}", self.id, prepare_ts);
        Ok(())
    }

    /// Commit, stamping every update with the commit and durable
    /// timestamps before the transaction becomes visible to others.
    pub fn commit(&self, commit_ts: Option<Timestamp>) -> CoreResult {
        self.commit_with_durable(commit_ts, commit_ts)
    }

    pub fn commit_with_durable(
        &self,
        commit_ts: Option<Timestamp>,
        durable_ts: Option<Timestamp>,
    ) -> CoreResult {
        let state = self.state.load(Ordering::Acquire);
        if state != TXN_STATE_ACTIVE && state != TXN_STATE_PREPARED {
            return Err(Error::invalid("commit on a finished transaction"));
        }
        if state == TXN_STATE_PREPARED && commit_ts.is_none() {
            return Err(Error::invalid("prepared transaction requires a commit timestamp"));
        }

        let commit_ts = commit_ts.unwrap_or(TS_NONE);
        let durable_ts = std::cmp::max(durable_ts.unwrap_or(commit_ts), commit_ts);

        for upd in self.writes.lock().unwrap().iter() {
            upd.commit(commit_ts, durable_ts);
        }
        for r in self.fast_deletes.lock().unwrap().iter() {
            if let Some(mut del) = r.page_del() {
                del.ts = commit_ts;
                del.durable_ts = durable_ts;
                r.set_page_del(Some(del));
            }
        }

        self.global.finish(self.id, TxnState::Committed);
        self.state.store(TXN_STATE_COMMITTED, Ordering::Release);

        if durable_ts > self.global.durable_timestamp() {
            self.global.set_durable_timestamp(durable_ts);
        }

        debug!(
            "txn commit, id: {}, commit_ts: {}, durable_ts: {}",
            self.id, commit_ts, durable_ts
        );
        Ok(())
    }

    pub fn abort(&self) -> CoreResult {
        let state = self.state.load(Ordering::Acquire);
        if state != TXN_STATE_ACTIVE && state != TXN_STATE_PREPARED {
            return Err(Error::invalid("abort on a finished transaction"));
        }

        for upd in self.writes.lock().unwrap().iter() {
            upd.abort();
        }
        for r in self.fast_deletes.lock().unwrap().iter() {
            // the subtree is still intact on disk, drop the marker
            r.set_page_del(None);
            r.cas_state(crate::btree::refs::RefState::Deleted, crate::btree::refs::RefState::Disk);
        }

        self.global.finish(self.id, TxnState::Aborted);
        self.state.store(TXN_STATE_ABORTED, Ordering::Release);
        debug!("txn abort, id: {}", self.id);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnPageVisibility {
    Visible,
    NotVisible,
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_isolation_basic() {
        let global = Arc::new(TxnGlobal::new());

        let writer = global.begin(None, Isolation::Snapshot);
        let reader_before = global.begin(None, Isolation::Snapshot);

        // the reader's snapshot was taken while the writer was active
        assert!(!reader_before.txn_visible(writer.id()));

        writer.commit(Some(10)).unwrap();
        assert!(!reader_before.txn_visible(writer.id()));

        let reader_after = global.begin(None, Isolation::Snapshot);
        assert!(reader_after.txn_visible(writer.id()));

        reader_before.abort().unwrap();
        reader_after.abort().unwrap();
    }

    #[test]
    fn test_read_timestamp_filters() {
        let global = Arc::new(TxnGlobal::new());

        let writer = global.begin(None, Isolation::Snapshot);
        let id = writer.id();
        writer.commit(Some(10)).unwrap();

        let upd = Update::new(
            id,
            crate::btree::update::UpdateType::Standard,
            bytes::Bytes::from_static(b"v"),
            None,
        );
        upd.commit(10, 10);

        let early = global.begin(Some(5), Isolation::Snapshot);
        assert!(!early.upd_visible(&upd));
        early.abort().unwrap();

        let late = global.begin(Some(10), Isolation::Snapshot);
        assert!(late.upd_visible(&upd));
        late.abort().unwrap();
    }

    #[test]
    fn test_active_count_ignores_prepared() {
        let global = Arc::new(TxnGlobal::new());
        let t = global.begin(None, Isolation::Snapshot);
        assert_eq!(global.active_count(), 1);
        t.prepare(5).unwrap();
        assert_eq!(global.active_count(), 0);
        t.commit(Some(7)).unwrap();
    }
}
