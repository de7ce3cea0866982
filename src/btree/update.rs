use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    error::Error,
    io::{read_exact, read_into, Encodeable, SmallWriter},
    txn::Transaction,
    types::{Timestamp, TreeResult, TxnId, TS_MAX, TS_NONE, TXN_NONE},
    utils::HandyRwLock,
};

/// Time window attached to a persisted key/value.
///
/// A missing stop (stop_ts == TS_MAX) means "still live". Invariants:
/// start_ts <= stop_ts when both are set, durable_start_ts >= start_ts,
/// and commit timestamps may be absent while prepare is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ts: Timestamp,
    pub start_txn: TxnId,
    pub durable_start_ts: Timestamp,
    pub stop_ts: Timestamp,
    pub stop_txn: TxnId,
    pub durable_stop_ts: Timestamp,
    pub prepare: bool,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start_ts: TS_NONE,
            start_txn: TXN_NONE,
            durable_start_ts: TS_NONE,
            stop_ts: TS_MAX,
            stop_txn: TXN_NONE,
            durable_stop_ts: TS_NONE,
            prepare: false,
        }
    }
}

impl TimeWindow {
    pub fn has_stop(&self) -> bool {
        self.stop_ts != TS_MAX || self.stop_txn != TXN_NONE
    }

    /// The newest durable timestamp carried by this window, used by the
    /// stability checks in rollback-to-stable.
    pub fn newest_durable_ts(&self) -> Timestamp {
        if self.has_stop() {
            std::cmp::max(self.durable_start_ts, self.durable_stop_ts)
        } else {
            self.durable_start_ts
        }
    }

    pub fn is_stable(&self, stable_ts: Timestamp) -> bool {
        !self.prepare && self.newest_durable_ts() <= stable_ts
    }
}

impl Encodeable for TimeWindow {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&self.start_ts);
        w.write(&self.start_txn);
        w.write(&self.durable_start_ts);
        w.write(&self.stop_ts);
        w.write(&self.stop_txn);
        w.write(&self.durable_stop_ts);
        w.write(&self.prepare);
        w.to_bytes()
    }
}

impl TimeWindow {
    pub fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        Self {
            start_ts: read_into(reader),
            start_txn: read_into(reader),
            durable_start_ts: read_into(reader),
            stop_ts: read_into(reader),
            stop_txn: read_into(reader),
            durable_stop_ts: read_into(reader),
            prepare: read_into(reader),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateType {
    Standard,
    Modify,
    Tombstone,
    /// A write intent with no value, blocks concurrent writers.
    Reserve,
    /// Marks a value whose content lives in the history store.
    Birthmark,
}

impl UpdateType {
    pub fn as_u8(self) -> u8 {
        match self {
            UpdateType::Standard => 0,
            UpdateType::Modify => 1,
            UpdateType::Tombstone => 2,
            UpdateType::Reserve => 3,
            UpdateType::Birthmark => 4,
        }
    }

    pub fn from_u8(v: u8) -> TreeResult<Self> {
        Ok(match v {
            0 => UpdateType::Standard,
            1 => UpdateType::Modify,
            2 => UpdateType::Tombstone,
            3 => UpdateType::Reserve,
            4 => UpdateType::Birthmark,
            _ => return Err(Error::corruption("bad update type byte")),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PrepareState {
    None = 0,
    InProgress = 1,
    Resolved = 2,
}

impl PrepareState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PrepareState::InProgress,
            2 => PrepareState::Resolved,
            _ => PrepareState::None,
        }
    }
}

pub const UPD_COMMITTED: u8 = 0x01;
pub const UPD_ABORTED: u8 = 0x02;
/// An older version of this update has been written to the history store.
pub const UPD_HS_SPILLED: u8 = 0x04;
pub const UPD_RESTORED_FROM_HS: u8 = 0x08;

/// A versioned record in an update chain. The chain is a singly-linked
/// list with the newest update at the head; the tail implicitly refers to
/// the on-page (base) value.
///
/// `next` is fixed at allocation, before the update is published to the
/// chain head, so readers traverse without locks once they hold the head.
#[derive(Debug)]
pub struct Update {
    pub txn_id: TxnId,
    start_ts: AtomicU64,
    durable_ts: AtomicU64,
    prepare: AtomicU8,
    flags: AtomicU8,
    pub utype: UpdateType,
    pub data: Bytes,
    pub next: Option<Arc<Update>>,
}

impl Update {
    pub fn new(txn_id: TxnId, utype: UpdateType, data: Bytes, next: Option<Arc<Update>>) -> Self {
        Self {
            txn_id,
            start_ts: AtomicU64::new(TS_NONE),
            durable_ts: AtomicU64::new(TS_NONE),
            prepare: AtomicU8::new(PrepareState::None as u8),
            flags: AtomicU8::new(0),
            utype,
            data,
            next,
        }
    }

    pub fn size(&self) -> usize {
        std::mem::size_of::<Update>() + self.data.len()
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts.load(Ordering::Acquire)
    }

    pub fn durable_ts(&self) -> Timestamp {
        self.durable_ts.load(Ordering::Acquire)
    }

    pub fn prepare_state(&self) -> PrepareState {
        PrepareState::from_u8(self.prepare.load(Ordering::Acquire))
    }

    pub fn set_prepared(&self, prepare_ts: Timestamp) {
        self.start_ts.store(prepare_ts, Ordering::Release);
        self.prepare
            .store(PrepareState::InProgress as u8, Ordering::Release);
    }

    /// Publish the commit. Timestamps are stored before the committed flag
    /// so a reader that observes the flag also observes the timestamps.
    pub fn commit(&self, commit_ts: Timestamp, durable_ts: Timestamp) {
        self.start_ts.store(commit_ts, Ordering::Release);
        self.durable_ts.store(durable_ts, Ordering::Release);
        if self.prepare_state() == PrepareState::InProgress {
            self.prepare
                .store(PrepareState::Resolved as u8, Ordering::Release);
        }
        self.flags.fetch_or(UPD_COMMITTED, Ordering::Release);
    }

    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::Release);
    }

    pub fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::Release);
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn is_committed(&self) -> bool {
        self.has_flag(UPD_COMMITTED)
    }

    pub fn is_aborted(&self) -> bool {
        self.has_flag(UPD_ABORTED)
    }

    pub fn abort(&self) {
        self.flags.fetch_or(UPD_ABORTED, Ordering::Release);
    }
}

/// One reverse-delta operation: replace `size` bytes at `offset` with
/// `data` (whose length may differ from `size`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModifyOp {
    pub offset: usize,
    pub size: usize,
    pub data: Bytes,
}

pub fn modify_encode(ops: &[ModifyOp]) -> Bytes {
    let mut w = SmallWriter::new();
    w.write(&(ops.len() as u32));
    for op in ops {
        w.write(&(op.offset as u64));
        w.write(&(op.size as u64));
        w.write_sized(&op.data);
    }
    Bytes::from(w.to_bytes())
}

pub fn modify_decode(data: &[u8]) -> TreeResult<Vec<ModifyOp>> {
    let mut reader = std::io::Cursor::new(data);
    let count: u32 = read_into(&mut reader);
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset: u64 = read_into(&mut reader);
        let size: u64 = read_into(&mut reader);
        let len: u32 = read_into(&mut reader);
        let data = read_exact(&mut reader, len as usize);
        ops.push(ModifyOp {
            offset: offset as usize,
            size: size as usize,
            data: Bytes::from(data),
        });
    }
    Ok(ops)
}

/// Apply modify operations to a base value, producing the full value.
pub fn modify_apply(base: &[u8], ops: &[ModifyOp]) -> Vec<u8> {
    let mut out = base.to_vec();
    for op in ops {
        if op.offset > out.len() {
            // zero-fill the gap
            out.resize(op.offset, 0);
        }
        let start = op.offset;
        let end = std::cmp::min(op.offset + op.size, out.len());
        out.splice(start..end, op.data.iter().copied());
    }
    out
}

/// What a chain read produced.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainValue {
    /// A visible full value (materialized when modifies were involved).
    Value(Bytes),
    /// A visible tombstone, the key is deleted for this reader.
    Tombstone,
    /// Nothing in the chain is visible, consult the on-page cell.
    None,
}

/// Per-key singly-linked list of versioned updates, newest at the head.
#[derive(Debug)]
pub struct UpdateChain {
    head: RwLock<Option<Arc<Update>>>,
}

impl Default for UpdateChain {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateChain {
    pub fn new() -> Self {
        Self {
            head: RwLock::new(None),
        }
    }

    pub fn head(&self) -> Option<Arc<Update>> {
        self.head.rl().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.head.rl().is_none()
    }

    /// Replace the whole chain. Only legal with the page exclusively
    /// held (reconciliation rebuilding a page, or instantiation).
    pub fn replace(&self, head: Option<Arc<Update>>) {
        *self.head.wl() = head;
    }

    /// Check for a write conflict and, if the way is clear, prepend the
    /// new update. The check and the prepend happen under one lock so a
    /// racing writer cannot slip in between.
    ///
    /// Conflict rule: a non-aborted head update from another transaction
    /// conflicts unless that transaction was already committed within the
    /// writer's snapshot.
    pub fn check_and_prepend(
        &self,
        txn: &Transaction,
        utype: UpdateType,
        data: Bytes,
    ) -> TreeResult<Arc<Update>> {
        let mut head = self.head.wl();

        let mut next = head.clone();
        // skip aborted entries at the head, they are invisible to everyone
        while let Some(u) = next.clone() {
            if !u.is_aborted() {
                break;
            }
            next = u.next.clone();
        }

        if let Some(u) = &next {
            if u.txn_id != txn.id() {
                if u.prepare_state() == PrepareState::InProgress {
                    return Err(Error::prepare_conflict());
                }
                // a head update from a transaction not committed within
                // our snapshot conflicts, reserves included
                if !txn.txn_visible(u.txn_id) {
                    return Err(Error::write_conflict());
                }
            }
        }

        let upd = Arc::new(Update::new(txn.id(), utype, data, head.clone()));
        txn.remember_write(&upd);
        *head = Some(upd.clone());
        Ok(upd)
    }

    /// Prepend an already-resolved update outside any transaction.
    /// Used by rollback-to-stable when lifting a value back from the
    /// history store onto the leaf.
    pub fn prepend_resolved(
        &self,
        txn_id: TxnId,
        utype: UpdateType,
        data: Bytes,
        commit_ts: Timestamp,
        durable_ts: Timestamp,
    ) -> Arc<Update> {
        let mut head = self.head.wl();
        let upd = Arc::new(Update::new(txn_id, utype, data, head.clone()));
        upd.commit(commit_ts, durable_ts);
        *head = Some(upd.clone());
        upd
    }

    /// Return the newest update visible to the transaction, or None. The
    /// returned update may be a MODIFY or TOMBSTONE, callers materialize
    /// with `materialize`.
    ///
    /// Prepared updates from other transactions fail with a prepare
    /// conflict unless the session opted out.
    pub fn visible_update(&self, txn: &Transaction) -> TreeResult<Option<Arc<Update>>> {
        let head = self.head();
        let mut cur = head;
        while let Some(u) = cur {
            if u.is_aborted()
                || u.utype == UpdateType::Reserve
                || u.utype == UpdateType::Birthmark
            {
                cur = u.next.clone();
                continue;
            }

            if u.txn_id != txn.id() && u.prepare_state() == PrepareState::InProgress {
                if txn.ignore_prepare() {
                    cur = u.next.clone();
                    continue;
                }
                return Err(Error::prepare_conflict());
            }

            if txn.upd_visible(&u) {
                return Ok(Some(u));
            }
            cur = u.next.clone();
        }
        Ok(None)
    }

    /// Resolve `upd` (as returned by `visible_update`) into a value,
    /// materializing modify chains onto the first reachable standard
    /// value. When the chain bottoms out, `base` supplies the on-page
    /// value the tail implicitly references.
    ///
    /// Chains longer than `modify_chain_max` are converted to a full
    /// standard at the head to bound future reads.
    pub fn materialize(
        &self,
        upd: &Arc<Update>,
        base: Option<&Bytes>,
        modify_chain_max: usize,
    ) -> TreeResult<ChainValue> {
        match upd.utype {
            UpdateType::Standard => return Ok(ChainValue::Value(upd.data.clone())),
            UpdateType::Tombstone => return Ok(ChainValue::Tombstone),
            UpdateType::Modify => {}
            UpdateType::Reserve | UpdateType::Birthmark => {
                return Err(Error::panic("reserve/birthmark update cannot materialize"))
            }
        }

        // walk down collecting modifies until a full value is reachable
        let mut modifies: Vec<Arc<Update>> = vec![upd.clone()];
        let mut cur = upd.next.clone();
        let full: Bytes = loop {
            match cur {
                Some(u) => {
                    if u.is_aborted()
                        || u.utype == UpdateType::Reserve
                        || u.utype == UpdateType::Birthmark
                    {
                        cur = u.next.clone();
                        continue;
                    }
                    match u.utype {
                        UpdateType::Standard => break u.data.clone(),
                        UpdateType::Modify => {
                            modifies.push(u.clone());
                            cur = u.next.clone();
                        }
                        UpdateType::Tombstone => {
                            return Err(Error::corruption(
                                "modify chained onto a tombstone with no full value",
                            ))
                        }
                        _ => unreachable!(),
                    }
                }
                None => match base {
                    Some(b) => break b.clone(),
                    None => {
                        return Err(Error::corruption(
                            "modify chain bottomed out with no on-page value",
                        ))
                    }
                },
            }
        };

        // apply oldest first
        let mut value = full.to_vec();
        for m in modifies.iter().rev() {
            let ops = modify_decode(&m.data)?;
            value = modify_apply(&value, &ops);
        }
        let value = Bytes::from(value);

        // over-long chains are flattened in place; only committed heads
        // qualify, an uncommitted flatten could outlive its transaction
        if modifies.len() > modify_chain_max && upd.is_committed() {
            self.flatten_head(upd, value.clone());
        }

        Ok(ChainValue::Value(value))
    }

    /// Convert an over-long modify chain to a full standard in place: the
    /// materialized value replaces the head's payload by prepending an
    /// equivalent standard update carrying the same transactional
    /// identity.
    fn flatten_head(&self, upd: &Arc<Update>, value: Bytes) {
        let mut head = self.head.wl();
        // only flatten when the resolved update is still the chain head,
        // otherwise a newer writer got there first
        match head.as_ref() {
            Some(h) if Arc::ptr_eq(h, upd) => {}
            _ => return,
        }

        let flat = Arc::new(Update::new(
            upd.txn_id,
            UpdateType::Standard,
            value,
            head.clone(),
        ));
        flat.start_ts.store(upd.start_ts(), Ordering::Release);
        flat.durable_ts.store(upd.durable_ts(), Ordering::Release);
        flat.flags
            .store(upd.flags.load(Ordering::Acquire), Ordering::Release);
        *head = Some(flat);
    }

    /// Combined read: find the visible update and resolve it.
    pub fn read(
        &self,
        txn: &Transaction,
        base: Option<&Bytes>,
        modify_chain_max: usize,
    ) -> TreeResult<ChainValue> {
        match self.visible_update(txn)? {
            Some(upd) => self.materialize(&upd, base, modify_chain_max),
            None => Ok(ChainValue::None),
        }
    }

    /// Memory footprint of the chain, counted for split decisions.
    pub fn mem_size(&self) -> usize {
        let mut size = 0;
        let mut cur = self.head();
        while let Some(u) = cur {
            size += u.size();
            cur = u.next.clone();
        }
        size
    }
}

/// Bounded exponential backoff for split races.
pub fn backoff(attempt: u32) {
    let micros = std::cmp::min(1u64 << attempt.min(10), 1000);
    std::thread::sleep(Duration::from_micros(micros));
}
