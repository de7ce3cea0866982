//! The history store: a secondary B-tree holding prior versions of
//! records, keyed by (btree id, user key, start timestamp, counter).
//!
//! Entries for one (btree id, key) form a chronological chain: each
//! record's stop matches the next record's start. Writes flow only
//! through reconciliation and rollback-to-stable.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use log::debug;

use crate::{
    btree::{
        cursor::Cursor,
        insert_list::InsertKey,
        update::{modify_apply, modify_decode},
        BTree,
    },
    error::Error,
    io::{read_into, read_sized, SmallWriter},
    stats,
    txn::{Isolation, TxnGlobal},
    types::{CoreResult, Timestamp, TreeResult},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HsType {
    /// Full value payload.
    Standard = 0,
    /// Reverse delta against the next older full value.
    Modify = 1,
    /// The key was deleted over this interval.
    Tombstone = 2,
}

impl HsType {
    fn from_u8(v: u8) -> TreeResult<Self> {
        Ok(match v {
            0 => HsType::Standard,
            1 => HsType::Modify,
            2 => HsType::Tombstone,
            _ => return Err(Error::corruption("bad history-store record type")),
        })
    }
}

/// A decoded history-store record.
#[derive(Clone, Debug)]
pub struct HsRecord {
    pub stop_durable_ts: Timestamp,
    pub durable_ts: Timestamp,
    pub hs_type: HsType,
    pub payload: Bytes,
}

/// Map a tree's key into the byte string stored inside HS keys: row
/// keys verbatim, record numbers big-endian so byte order matches
/// numeric order.
pub fn user_key_bytes(key: &InsertKey) -> Vec<u8> {
    match key {
        InsertKey::Row(k) => k.clone(),
        InsertKey::Recno(r) => r.to_be_bytes().to_vec(),
    }
}

/// Encode an HS key so plain byte comparison sorts by (btree id, user
/// key, start_ts, counter). The variable-length user key is
/// escape-terminated: 0x00 bytes become 0x00 0xFF, the key ends with
/// 0x00 0x00, which sorts before any continuation.
pub fn encode_hs_key(btree_id: u32, user_key: &[u8], start_ts: Timestamp, counter: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(user_key.len() + 24);
    out.extend_from_slice(&btree_id.to_be_bytes());
    for b in user_key {
        if *b == 0 {
            out.push(0);
            out.push(0xFF);
        } else {
            out.push(*b);
        }
    }
    out.push(0);
    out.push(0);
    out.extend_from_slice(&start_ts.to_be_bytes());
    out.extend_from_slice(&counter.to_be_bytes());
    out
}

pub fn decode_hs_key(key: &[u8]) -> TreeResult<(u32, Vec<u8>, Timestamp, u64)> {
    if key.len() < 4 + 2 + 16 {
        return Err(Error::corruption("history-store key too short"));
    }
    let btree_id = u32::from_be_bytes(key[..4].try_into().unwrap());

    let mut user_key = Vec::new();
    let mut i = 4;
    loop {
        if i + 1 >= key.len() {
            return Err(Error::corruption("unterminated history-store key"));
        }
        match (key[i], key[i + 1]) {
            (0, 0) => {
                i += 2;
                break;
            }
            (0, 0xFF) => {
                user_key.push(0);
                i += 2;
            }
            (b, _) => {
                user_key.push(b);
                i += 1;
            }
        }
    }
    if key.len() - i != 16 {
        return Err(Error::corruption("bad history-store key suffix"));
    }
    let start_ts = Timestamp::from_be_bytes(key[i..i + 8].try_into().unwrap());
    let counter = u64::from_be_bytes(key[i + 8..i + 16].try_into().unwrap());
    Ok((btree_id, user_key, start_ts, counter))
}

fn encode_hs_value(rec: &HsRecord) -> Vec<u8> {
    let mut w = SmallWriter::new();
    w.write(&rec.stop_durable_ts);
    w.write(&rec.durable_ts);
    w.write(&(rec.hs_type as u8));
    w.write_sized(&rec.payload);
    w.to_bytes()
}

fn decode_hs_value(value: &[u8]) -> TreeResult<HsRecord> {
    let mut reader = std::io::Cursor::new(value);
    let stop_durable_ts: Timestamp = read_into(&mut reader);
    let durable_ts: Timestamp = read_into(&mut reader);
    let type_byte: u8 = read_into(&mut reader);
    let payload = Bytes::from(read_sized(&mut reader));
    Ok(HsRecord {
        stop_durable_ts,
        durable_ts,
        hs_type: HsType::from_u8(type_byte)?,
        payload,
    })
}

/// A fully resolved version recovered from the history store.
pub struct HsVersion {
    pub start_ts: Timestamp,
    pub durable_ts: Timestamp,
    pub stop_durable_ts: Timestamp,
    /// None for a tombstone interval.
    pub value: Option<Bytes>,
}

pub struct HistoryStore {
    tree: Arc<BTree>,
    txn_global: Arc<TxnGlobal>,
    counter: AtomicU64,
}

impl HistoryStore {
    pub fn new(tree: Arc<BTree>, txn_global: Arc<TxnGlobal>) -> Self {
        Self {
            tree,
            txn_global,
            counter: AtomicU64::new(1),
        }
    }

    pub fn tree(&self) -> &Arc<BTree> {
        &self.tree
    }

    /// Insert one prior version. Callers are responsible for squashing
    /// redundant versions before calling.
    pub fn insert(
        &self,
        btree_id: u32,
        user_key: &InsertKey,
        start_ts: Timestamp,
        rec: HsRecord,
    ) -> CoreResult {
        let counter = self.counter.fetch_add(1, Ordering::AcqRel);
        let key = encode_hs_key(btree_id, &user_key_bytes(user_key), start_ts, counter);
        let value = encode_hs_value(&rec);

        let txn = self.txn_global.begin(None, Isolation::Snapshot);
        let mut cursor = Cursor::new(Arc::clone(&self.tree));
        cursor.overwrite = true;
        cursor.set_key(&key);
        cursor.set_value(&value);
        let result = cursor.insert(&txn);
        match result {
            Ok(()) => {
                txn.commit(None)?;
                stats::incr(&self.tree.stats.hs_insert);
                debug!(
                    "hs insert, btree: {}, start_ts: {}, counter: {}, type: {:?}",
                    btree_id, start_ts, counter, rec.hs_type
                );
                Ok(())
            }
            Err(e) => {
                let _ = txn.abort();
                Err(e)
            }
        }
    }

    /// Collect every (start_ts, counter, record) for one user key, in
    /// chronological order.
    fn key_versions(
        &self,
        btree_id: u32,
        user_key: &[u8],
    ) -> TreeResult<Vec<(Timestamp, u64, HsRecord)>> {
        let txn = self.txn_global.begin(None, Isolation::Snapshot);
        let mut cursor = Cursor::new(Arc::clone(&self.tree));

        let lo = encode_hs_key(btree_id, user_key, 0, 0);
        let mut out = Vec::new();

        cursor.set_key(&lo);
        let mut positioned = match cursor.search_near(&txn) {
            Ok(cmp) if cmp >= 0 => true,
            Ok(_) => cursor.next(&txn).is_ok(),
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                let _ = txn.abort();
                return Err(e);
            }
        };

        while positioned {
            let (id, key, start_ts, counter) = decode_hs_key(cursor.key())?;
            if id != btree_id || key != user_key {
                break;
            }
            out.push((start_ts, counter, decode_hs_value(cursor.value())?));
            positioned = cursor.next(&txn).is_ok();
        }

        let _ = txn.abort();
        Ok(out)
    }

    /// Point-in-time read: the version visible at `read_ts`. Modify
    /// entries accumulate onto the first older standard value.
    pub fn read(
        &self,
        btree_id: u32,
        user_key: &InsertKey,
        read_ts: Timestamp,
    ) -> TreeResult<Option<HsVersion>> {
        stats::incr(&self.tree.stats.hs_read);
        let versions = self.key_versions(btree_id, &user_key_bytes(user_key))?;

        // newest version starting at or before the read timestamp
        let idx = match versions
            .iter()
            .rposition(|(start_ts, _, _)| *start_ts <= read_ts)
        {
            Some(i) => i,
            None => return Ok(None),
        };

        self.resolve_version(&versions, idx)
    }

    /// Newest version whose content is stable at `stable_ts`: both its
    /// start and its durable timestamp at or below the stable point.
    pub fn newest_stable(
        &self,
        btree_id: u32,
        user_key: &InsertKey,
        stable_ts: Timestamp,
    ) -> TreeResult<Option<HsVersion>> {
        let versions = self.key_versions(btree_id, &user_key_bytes(user_key))?;
        let idx = match versions
            .iter()
            .rposition(|(start_ts, _, rec)| *start_ts <= stable_ts && rec.durable_ts <= stable_ts)
        {
            Some(i) => i,
            None => return Ok(None),
        };
        self.resolve_version(&versions, idx)
    }

    fn resolve_version(
        &self,
        versions: &[(Timestamp, u64, HsRecord)],
        idx: usize,
    ) -> TreeResult<Option<HsVersion>> {
        let (start_ts, _, rec) = &versions[idx];

        match rec.hs_type {
            HsType::Tombstone => Ok(Some(HsVersion {
                start_ts: *start_ts,
                durable_ts: rec.durable_ts,
                stop_durable_ts: rec.stop_durable_ts,
                value: None,
            })),
            HsType::Standard => Ok(Some(HsVersion {
                start_ts: *start_ts,
                durable_ts: rec.durable_ts,
                stop_durable_ts: rec.stop_durable_ts,
                value: Some(rec.payload.clone()),
            })),
            HsType::Modify => {
                // walk backward to the first standard value, applying
                // the deltas forward from there
                let mut base_idx = idx;
                loop {
                    if base_idx == 0 {
                        return Err(Error::corruption(
                            "history-store modify chain has no base value",
                        ));
                    }
                    base_idx -= 1;
                    match versions[base_idx].2.hs_type {
                        HsType::Standard => break,
                        HsType::Modify => {
                            stats::incr(&self.tree.stats.hs_read_squash);
                        }
                        HsType::Tombstone => {
                            return Err(Error::corruption(
                                "history-store modify chained over a tombstone",
                            ))
                        }
                    }
                }

                let mut value = versions[base_idx].2.payload.to_vec();
                for (_, _, step) in &versions[base_idx + 1..=idx] {
                    if step.hs_type == HsType::Modify {
                        let ops = modify_decode(&step.payload)?;
                        value = modify_apply(&value, &ops);
                    }
                }
                Ok(Some(HsVersion {
                    start_ts: *start_ts,
                    durable_ts: rec.durable_ts,
                    stop_durable_ts: rec.stop_durable_ts,
                    value: Some(Bytes::from(value)),
                }))
            }
        }
    }

    /// Remove every entry for a key. Used when a zero-timestamp write
    /// made the whole history redundant.
    pub fn delete_key(&self, btree_id: u32, user_key: &InsertKey) -> CoreResult {
        self.delete_from(btree_id, user_key, 0)
    }

    /// Remove entries with start_ts at or above the given timestamp.
    pub fn delete_from(
        &self,
        btree_id: u32,
        user_key: &InsertKey,
        start_ts: Timestamp,
    ) -> CoreResult {
        let key_bytes = user_key_bytes(user_key);
        let versions = self.key_versions(btree_id, &key_bytes)?;

        let txn = self.txn_global.begin(None, Isolation::Snapshot);
        let mut cursor = Cursor::new(Arc::clone(&self.tree));
        cursor.overwrite = true;

        let mut removed = 0usize;
        for (ts, counter, _) in versions.iter().filter(|(ts, _, _)| *ts >= start_ts) {
            cursor.set_key(&encode_hs_key(btree_id, &key_bytes, *ts, *counter));
            match cursor.remove(&txn) {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let _ = txn.abort();
                    return Err(e);
                }
            }
        }
        txn.commit(None)?;

        if removed > 0 {
            stats::incr(&self.tree.stats.hs_remove_key);
            debug!(
                "hs delete, btree: {}, start_ts >= {}, removed: {}",
                btree_id, start_ts, removed
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hs_key_ordering() {
        // same key: ordered by timestamp then counter
        let a = encode_hs_key(1, b"k", 5, 1);
        let b = encode_hs_key(1, b"k", 10, 1);
        let c = encode_hs_key(1, b"k", 10, 2);
        assert!(a < b && b < c);

        // key order dominates timestamps
        let d = encode_hs_key(1, b"ka", 1, 0);
        assert!(c < d);

        // a key that is a prefix of another sorts first
        let e = encode_hs_key(1, b"kaa", 0, 0);
        assert!(d < e);

        // btree id dominates everything
        let f = encode_hs_key(2, b"a", 0, 0);
        assert!(e < f);
    }

    #[test]
    fn test_hs_key_escaping_round_trip() {
        let cases: Vec<&[u8]> = vec![b"plain", b"with\0nul", b"\0", b""];
        for key in cases {
            let encoded = encode_hs_key(7, key, 42, 9);
            let (id, decoded, ts, counter) = decode_hs_key(&encoded).unwrap();
            assert_eq!(id, 7);
            assert_eq!(decoded, key);
            assert_eq!(ts, 42);
            assert_eq!(counter, 9);
        }
    }

    #[test]
    fn test_hs_nul_key_ordering() {
        // "a\0b" must sort before "a\x01"
        let a = encode_hs_key(1, b"a\0b", 0, 0);
        let b = encode_hs_key(1, b"a\x01", 0, 0);
        assert!(a < b);
    }

    #[test]
    fn test_hs_value_round_trip() {
        let rec = HsRecord {
            stop_durable_ts: 20,
            durable_ts: 10,
            hs_type: HsType::Modify,
            payload: Bytes::from_static(b"delta"),
        };
        let encoded = encode_hs_value(&rec);
        let decoded = decode_hs_value(&encoded).unwrap();
        assert_eq!(decoded.stop_durable_ts, 20);
        assert_eq!(decoded.durable_ts, 10);
        assert_eq!(decoded.hs_type, HsType::Modify);
        assert_eq!(decoded.payload, Bytes::from_static(b"delta"));
    }
}
