mod common;

use bytes::Bytes;
use common::*;
use tamarack::ModifyOp;

// Build a three-version modify chain, force reconciliation so the two
// older versions spill to the history store, then read at timestamps
// landing on each version.
#[test]
fn test_hs_read_through_modify_chain() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"ABCDE", 10);

    let txn = session.begin(None);
    cursor.set_key(b"k");
    cursor
        .modify(
            &txn,
            &[ModifyOp {
                offset: 1,
                size: 1,
                data: Bytes::from_static(b"x"),
            }],
        )
        .unwrap();
    txn.commit(Some(20)).unwrap();

    let txn = session.begin(None);
    cursor.set_key(b"k");
    cursor
        .modify(
            &txn,
            &[ModifyOp {
                offset: 3,
                size: 1,
                data: Bytes::from_static(b"y"),
            }],
        )
        .unwrap();
    txn.commit(Some(30)).unwrap();
    cursor.reset();

    // reconciliation keeps ts=30 on the page and spills ts=10 and
    // ts=20 to the history store
    conn.evict_tree(&tree).unwrap();
    assert!(tamarack::stats::get(&conn.stats().hs_insert) >= 2);

    let mut cursor = session.open_cursor(&tree);
    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(15)),
        Some(b"ABCDE".to_vec())
    );
    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(25)),
        Some(b"AxCDE".to_vec())
    );
    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(35)),
        Some(b"AxCyE".to_vec())
    );
}

#[test]
fn test_hs_serves_overwritten_standard_values() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"v10", 10);
    insert_commit(&session, &mut cursor, b"k", b"v20", 20);
    insert_commit(&session, &mut cursor, b"k", b"v30", 30);
    cursor.reset();

    conn.evict_tree(&tree).unwrap();

    let mut cursor = session.open_cursor(&tree);
    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(10)),
        Some(b"v10".to_vec())
    );
    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(29)),
        Some(b"v20".to_vec())
    );
    assert_eq!(
        read_at(&session, &mut cursor, b"k", None),
        Some(b"v30".to_vec())
    );
    assert_eq!(read_at(&session, &mut cursor, b"k", Some(5)), None);
}

// The history store's chronological chain: each record's stop matches
// the next record's start.
#[test]
fn test_hs_chain_invariant() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    for (ts, value) in [(10u64, "a"), (20, "b"), (30, "c"), (40, "d")] {
        insert_commit(&session, &mut cursor, b"k", value.as_bytes(), ts);
    }
    cursor.reset();
    conn.evict_tree(&tree).unwrap();

    let hs = conn.history_store();
    let mut stops = Vec::new();
    let mut starts = Vec::new();
    for ts in [10u64, 20, 30] {
        let version = hs
            .read(tree.id, &tamarack::btree::insert_list::InsertKey::Row(b"k".to_vec()), ts)
            .unwrap()
            .unwrap();
        starts.push(version.start_ts);
        stops.push(version.stop_durable_ts);
    }
    assert_eq!(starts, vec![10, 20, 30]);
    // each version stops where the next one starts
    assert_eq!(stops, vec![20, 30, 40]);
}

// A non-timestamped overwrite invalidates the key's history: the next
// reconciliation removes the stale entries.
#[test]
fn test_hs_delete_key_on_zero_timestamp_write() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"v10", 10);
    insert_commit(&session, &mut cursor, b"k", b"v20", 20);
    cursor.reset();
    conn.evict_tree(&tree).unwrap();
    assert!(tamarack::stats::get(&conn.stats().hs_insert) >= 1);

    // zero-timestamp write
    let txn = session.begin(None);
    let mut cursor = session.open_cursor(&tree);
    cursor.overwrite = true;
    cursor.set_key(b"k");
    cursor.set_value(b"nots");
    cursor.insert(&txn).unwrap();
    txn.commit(None).unwrap();
    cursor.reset();

    conn.evict_tree(&tree).unwrap();
    assert!(tamarack::stats::get(&conn.stats().hs_remove_key) >= 1);

    let hs = conn.history_store();
    let version = hs
        .read(tree.id, &tamarack::btree::insert_list::InsertKey::Row(b"k".to_vec()), 15)
        .unwrap();
    assert!(version.is_none());
}

#[test]
fn test_hs_write_squash_counted() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    // two updates in one transaction share (start_ts, txn): the older
    // one is redundant next to the on-page value
    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_key(b"k");
    cursor.set_value(b"first");
    cursor.insert(&txn).unwrap();
    cursor.set_key(b"k");
    cursor.set_value(b"second");
    cursor.insert(&txn).unwrap();
    txn.commit(Some(10)).unwrap();
    cursor.reset();

    conn.evict_tree(&tree).unwrap();
    assert!(tamarack::stats::get(&conn.stats().hs_write_squash) >= 1);
}
