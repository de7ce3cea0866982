mod common;

use common::*;
use tamarack::{truncate, RollbackOptions};

// Truncate a key range, then roll back to a stable timestamp before the
// truncate: the range reappears.
#[test]
fn test_truncate_then_rollback() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    for k in [b"a", b"b", b"c", b"d", b"e"] {
        insert_commit(&session, &mut cursor, k, b"v", 10);
    }

    let txn = session.begin(None);
    let mut start = session.open_cursor(&tree);
    start.set_key(b"b");
    let mut stop = session.open_cursor(&tree);
    stop.set_key(b"d");
    truncate(&tree, &txn, &mut start, &mut stop).unwrap();
    txn.commit(Some(20)).unwrap();
    drop(start);
    drop(stop);
    cursor.reset();

    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys, vec![b"a".to_vec(), b"e".to_vec()]);

    conn.set_stable_timestamp(15);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();

    let mut cursor = session.open_cursor(&tree);
    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(
        keys,
        vec![
            b"a".to_vec(),
            b"b".to_vec(),
            b"c".to_vec(),
            b"d".to_vec(),
            b"e".to_vec()
        ]
    );
}

#[test]
fn test_truncate_respects_snapshots() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    for k in [b"a", b"b", b"c"] {
        insert_commit(&session, &mut cursor, k, b"v", 10);
    }
    cursor.reset();

    // a reader whose snapshot predates the truncate keeps seeing the
    // range
    let reader = session.begin(None);

    let txn = session.begin(None);
    let mut start = session.open_cursor(&tree);
    start.set_key(b"a");
    let mut stop = session.open_cursor(&tree);
    stop.set_key(b"c");
    truncate(&tree, &txn, &mut start, &mut stop).unwrap();
    txn.commit(Some(20)).unwrap();

    let mut rc = session.open_cursor(&tree);
    rc.set_key(b"b");
    rc.search(&reader).unwrap();
    assert_eq!(rc.value().as_ref(), b"v");
    reader.abort().unwrap();

    let mut cursor = session.open_cursor(&tree);
    assert!(scan_keys(&session, &mut cursor, None).is_empty());
}

// Fixed-length column stores leave implicitly-zero records alone.
#[test]
fn test_flcs_truncate_skips_implicit_zeros() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree(
            "flcs",
            tamarack::PageType::ColFixLeaf,
            tamarack::BtreeConfig::default(),
        )
        .unwrap();
    let mut cursor = session.open_cursor(&tree);
    cursor.overwrite = true;

    // records 1..=10 exist; only 3 and 7 are non-zero
    let txn = session.begin(None);
    cursor.set_recno(10);
    cursor.set_value(&[0]);
    cursor.insert(&txn).unwrap();
    cursor.set_recno(3);
    cursor.set_value(&[3]);
    cursor.insert(&txn).unwrap();
    cursor.set_recno(7);
    cursor.set_value(&[7]);
    cursor.insert(&txn).unwrap();
    txn.commit(Some(10)).unwrap();

    let txn = session.begin(None);
    let mut start = session.open_cursor(&tree);
    start.set_recno(1);
    let mut stop = session.open_cursor(&tree);
    stop.set_recno(10);
    truncate(&tree, &txn, &mut start, &mut stop).unwrap();
    txn.commit(Some(20)).unwrap();

    // everything reads as zero afterwards
    let txn = session.begin(None);
    for recno in 1..=10u64 {
        cursor.set_recno(recno);
        cursor.search(&txn).unwrap();
        assert_eq!(cursor.value().as_ref(), &[0u8]);
    }
    txn.abort().unwrap();
}

// An unstable fast-delete record is cleared by rollback-to-stable
// without the pages ever being read: the on-disk subtree is restored
// wholesale.
#[test]
fn test_fast_delete_cleared_without_reading() {
    let conn = setup();
    let session = conn.open_session();
    let tree = small_row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    let count = 2000;
    for i in 0..count {
        insert_commit(
            &session,
            &mut cursor,
            format!("k{:05}", i).as_bytes(),
            b"v",
            10,
        );
    }
    cursor.reset();
    conn.evict_tree(&tree).unwrap();

    let txn = session.begin(None);
    let mut start = session.open_cursor(&tree);
    start.set_key(b"k00100");
    let mut stop = session.open_cursor(&tree);
    stop.set_key(b"k01900");
    truncate(&tree, &txn, &mut start, &mut stop).unwrap();
    txn.commit(Some(20)).unwrap();

    // roll back before touching any of the deleted subtrees
    conn.set_stable_timestamp(15);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();

    let mut cursor = session.open_cursor(&tree);
    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys.len(), count);
}

// Fast truncate: fully-contained on-disk subtrees are marked deleted
// without being read, and an unstable fast-delete is cleared by
// rollback-to-stable.
#[test]
fn test_fast_truncate_and_rollback() {
    let conn = setup();
    let session = conn.open_session();
    let tree = small_row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    let count = 2000;
    for i in 0..count {
        insert_commit(
            &session,
            &mut cursor,
            format!("k{:05}", i).as_bytes(),
            b"v",
            10,
        );
    }
    cursor.reset();
    conn.evict_tree(&tree).unwrap();

    let txn = session.begin(None);
    let mut start = session.open_cursor(&tree);
    start.set_key(b"k00100");
    let mut stop = session.open_cursor(&tree);
    stop.set_key(b"k01900");
    truncate(&tree, &txn, &mut start, &mut stop).unwrap();
    txn.commit(Some(20)).unwrap();

    let mut cursor = session.open_cursor(&tree);
    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys.len(), count - (1900 - 100 + 1));

    // roll the truncate back
    conn.set_stable_timestamp(15);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();

    let mut cursor = session.open_cursor(&tree);
    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys.len(), count);
}
