mod common;

use common::*;
use tamarack::{ErrorKind, RollbackOptions};

// Update then rollback: the post-stable update is unwound and the older
// value is visible again at any timestamp.
#[test]
fn test_update_then_rollback() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"a", 10);
    insert_commit(&session, &mut cursor, b"k", b"b", 20);
    cursor.reset();

    conn.set_stable_timestamp(15);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();

    let mut cursor = session.open_cursor(&tree);
    assert_eq!(read_at(&session, &mut cursor, b"k", None), Some(b"a".to_vec()));
    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(u64::MAX)),
        Some(b"a".to_vec())
    );
    assert!(tamarack::stats::get(&conn.stats().rts_upd_aborted) >= 1);
}

#[test]
fn test_rollback_refuses_active_transactions() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");

    let txn = session.begin(None);
    let mut cursor = session.open_cursor(&tree);
    cursor.overwrite = true;
    cursor.set_key(b"k");
    cursor.set_value(b"v");
    cursor.insert(&txn).unwrap();

    let err = conn
        .rollback_to_stable(RollbackOptions::default())
        .unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Invalid);

    txn.abort().unwrap();
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();
}

// Rollback across an evicted page: the on-disk value is unstable, so
// the stable version is lifted back out of the history store.
#[test]
fn test_rollback_restores_from_history_store() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"stable-value", 10);
    insert_commit(&session, &mut cursor, b"k", b"unstable-value", 30);
    cursor.reset();

    // the page image now carries ts=30; ts=10 lives in the history
    // store only
    conn.evict_tree(&tree).unwrap();

    conn.set_stable_timestamp(20);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();
    assert!(tamarack::stats::get(&conn.stats().rts_hs_restored) >= 1);

    let mut cursor = session.open_cursor(&tree);
    assert_eq!(
        read_at(&session, &mut cursor, b"k", None),
        Some(b"stable-value".to_vec())
    );
    assert_eq!(read_at(&session, &mut cursor, b"k", Some(5)), None);
}

// No stable version exists anywhere: the key is removed outright.
#[test]
fn test_rollback_removes_keys_with_no_stable_version() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"v", 30);
    cursor.reset();
    conn.evict_tree(&tree).unwrap();

    conn.set_stable_timestamp(20);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();

    let mut cursor = session.open_cursor(&tree);
    assert_eq!(read_at(&session, &mut cursor, b"k", None), None);
}

// A prepared-but-unresolved transaction is aborted by rollback.
#[test]
fn test_rollback_aborts_prepared_update() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"old", 10);

    let preparer = session.begin(None);
    let mut pc = session.open_cursor(&tree);
    pc.overwrite = true;
    pc.set_key(b"k");
    pc.set_value(b"prepared");
    pc.insert(&preparer).unwrap();
    preparer.prepare(30).unwrap();
    pc.reset();
    cursor.reset();

    conn.set_stable_timestamp(20);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();

    let mut cursor = session.open_cursor(&tree);
    assert_eq!(
        read_at(&session, &mut cursor, b"k", None),
        Some(b"old".to_vec())
    );
}

// RTS is idempotent: running it twice at the same stable timestamp
// leaves the same state.
#[test]
fn test_rollback_idempotence() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"a", b"1", 10);
    insert_commit(&session, &mut cursor, b"b", b"2", 30);
    insert_commit(&session, &mut cursor, b"c", b"3", 40);
    cursor.reset();

    conn.set_stable_timestamp(20);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();
    let mut cursor = session.open_cursor(&tree);
    let first = scan_keys(&session, &mut cursor, None);

    conn.rollback_to_stable(RollbackOptions::default()).unwrap();
    let second = scan_keys(&session, &mut cursor, None);

    assert_eq!(first, vec![b"a".to_vec()]);
    assert_eq!(first, second);
}

// Dry run previews without mutating.
#[test]
fn test_rollback_dry_run() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"a", 10);
    insert_commit(&session, &mut cursor, b"k", b"b", 30);
    cursor.reset();

    conn.set_stable_timestamp(20);
    conn.rollback_to_stable(RollbackOptions { dry_run: true })
        .unwrap();

    // the unstable update was counted but not touched
    assert!(tamarack::stats::get(&conn.stats().rts_upd_aborted) >= 1);
    let mut cursor = session.open_cursor(&tree);
    assert_eq!(read_at(&session, &mut cursor, b"k", None), Some(b"b".to_vec()));
}

// The global durable timestamp is pulled back to the stable point.
#[test]
fn test_rollback_resets_durable_timestamp() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"v", 50);
    cursor.reset();
    assert_eq!(conn.txn_global().durable_timestamp(), 50);

    conn.set_stable_timestamp(20);
    conn.rollback_to_stable(RollbackOptions::default()).unwrap();
    assert_eq!(conn.txn_global().durable_timestamp(), 20);
}
