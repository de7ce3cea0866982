mod common;

use common::*;
use tamarack::{ErrorKind, Isolation};

// Insert a key at a commit timestamp, then search it at timestamps on
// both sides of the commit.
#[test]
fn test_insert_then_timestamped_search() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"apple", b"1", 10);

    assert_eq!(read_at(&session, &mut cursor, b"apple", Some(5)), None);
    assert_eq!(
        read_at(&session, &mut cursor, b"apple", Some(10)),
        Some(b"1".to_vec())
    );
    assert_eq!(
        read_at(&session, &mut cursor, b"apple", None),
        Some(b"1".to_vec())
    );
}

#[test]
fn test_duplicate_key_without_overwrite() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"v1", 10);

    let txn = session.begin(None);
    cursor.overwrite = false;
    cursor.set_key(b"k");
    cursor.set_value(b"v2");
    let err = cursor.insert(&txn).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::DuplicateKey);
    txn.abort().unwrap();

    // the failed insert restored the cursor and changed nothing
    assert_eq!(read_at(&session, &mut cursor, b"k", None), Some(b"v1".to_vec()));
}

// Remove is idempotent under overwrite semantics: removing an absent
// key succeeds, removing twice yields OK then NOTFOUND without it.
#[test]
fn test_remove_idempotence() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    // overwrite remove of a key that never existed
    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_key(b"ghost");
    cursor.remove(&txn).unwrap();
    txn.commit(None).unwrap();

    insert_commit(&session, &mut cursor, b"k", b"v", 10);
    remove_commit(&session, &mut cursor, b"k", 20);

    // second remove without overwrite reports the key is gone
    let txn = session.begin(None);
    cursor.overwrite = false;
    cursor.set_key(b"k");
    let err = cursor.remove(&txn).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::NotFound);
    txn.abort().unwrap();
}

#[test]
fn test_update_requires_existing_key() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    let txn = session.begin(None);
    cursor.overwrite = false;
    cursor.set_key(b"missing");
    cursor.set_value(b"v");
    let err = cursor.update(&txn).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::NotFound);
    txn.abort().unwrap();
}

#[test]
fn test_write_conflict() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");

    insert_commit(&session, &mut session.open_cursor(&tree), b"k", b"base", 5);

    let t1 = session.begin(None);
    let t2 = session.begin(None);

    let mut c1 = session.open_cursor(&tree);
    c1.overwrite = true;
    c1.set_key(b"k");
    c1.set_value(b"from-t1");
    c1.insert(&t1).unwrap();

    let mut c2 = session.open_cursor(&tree);
    c2.overwrite = true;
    c2.set_key(b"k");
    c2.set_value(b"from-t2");
    let err = c2.insert(&t2).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::WriteConflict);

    t1.commit(Some(10)).unwrap();
    t2.abort().unwrap();
}

#[test]
fn test_reserve_blocks_writers() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");

    insert_commit(&session, &mut session.open_cursor(&tree), b"k", b"v", 5);

    let holder = session.begin(None);
    let mut c1 = session.open_cursor(&tree);
    c1.set_key(b"k");
    c1.reserve(&holder).unwrap();

    // another writer sees the intent and fails
    let writer = session.begin(None);
    let mut c2 = session.open_cursor(&tree);
    c2.overwrite = true;
    c2.set_key(b"k");
    c2.set_value(b"w");
    let err = c2.insert(&writer).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::WriteConflict);
    writer.abort().unwrap();

    // readers skip the reservation entirely
    let reader = session.begin(None);
    let mut c3 = session.open_cursor(&tree);
    c3.set_key(b"k");
    c3.search(&reader).unwrap();
    assert_eq!(c3.value().as_ref(), b"v");
    reader.abort().unwrap();

    holder.abort().unwrap();
}

#[test]
fn test_snapshot_isolation_hides_concurrent_commit() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"old", 5);

    // the reader's snapshot predates the writer's commit
    let reader = session.begin(None);

    let writer = session.begin(None);
    let mut wc = session.open_cursor(&tree);
    wc.overwrite = true;
    wc.set_key(b"k");
    wc.set_value(b"new");
    wc.insert(&writer).unwrap();
    writer.commit(Some(10)).unwrap();

    let mut rc = session.open_cursor(&tree);
    rc.set_key(b"k");
    rc.search(&reader).unwrap();
    assert_eq!(rc.value().as_ref(), b"old");
    reader.abort().unwrap();

    // read-committed sees the new value immediately
    let rc_txn = session.begin_with(Isolation::ReadCommitted, None);
    let mut rc2 = session.open_cursor(&tree);
    rc2.set_key(b"k");
    rc2.search(&rc_txn).unwrap();
    assert_eq!(rc2.value().as_ref(), b"new");
    rc_txn.abort().unwrap();
}

#[test]
fn test_search_near_sides() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"b", b"1", 10);
    insert_commit(&session, &mut cursor, b"d", b"2", 10);

    let txn = session.begin(None);

    cursor.set_key(b"d");
    assert_eq!(cursor.search_near(&txn).unwrap(), 0);

    // between b and d: biased forward
    cursor.set_key(b"c");
    assert_eq!(cursor.search_near(&txn).unwrap(), 1);
    assert_eq!(cursor.key(), b"d");

    // past everything: only the backward side remains
    cursor.set_key(b"z");
    assert_eq!(cursor.search_near(&txn).unwrap(), -1);
    assert_eq!(cursor.key(), b"d");

    txn.abort().unwrap();
}

#[test]
fn test_prepare_conflict_surfaces() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"old", 5);

    let preparer = session.begin(None);
    let mut pc = session.open_cursor(&tree);
    pc.overwrite = true;
    pc.set_key(b"k");
    pc.set_value(b"prepared");
    pc.insert(&preparer).unwrap();
    preparer.prepare(8).unwrap();

    // a reader must fail with a prepare conflict, not skip the update
    let reader = session.begin(Some(9));
    let mut rc = session.open_cursor(&tree);
    rc.set_key(b"k");
    let err = rc.search(&reader).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::PrepareConflict);
    reader.abort().unwrap();

    preparer.commit_with_durable(Some(9), Some(9)).unwrap();

    let reader = session.begin(Some(9));
    let mut rc = session.open_cursor(&tree);
    rc.set_key(b"k");
    rc.search(&reader).unwrap();
    assert_eq!(rc.value().as_ref(), b"prepared");
    reader.abort().unwrap();
}

#[test]
fn test_oversize_items_rejected() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree(
            "t",
            tamarack::PageType::RowLeaf,
            tamarack::BtreeConfig {
                key_max: 16,
                value_max: 32,
                ..Default::default()
            },
        )
        .unwrap();
    let mut cursor = session.open_cursor(&tree);

    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_key(&vec![b'k'; 64]);
    cursor.set_value(b"v");
    let err = cursor.insert(&txn).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Invalid);

    cursor.set_key(b"k");
    cursor.set_value(&vec![b'v'; 64]);
    let err = cursor.insert(&txn).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Invalid);
    txn.abort().unwrap();
}

#[test]
fn test_modify_round_trip_through_cursor() {
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
            &[tamarack::ModifyOp {
                offset: 1,
                size: 1,
                data: bytes::Bytes::from_static(b"x"),
            }],
        )
        .unwrap();
    txn.commit(Some(20)).unwrap();

    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(20)),
        Some(b"AxCDE".to_vec())
    );
    assert_eq!(
        read_at(&session, &mut cursor, b"k", Some(10)),
        Some(b"ABCDE".to_vec())
    );
}
