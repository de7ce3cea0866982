mod common;

use common::*;
use tamarack::ErrorKind;

fn key_of(i: usize) -> Vec<u8> {
    format!("k{:05}", i).into_bytes()
}

// Filling a tree past its thresholds must produce a multi-level tree
// that still contains exactly the inserted keys, in order.
#[test]
fn test_split_preserves_all_keys() {
    let conn = setup();
    let session = conn.open_session();
    let tree = small_row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    let count = 2000;
    for i in 0..count {
        insert_commit(&session, &mut cursor, &key_of(i), b"v", 10);
    }

    tree.check_integrity().unwrap();

    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys.len(), count);
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(*k, key_of(i));
    }

    // splits actually happened
    assert!(tamarack::stats::get(&conn.stats().leaf_split) > 0);
}

#[test]
fn test_root_deepens_under_load() {
    let conn = setup();
    let session = conn.open_session();
    let tree = small_row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    for i in 0..5000 {
        insert_commit(&session, &mut cursor, &key_of(i), b"v", 10);
    }
    tree.check_integrity().unwrap();
    assert!(tamarack::stats::get(&conn.stats().root_deepen) > 0);

    // point reads still resolve through the deeper tree
    assert_eq!(
        read_at(&session, &mut cursor, &key_of(0), None),
        Some(b"v".to_vec())
    );
    assert_eq!(
        read_at(&session, &mut cursor, &key_of(4999), None),
        Some(b"v".to_vec())
    );
}

// Inserting a key smaller than any on-page key exercises the
// "smallest" insert list.
#[test]
fn test_insert_smallest_key() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"m", b"1", 10);
    cursor.reset();
    conn.evict_tree(&tree).unwrap();

    // the page's image starts at "m"; "a" lands in the smallest list
    insert_commit(&session, &mut cursor, b"a", b"2", 20);

    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec()]);
}

// Evicting the only leaf of the root must refuse to leave an empty
// internal page: reverse split reports busy at the root.
#[test]
fn test_reverse_split_would_empty_root() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"v", 10);
    remove_commit(&session, &mut cursor, b"k", 20);
    cursor.reset();

    // everything on the leaf is deleted and globally visible: eviction
    // reconciles it to nothing and asks for a reverse split
    let root_index = tree.root().page().unwrap().as_internal().load_index();
    let leaf_ref = root_index.refs[0].clone();
    let err = conn.evict(&tree, &leaf_ref).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Busy);

    tree.check_integrity().unwrap();
}

#[test]
fn test_eviction_and_read_back() {
    let conn = setup();
    let session = conn.open_session();
    let tree = small_row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    let count = 500;
    for i in 0..count {
        insert_commit(&session, &mut cursor, &key_of(i), format!("v{}", i).as_bytes(), 10);
    }
    cursor.reset();

    conn.evict_tree(&tree).unwrap();
    assert!(tamarack::stats::get(&conn.stats().pages_evicted) > 0);

    // reads fault the pages back in from their images
    let mut cursor = session.open_cursor(&tree);
    for i in (0..count).step_by(37) {
        assert_eq!(
            read_at(&session, &mut cursor, &key_of(i), None),
            Some(format!("v{}", i).into_bytes())
        );
    }
    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys.len(), count);
}

#[test]
fn test_uncommitted_update_survives_eviction() {
    let conn = setup();
    let session = conn.open_session();
    let tree = row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    insert_commit(&session, &mut cursor, b"k", b"committed", 10);

    // leave a second update uncommitted, then force reconciliation
    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_key(b"k");
    cursor.set_value(b"pending");
    cursor.insert(&txn).unwrap();
    cursor.reset();

    conn.evict_tree(&tree).unwrap();

    // the page was re-instantiated with the pending chain intact
    let mut mine = session.open_cursor(&tree);
    mine.set_key(b"k");
    mine.search(&txn).unwrap();
    assert_eq!(mine.value().as_ref(), b"pending");

    // other transactions still see the committed value
    assert_eq!(
        read_at(&session, &mut cursor, b"k", None),
        Some(b"committed".to_vec())
    );

    txn.abort().unwrap();
    assert_eq!(
        read_at(&session, &mut cursor, b"k", None),
        Some(b"committed".to_vec())
    );
}
