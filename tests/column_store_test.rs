mod common;

use common::*;
use tamarack::{BtreeConfig, ErrorKind, PageType};

// Fixed-length column store with 1-byte values: records inside the
// allocated range that were never written read as zero, records past
// the end do not exist.
#[test]
fn test_flcs_implicit_zero_fill() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree(
            "flcs",
            PageType::ColFixLeaf,
            BtreeConfig::default().with_fixed_bit_width(8),
        )
        .unwrap();
    let mut cursor = session.open_cursor(&tree);

    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_recno(5);
    cursor.set_value(&[0x7]);
    cursor.insert(&txn).unwrap();
    txn.commit(Some(10)).unwrap();

    let txn = session.begin(None);

    cursor.set_recno(3);
    cursor.search(&txn).unwrap();
    assert_eq!(cursor.value().as_ref(), &[0x0]);

    cursor.set_recno(5);
    cursor.search(&txn).unwrap();
    assert_eq!(cursor.value().as_ref(), &[0x7]);

    cursor.set_recno(6);
    let err = cursor.search(&txn).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::NotFound);

    txn.abort().unwrap();
}

#[test]
fn test_flcs_remove_reads_as_zero() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree("flcs", PageType::ColFixLeaf, BtreeConfig::default())
        .unwrap();
    let mut cursor = session.open_cursor(&tree);

    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_recno(1);
    cursor.set_value(&[0x42]);
    cursor.insert(&txn).unwrap();
    txn.commit(Some(10)).unwrap();

    let txn = session.begin(None);
    cursor.set_recno(1);
    cursor.remove(&txn).unwrap();
    txn.commit(Some(20)).unwrap();

    // the record still exists, reading as zero
    let txn = session.begin(None);
    cursor.set_recno(1);
    cursor.search(&txn).unwrap();
    assert_eq!(cursor.value().as_ref(), &[0x0]);
    txn.abort().unwrap();
}

#[test]
fn test_vlcs_append_allocates_recnos() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree("vlcs", PageType::ColVarLeaf, BtreeConfig::default())
        .unwrap();
    let mut cursor = session.open_cursor(&tree);
    cursor.append = true;
    cursor.overwrite = true;

    let mut recnos = Vec::new();
    for i in 0..10 {
        let txn = session.begin(None);
        // the caller's record number is ignored under APPEND
        cursor.set_recno(999);
        cursor.set_value(format!("v{}", i).as_bytes());
        cursor.insert(&txn).unwrap();
        txn.commit(Some(10)).unwrap();
        recnos.push(cursor.recno());
    }
    assert_eq!(recnos, (1..=10).collect::<Vec<u64>>());

    let txn = session.begin(None);
    cursor.set_recno(4);
    cursor.search(&txn).unwrap();
    assert_eq!(cursor.value().as_ref(), b"v3");
    txn.abort().unwrap();
}

#[test]
fn test_vlcs_sparse_iteration() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree("vlcs", PageType::ColVarLeaf, BtreeConfig::default())
        .unwrap();
    let mut cursor = session.open_cursor(&tree);
    cursor.overwrite = true;

    for recno in [3u64, 7, 20] {
        let txn = session.begin(None);
        cursor.set_recno(recno);
        cursor.set_value(format!("r{}", recno).as_bytes());
        cursor.insert(&txn).unwrap();
        txn.commit(Some(10)).unwrap();
    }
    cursor.reset();

    let txn = session.begin(None);
    let mut seen = Vec::new();
    loop {
        match cursor.next(&txn) {
            Ok(()) => seen.push(cursor.recno()),
            Err(e) if e.is_not_found() => break,
            Err(e) => panic!("next failed: {}", e),
        }
    }
    txn.abort().unwrap();
    assert_eq!(seen, vec![3, 7, 20]);
}

#[test]
fn test_vlcs_insert_update_wins_over_on_page() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree("vlcs", PageType::ColVarLeaf, BtreeConfig::default())
        .unwrap();
    let mut cursor = session.open_cursor(&tree);
    cursor.overwrite = true;

    let txn = session.begin(None);
    cursor.set_recno(1);
    cursor.set_value(b"on-page");
    cursor.insert(&txn).unwrap();
    txn.commit(Some(10)).unwrap();
    cursor.reset();

    // push the value into a page image, then update it in memory
    conn.evict_tree(&tree).unwrap();

    let mut cursor = session.open_cursor(&tree);
    cursor.overwrite = true;
    let txn = session.begin(None);
    cursor.set_recno(1);
    cursor.set_value(b"updated");
    cursor.update(&txn).unwrap();
    txn.commit(Some(20)).unwrap();

    // the visible insert-list update wins; the cell only serves older
    // readers
    let txn = session.begin(Some(20));
    cursor.set_recno(1);
    cursor.search(&txn).unwrap();
    assert_eq!(cursor.value().as_ref(), b"updated");
    txn.abort().unwrap();

    let txn = session.begin(Some(10));
    cursor.set_recno(1);
    cursor.search(&txn).unwrap();
    assert_eq!(cursor.value().as_ref(), b"on-page");
    txn.abort().unwrap();
}

#[test]
fn test_flcs_eviction_round_trip() {
    let conn = setup();
    let session = conn.open_session();
    let tree = conn
        .create_tree("flcs", PageType::ColFixLeaf, BtreeConfig::default())
        .unwrap();
    let mut cursor = session.open_cursor(&tree);
    cursor.overwrite = true;

    for recno in 1..=20u64 {
        let txn = session.begin(None);
        cursor.set_recno(recno);
        cursor.set_value(&[recno as u8]);
        cursor.insert(&txn).unwrap();
        txn.commit(Some(10)).unwrap();
    }
    cursor.reset();
    conn.evict_tree(&tree).unwrap();

    let mut cursor = session.open_cursor(&tree);
    let txn = session.begin(None);
    for recno in 1..=20u64 {
        cursor.set_recno(recno);
        cursor.search(&txn).unwrap();
        assert_eq!(cursor.value().as_ref(), &[recno as u8]);
    }
    txn.abort().unwrap();
}
