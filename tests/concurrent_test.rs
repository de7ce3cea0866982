mod common;

use common::*;

fn key_of(i: usize) -> Vec<u8> {
    format!("k{:05}", i).into_bytes()
}

/// Iterate a populated tree while a concurrent writer forces an insert
/// split at the trailing edge. The iteration must return every original
/// key exactly once, in order; the concurrently inserted key may appear
/// at the end.
#[test]
fn test_split_under_iteration() {
    let conn = setup();
    let session = conn.open_session();
    let tree = small_row_tree(&conn, "t");
    let mut cursor = session.open_cursor(&tree);

    let count = 10_000;
    for i in 0..count {
        insert_commit(&session, &mut cursor, &key_of(i), b"v", 10);
    }
    cursor.reset();

    let (started_tx, started_rx) = crossbeam::channel::bounded(1);

    crossbeam::scope(|scope| {
        let conn_writer = conn.clone();
        let tree_writer = tree.clone();
        let writer = scope.spawn(move |_| {
            // wait until the reader is mid-scan, then push the trailing
            // edge over the split threshold
            started_rx.recv().unwrap();
            let wsession = conn_writer.open_session();
            let mut wcursor = wsession.open_cursor(&tree_writer);
            for j in 0..100 {
                let txn = wsession.begin(None);
                let key = format!("k09999z{:02}", j);
                wcursor.overwrite = true;
                wcursor.set_key(key.as_bytes());
                wcursor.set_value(b"late");
                wcursor.insert(&txn).unwrap();
                txn.commit(Some(20)).unwrap();
            }
        });

        let txn = session.begin(None);
        let mut seen: Vec<Vec<u8>> = Vec::new();
        let mut signalled = false;
        loop {
            match cursor.next(&txn) {
                Ok(()) => {
                    seen.push(cursor.key().to_vec());
                    if !signalled && seen.len() == count / 2 {
                        started_tx.send(()).unwrap();
                        signalled = true;
                    }
                }
                Err(e) if e.is_not_found() => break,
                Err(e) => panic!("iteration failed: {}", e),
            }
        }
        txn.abort().unwrap();
        writer.join().unwrap();

        // every original key exactly once, in order; the late keys may
        // trail
        let originals: Vec<&Vec<u8>> = seen
            .iter()
            .filter(|k| !k.starts_with(b"k09999z"))
            .collect();
        assert_eq!(originals.len(), count);
        for (i, k) in originals.iter().enumerate() {
            assert_eq!(**k, key_of(i));
        }
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len(), "duplicate keys surfaced");
    })
    .unwrap();

    tree.check_integrity().unwrap();
}

/// Many writers inserting disjoint keys while splits rewire the tree.
#[test]
fn test_concurrent_inserters() {
    let conn = setup();
    let tree = small_row_tree(&conn, "t");

    let threads = 8;
    let per_thread = 500;

    crossbeam::scope(|scope| {
        for t in 0..threads {
            let conn = conn.clone();
            let tree = tree.clone();
            scope.spawn(move |_| {
                let session = conn.open_session();
                let mut cursor = session.open_cursor(&tree);
                for i in 0..per_thread {
                    let key = format!("t{}-{:05}", t, i);
                    let txn = session.begin(None);
                    cursor.overwrite = true;
                    cursor.set_key(key.as_bytes());
                    cursor.set_value(b"v");
                    cursor.insert(&txn).unwrap();
                    txn.commit(Some(10)).unwrap();
                }
            });
        }
    })
    .unwrap();

    tree.check_integrity().unwrap();

    let session = conn.open_session();
    let mut cursor = session.open_cursor(&tree);
    let keys = scan_keys(&session, &mut cursor, None);
    assert_eq!(keys.len(), threads * per_thread);
}
