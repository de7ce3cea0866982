#![allow(dead_code)]

use std::sync::Arc;

use tamarack::{
    BTree, BtreeConfig, Connection, ConnectionConfig, Cursor, PageType, Session, Timestamp,
};

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Opening a fresh in-memory connection.
pub fn setup() -> Arc<Connection> {
    tamarack::init_log();
    Connection::open_in_memory(ConnectionConfig::default())
}

/// A row-store tree with small thresholds so splits happen quickly in
/// tests.
pub fn small_row_tree(conn: &Arc<Connection>, name: &str) -> Arc<BTree> {
    conn.create_tree(
        name,
        PageType::RowLeaf,
        BtreeConfig::default()
            .with_split_insert_count(50)
            .with_internal_max_entries(20),
    )
    .unwrap()
}

pub fn row_tree(conn: &Arc<Connection>, name: &str) -> Arc<BTree> {
    conn.create_tree(name, PageType::RowLeaf, BtreeConfig::default()).unwrap()
}

/// Insert one key/value in its own transaction committed at the given
/// timestamp.
pub fn insert_commit(
    session: &Session,
    cursor: &mut Cursor,
    key: &[u8],
    value: &[u8],
    commit_ts: Timestamp,
) {
    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_key(key);
    cursor.set_value(value);
    cursor.insert(&txn).unwrap();
    txn.commit(Some(commit_ts)).unwrap();
}

pub fn remove_commit(
    session: &Session,
    cursor: &mut Cursor,
    key: &[u8],
    commit_ts: Timestamp,
) {
    let txn = session.begin(None);
    cursor.overwrite = true;
    cursor.set_key(key);
    cursor.remove(&txn).unwrap();
    txn.commit(Some(commit_ts)).unwrap();
}

/// Read one key at a read timestamp; None when nothing is visible.
pub fn read_at(
    session: &Session,
    cursor: &mut Cursor,
    key: &[u8],
    read_ts: Option<Timestamp>,
) -> Option<Vec<u8>> {
    let txn = session.begin(read_ts);
    cursor.set_key(key);
    let result = match cursor.search(&txn) {
        Ok(()) => Some(cursor.value().to_vec()),
        Err(e) if e.is_not_found() => None,
        Err(e) => panic!("search failed: {}", e),
    };
    txn.abort().unwrap();
    result
}

/// Collect every visible key in order.
pub fn scan_keys(session: &Session, cursor: &mut Cursor, read_ts: Option<Timestamp>) -> Vec<Vec<u8>> {
    let txn = session.begin(read_ts);
    cursor.reset();
    let mut keys = Vec::new();
    loop {
        match cursor.next(&txn) {
            Ok(()) => keys.push(cursor.key().to_vec()),
            Err(e) if e.is_not_found() => break,
            Err(e) => panic!("next failed: {}", e),
        }
    }
    txn.abort().unwrap();
    keys
}
