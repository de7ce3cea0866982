//! A transactional, multi-version B-tree storage engine core:
//! snapshot-isolation reads over in-memory update chains, concurrent
//! page splits, a history store of prior versions, and
//! rollback-to-stable.

pub mod block;
pub mod btree;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod io;
pub mod rts;
pub mod session;
pub mod stats;
pub mod txn;
pub mod types;
pub mod utils;

pub use crate::{
    block::{BlockManager, FileBlockManager, MemBlockManager},
    btree::{
        cursor::{truncate, Cursor},
        page::PageType,
        update::ModifyOp,
        BTree,
    },
    config::{BtreeConfig, ConnectionConfig, RollbackConfig},
    connection::Connection,
    error::{Error, ErrorKind},
    history::HistoryStore,
    rts::RollbackOptions,
    session::Session,
    txn::{Isolation, Transaction},
    types::{CoreResult, Recno, Timestamp, TreeResult, TxnId},
    utils::init_log,
};
