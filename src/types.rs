use crate::error::Error;

pub type TreeResult<T> = Result<T, Error>;
pub type CoreResult = Result<(), Error>;

/// Transaction id. 0 means "none", u64::MAX marks an aborted update.
pub type TxnId = u64;

pub const TXN_NONE: TxnId = 0;
pub const TXN_ABORTED: TxnId = u64::MAX;

/// Commit/durable timestamp. 0 means "none" (a non-timestamped write).
pub type Timestamp = u64;

pub const TS_NONE: Timestamp = 0;
pub const TS_MAX: Timestamp = u64::MAX;

/// Record number for column stores. Record numbers start at 1.
pub type Recno = u64;

pub const RECNO_NONE: Recno = 0;
