use crate::types::Timestamp;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Leaf values may not exceed this, matching the history store default.
pub const DEFAULT_LEAF_VALUE_MAX: usize = 64 << 20;

/// Connection-wide tuning. The timestamps here are only the initial
/// values, the live ones are managed by the transaction subsystem.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub cache_size: usize,
    pub stable_timestamp: Timestamp,
    pub oldest_timestamp: Timestamp,
    pub rollback: RollbackConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            cache_size: 100 << 20,
            stable_timestamp: 0,
            oldest_timestamp: 0,
            rollback: RollbackConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RollbackConfig {
    /// Mark aborts without mutating data so the effect of a rollback can
    /// be previewed.
    pub dry_run: bool,
}

/// Per-btree tuning.
#[derive(Clone, Debug)]
pub struct BtreeConfig {
    pub page_size: usize,
    pub key_max: usize,
    pub value_max: usize,

    /// A leaf splits once its in-memory footprint exceeds this.
    pub split_mem_size: usize,

    /// An insert split is attempted once the trailing insert list grows
    /// past this many entries.
    pub split_insert_count: usize,

    /// An internal page splits once its child count exceeds this.
    pub internal_max_entries: usize,

    /// The root deepens once its child count exceeds this multiple of
    /// `internal_max_entries`.
    pub deepen_ratio: usize,

    /// Reading a modify chain longer than this materializes the result as
    /// a full standard update.
    pub modify_chain_max: usize,

    /// Bit width of fixed-length column-store values (1..=8).
    pub fixed_bit_width: u8,

    pub prefix_compression: bool,

    /// Updates on this tree are made durable by the log as soon as they
    /// commit; rollback-to-stable must refuse to unwind them.
    pub log_immediately_durable: bool,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            key_max: 1 << 20,
            value_max: DEFAULT_LEAF_VALUE_MAX,
            split_mem_size: 64 << 10,
            split_insert_count: 100,
            internal_max_entries: 100,
            deepen_ratio: 2,
            modify_chain_max: 10,
            fixed_bit_width: 8,
            prefix_compression: true,
            log_immediately_durable: false,
        }
    }
}

impl BtreeConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_split_insert_count(mut self, count: usize) -> Self {
        self.split_insert_count = count;
        self
    }

    pub fn with_internal_max_entries(mut self, count: usize) -> Self {
        self.internal_max_entries = count;
        self
    }

    pub fn with_fixed_bit_width(mut self, width: u8) -> Self {
        assert!(width >= 1 && width <= 8);
        self.fixed_bit_width = width;
        self
    }
}
