use std::sync::atomic::{AtomicU64, Ordering};

/// One per-operation statistic kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatField {
    GetStoredBlockCount,
    GetStoredBlockByteCount,
    GetStoredBlockChunkCount,
    GetStoredBlockRetryCount,
    GetStoredBlockFailCount,
    PutStoredBlockCount,
    PutStoredBlockByteCount,
    PutStoredBlockChunkCount,
    PutStoredBlockRetryCount,
    PutStoredBlockFailCount,
}

pub const STAT_FIELD_COUNT: usize = 10;

/// Live counters, updated with relaxed atomic adds from worker threads.
#[derive(Debug, Default)]
pub struct StatCounters {
    values: [AtomicU64; STAT_FIELD_COUNT],
}

impl StatCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, field: StatField, delta: u64) {
        self.values[field as usize].fetch_add(delta, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> BlockStoreStats {
        let mut values = [0u64; STAT_FIELD_COUNT];
        for (slot, counter) in values.iter_mut().zip(&self.values) {
            *slot = counter.load(Ordering::Relaxed);
        }
        BlockStoreStats { values }
    }
}

/// Snapshot of the store's counters as returned by `get_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStoreStats {
    values: [u64; STAT_FIELD_COUNT],
}

impl BlockStoreStats {
    pub fn get(&self, field: StatField) -> u64 {
        self.values[field as usize]
    }
}
