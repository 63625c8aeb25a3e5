pub mod block;
pub mod cache;
pub mod stats;
pub mod store;
pub mod store_index;

pub use block::{BlockIndex, StoredBlock};
pub use lodestore_types::block_hash::{BlockHash, ChunkHash};
pub use lodestore_types::error::{Result, StoreError};
pub use stats::{BlockStoreStats, StatField};
pub use store::{AccessType, RemoteBlockStore, RemoteStoreOptions};
pub use store_index::StoreIndex;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
