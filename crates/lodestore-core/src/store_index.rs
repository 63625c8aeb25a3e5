use std::collections::{HashMap, HashSet};

use lodestore_types::block_hash::{BlockHash, ChunkHash};
use lodestore_types::error::{Result, StoreError};

use crate::block::BlockIndex;

/// Backend key of the persisted store index object.
pub const STORE_INDEX_KEY: &str = "store.lsi";

/// Magic bytes at the start of an encoded store index.
pub const INDEX_MAGIC: &[u8; 4] = b"LSIX";
/// Store index format version.
pub const INDEX_VERSION: u8 = 1;

/// The catalogue of every block known to be in the store.
///
/// Mutated only by the index maintainer; everything else receives derived
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreIndex {
    blocks: HashMap<BlockHash, BlockIndex>,
}

impl StoreIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from block metadata records. Later records win when the
    /// same block hash appears twice.
    pub fn from_blocks(blocks: impl IntoIterator<Item = BlockIndex>) -> Self {
        let blocks = blocks
            .into_iter()
            .map(|b| (b.block_hash, b))
            .collect();
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains_block(&self, hash: BlockHash) -> bool {
        self.blocks.contains_key(&hash)
    }

    pub fn get(&self, hash: BlockHash) -> Option<&BlockIndex> {
        self.blocks.get(&hash)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockIndex> {
        self.blocks.values()
    }

    pub fn block_hashes(&self) -> Vec<BlockHash> {
        self.blocks.keys().copied().collect()
    }

    /// Derived chunk-hash -> block-hash lookup.
    pub fn chunk_locations(&self) -> HashMap<ChunkHash, BlockHash> {
        let mut lookup = HashMap::new();
        for block in self.blocks.values() {
            for chunk in &block.chunk_hashes {
                lookup.insert(*chunk, block.block_hash);
            }
        }
        lookup
    }

    /// Union of two indexes. Entries from `new` win over `old` on duplicate
    /// block hashes, making merges deterministic.
    pub fn merge(new: &StoreIndex, old: &StoreIndex) -> StoreIndex {
        let mut blocks = old.blocks.clone();
        for (hash, index) in &new.blocks {
            blocks.insert(*hash, index.clone());
        }
        StoreIndex { blocks }
    }

    /// The subset of blocks that covers `wanted_chunks`.
    ///
    /// Blocks are ranked by how many wanted chunks they carry (block hash as
    /// the tie-break) and taken greedily while they still contribute an
    /// uncovered chunk. Blocks whose useful-chunk ratio falls below
    /// `min_block_usage_percent` are skipped entirely.
    pub fn existing_subset(
        &self,
        wanted_chunks: &[ChunkHash],
        min_block_usage_percent: u32,
    ) -> StoreIndex {
        let wanted: HashSet<ChunkHash> = wanted_chunks.iter().copied().collect();

        let mut candidates: Vec<(usize, &BlockIndex)> = self
            .blocks
            .values()
            .filter_map(|block| {
                let useful = block
                    .chunk_hashes
                    .iter()
                    .filter(|c| wanted.contains(c))
                    .count();
                if useful == 0 {
                    return None;
                }
                if min_block_usage_percent > 0
                    && useful * 100 < min_block_usage_percent as usize * block.chunk_hashes.len()
                {
                    return None;
                }
                Some((useful, block))
            })
            .collect();
        candidates.sort_by(|(ua, a), (ub, b)| ub.cmp(ua).then(a.block_hash.cmp(&b.block_hash)));

        let mut uncovered = wanted;
        let mut subset = Vec::new();
        for (_, block) in candidates {
            if block.chunk_hashes.iter().any(|c| uncovered.contains(c)) {
                for chunk in &block.chunk_hashes {
                    uncovered.remove(chunk);
                }
                subset.push(block.clone());
            }
        }
        StoreIndex::from_blocks(subset)
    }

    /// Serialize: `LSIX` magic, version byte, rmp-encoded block list sorted by
    /// block hash (so equal indexes encode to equal bytes).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut blocks: Vec<&BlockIndex> = self.blocks.values().collect();
        blocks.sort_by_key(|b| b.block_hash);
        let body = rmp_serde::to_vec(&blocks)?;
        let mut out = Vec::with_capacity(5 + body.len());
        out.extend_from_slice(INDEX_MAGIC);
        out.push(INDEX_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<StoreIndex> {
        if bytes.len() < 5 {
            return Err(StoreError::BadData("store index object too small".into()));
        }
        if &bytes[..4] != INDEX_MAGIC {
            return Err(StoreError::BadData("invalid store index magic".into()));
        }
        if bytes[4] != INDEX_VERSION {
            return Err(StoreError::BadData(format!(
                "unsupported store index version: {}",
                bytes[4]
            )));
        }
        let blocks: Vec<BlockIndex> = rmp_serde::from_slice(&bytes[5..])?;
        Ok(StoreIndex::from_blocks(blocks))
    }
}
