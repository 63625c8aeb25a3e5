use serde::{Deserialize, Serialize};

use lodestore_types::block_hash::{BlockHash, ChunkHash};
use lodestore_types::error::{Result, StoreError};

/// Magic bytes at the start of every stored block object.
pub const BLOCK_MAGIC: &[u8; 4] = b"LSBK";
/// Stored block format version.
pub const BLOCK_VERSION: u8 = 1;
/// Size of the fixed prefix: magic + version byte + index length field.
const BLOCK_PREFIX_SIZE: usize = 4 + 1 + 4;

/// Metadata describing one stored block: its hash, the chunks packed inside
/// it, and the payload byte size. Cheap to copy around; carries no bulk data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub block_hash: BlockHash,
    pub chunk_hashes: Vec<ChunkHash>,
    pub block_size: u32,
}

impl BlockIndex {
    pub fn chunk_count(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }
}

/// An immutable content-addressed block: its index plus the packed chunk
/// payload. The encoded form is self-describing, so a block read back from
/// the backend can be validated against the key it was fetched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub index: BlockIndex,
    pub data: Vec<u8>,
}

impl StoredBlock {
    pub fn new(block_hash: BlockHash, chunk_hashes: Vec<ChunkHash>, data: Vec<u8>) -> Self {
        let index = BlockIndex {
            block_hash,
            chunk_hashes,
            block_size: data.len() as u32,
        };
        Self { index, data }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.index.block_hash
    }

    /// Payload size in bytes, as counted against the prefetch memory budget.
    pub fn block_size(&self) -> u32 {
        self.index.block_size
    }

    /// Serialize: `LSBK` magic, version byte, index length (u32 LE),
    /// rmp-encoded index, then the raw payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let index_bytes = rmp_serde::to_vec(&self.index)?;
        let mut out = Vec::with_capacity(BLOCK_PREFIX_SIZE + index_bytes.len() + self.data.len());
        out.extend_from_slice(BLOCK_MAGIC);
        out.push(BLOCK_VERSION);
        out.extend_from_slice(&(index_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&index_bytes);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<StoredBlock> {
        let (index, payload) = split_frame(bytes)?;
        if index.block_size as usize != payload.len() {
            return Err(StoreError::BadData(format!(
                "block payload is {} bytes, index declares {}",
                payload.len(),
                index.block_size
            )));
        }
        Ok(StoredBlock {
            index,
            data: payload.to_vec(),
        })
    }

    /// Decode only the index of an encoded block, still validating that the
    /// payload length matches the declaration.
    pub fn decode_index(bytes: &[u8]) -> Result<BlockIndex> {
        let (index, payload) = split_frame(bytes)?;
        if index.block_size as usize != payload.len() {
            return Err(StoreError::BadData(format!(
                "block payload is {} bytes, index declares {}",
                payload.len(),
                index.block_size
            )));
        }
        Ok(index)
    }
}

/// Validate the frame prefix and split an encoded block into its decoded
/// index and raw payload slice.
fn split_frame(bytes: &[u8]) -> Result<(BlockIndex, &[u8])> {
    if bytes.len() < BLOCK_PREFIX_SIZE {
        return Err(StoreError::BadData("block object too small".into()));
    }
    if &bytes[..4] != BLOCK_MAGIC {
        return Err(StoreError::BadData("invalid block magic".into()));
    }
    if bytes[4] != BLOCK_VERSION {
        return Err(StoreError::BadData(format!(
            "unsupported block format version: {}",
            bytes[4]
        )));
    }
    let index_len = u32::from_le_bytes(
        bytes[5..9]
            .try_into()
            .map_err(|_| StoreError::BadData("invalid block index length field".into()))?,
    ) as usize;
    if BLOCK_PREFIX_SIZE + index_len > bytes.len() {
        return Err(StoreError::BadData("invalid block index length".into()));
    }
    let index: BlockIndex = rmp_serde::from_slice(&bytes[BLOCK_PREFIX_SIZE..BLOCK_PREFIX_SIZE + index_len])?;
    Ok((index, &bytes[BLOCK_PREFIX_SIZE + index_len..]))
}
