use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// File extension for stored block objects.
pub const BLOCK_EXTENSION: &str = ".lsb";

/// A 64-bit block identifier derived from the block's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub u64);

/// A 64-bit chunk identifier. Chunks are the dedup units packed inside blocks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash(pub u64);

impl BlockHash {
    /// The block's object file name: `0x<16 lowercase hex digits>.lsb`.
    pub fn file_name(&self) -> String {
        format!("0x{:016x}{}", self.0, BLOCK_EXTENSION)
    }

    /// Two-byte shard directory: the first four hex digits of the name.
    pub fn shard_prefix(&self) -> String {
        format!("{:016x}", self.0)[..4].to_string()
    }

    /// Backend key for this block under `base`, e.g.
    /// `chunks/0123/0x0123456789abcdef.lsb`. Always `/`-separated.
    pub fn storage_key(&self, base: &str) -> String {
        format!("{}/{}/{}", base, self.shard_prefix(), self.file_name())
    }

    /// Recover the hash from a block storage path or file name.
    pub fn from_storage_path(path: &str) -> Result<BlockHash> {
        let name = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path);
        let hex = name
            .strip_prefix("0x")
            .and_then(|n| n.strip_suffix(BLOCK_EXTENSION))
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!("not a block path: '{path}'"))
            })?;
        if hex.len() != 16 {
            return Err(StoreError::InvalidArgument(format!(
                "block name has {} hex digits, expected 16: '{name}'",
                hex.len()
            )));
        }
        let value = u64::from_str_radix(hex, 16).map_err(|e| {
            StoreError::InvalidArgument(format!("invalid block name '{name}': {e}"))
        })?;
        Ok(BlockHash(value))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(0x{:016x})", self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash(0x{:016x})", self.0)
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}
