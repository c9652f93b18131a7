//! Chunk-storage engine for a rimfs data node.
//!
//! The engine owns a set of on-disk data folders holding fixed-size chunks
//! (64 MiB of payload split into 1024 blocks of 64 KiB, each protected by a
//! CRC32). It serves the node's read/write/replicate/repair operations,
//! keeps open descriptors under a bounded pool, scrubs blocks in the
//! background, and queues damaged/lost/new chunk reports for the master
//! protocol layer to drain.

pub mod chunk;
pub mod engine;
pub mod filename;
pub mod folder;
pub mod io;
pub mod open_pool;
pub mod ops;
pub mod registry;
pub mod reports;
pub mod scan;
pub mod signature;
pub mod stats;
pub mod tester;

use std::sync::OnceLock;

/// Payload bytes per block.
pub const BLOCK_SIZE: u32 = 64 * 1024;

/// Blocks per chunk.
pub const BLOCKS_IN_CHUNK: u16 = 1024;

/// Payload bytes per chunk.
pub const CHUNK_SIZE: u32 = BLOCK_SIZE * BLOCKS_IN_CHUNK as u32;

/// Bytes of a serialized block CRC.
pub const CRC_SIZE: u32 = 4;

/// One block together with its CRC, as stored by the interleaved format.
pub const DISK_BLOCK_SIZE: u32 = BLOCK_SIZE + CRC_SIZE;

/// Number of hashed subdirectories per data folder.
pub const SUBFOLDER_COUNT: u32 = 256;

pub(crate) const ERROR_LIMIT: usize = 2;
pub(crate) const LAST_ERROR_TIME_SECS: u64 = 60;
pub(crate) const LAST_ERROR_SIZE: usize = 30;
pub(crate) const STATS_HISTORY: usize = 24 * 60;

pub(crate) const OPEN_RETRY_COUNT: u32 = 4;
pub(crate) const OPEN_RETRY_MS: u64 = 5;

/// CRC32 of one all-zero block; sparse blocks report this value.
pub fn empty_block_crc() -> u32 {
    static CRC: OnceLock<u32> = OnceLock::new();
    *CRC.get_or_init(|| rimfs_utils::crc32_zero_block(0, BLOCK_SIZE as usize))
}

pub use chunk::{ChunkFormat, ChunkKey, ChunkPartType, ChunkState};
pub use engine::{HddEngine, SpaceInfo};
pub use reports::{ChunkWithType, ChunkWithVersionAndType, DiskInfo};
pub use stats::{HddStatistics, IoStatsSnapshot, OpStatsSnapshot};
