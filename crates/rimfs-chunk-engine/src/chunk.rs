//! Chunk identity, on-disk layout math, and the in-memory chunk object.

use std::path::{Path, PathBuf};
use std::sync::Weak;

use parking_lot::Mutex;
use rimfs_types::ChunkId;

use crate::folder::Folder;
use crate::open_pool::PoolHandle;
use crate::signature::HEADER_SIZE;
use crate::{BLOCKS_IN_CHUNK, BLOCK_SIZE, CRC_SIZE, DISK_BLOCK_SIZE};

/// Replication-role / erasure-coded-part identity of a chunk. Part of the
/// chunk's registry key and encoded both in filenames and in the split-format
/// signature as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkPartType {
    Standard,
    /// Erasure-coded part `part` (1-based) out of `total` parts.
    Ec2 { part: u8, total: u8 },
}

impl ChunkPartType {
    /// Pack into the one-byte id stored in signatures. Standard is 0; EC
    /// parts pack the total into the high nibble and the part index into the
    /// low nibble, which never collides with 0 since `total >= 2`.
    pub fn type_id(&self) -> u8 {
        match *self {
            ChunkPartType::Standard => 0,
            ChunkPartType::Ec2 { part, total } => (total << 4) | part,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        if id == 0 {
            return Some(ChunkPartType::Standard);
        }
        let total = id >> 4;
        let part = id & 0x0F;
        if (2..=15).contains(&total) && part >= 1 && part <= total {
            Some(ChunkPartType::Ec2 { part, total })
        } else {
            None
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, ChunkPartType::Standard)
    }

    /// Filename infix: empty for standard chunks, `ec2_P_of_T_` for EC parts.
    pub fn filename_infix(&self) -> String {
        match *self {
            ChunkPartType::Standard => String::new(),
            ChunkPartType::Ec2 { part, total } => format!("ec2_{}_of_{}_", part, total),
        }
    }
}

impl std::fmt::Display for ChunkPartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ChunkPartType::Standard => write!(f, "std"),
            ChunkPartType::Ec2 { part, total } => write!(f, "ec2_{}_of_{}", part, total),
        }
    }
}

/// Registry key of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub id: ChunkId,
    pub part_type: ChunkPartType,
}

impl ChunkKey {
    pub fn new(id: ChunkId, part_type: ChunkPartType) -> Self {
        Self { id, part_type }
    }
}

/// The two on-disk chunk layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFormat {
    /// Signature block + CRC table at the front, then bare 64 KiB blocks.
    Split,
    /// Repeating `(crc, block)` tuples, no header.
    Interleaved,
}

impl ChunkFormat {
    /// Bytes before the first data block.
    pub fn header_size(&self) -> u64 {
        match self {
            ChunkFormat::Split => HEADER_SIZE as u64,
            ChunkFormat::Interleaved => 0,
        }
    }

    /// Size of the in-file (and in-memory) CRC table. Split only.
    pub fn crc_table_size(&self) -> usize {
        BLOCKS_IN_CHUNK as usize * CRC_SIZE as usize
    }

    /// File offset of block `b` (for interleaved, of its leading CRC).
    pub fn block_offset(&self, block: u16) -> u64 {
        match self {
            ChunkFormat::Split => self.header_size() + block as u64 * BLOCK_SIZE as u64,
            ChunkFormat::Interleaved => block as u64 * DISK_BLOCK_SIZE as u64,
        }
    }

    /// File size of a chunk holding `blocks` blocks.
    pub fn file_size_from_blocks(&self, blocks: u32) -> u64 {
        match self {
            ChunkFormat::Split => self.header_size() + blocks as u64 * BLOCK_SIZE as u64,
            ChunkFormat::Interleaved => blocks as u64 * DISK_BLOCK_SIZE as u64,
        }
    }

    /// Block count implied by an on-disk file size, or `None` if the size is
    /// not one this format can produce.
    pub fn block_count_from_file_size(&self, file_size: u64) -> Option<u16> {
        let (payload, unit) = match self {
            ChunkFormat::Split => (
                file_size.checked_sub(self.header_size())?,
                BLOCK_SIZE as u64,
            ),
            ChunkFormat::Interleaved => (file_size, DISK_BLOCK_SIZE as u64),
        };
        if payload % unit != 0 {
            return None;
        }
        let blocks = payload / unit;
        if blocks > BLOCKS_IN_CHUNK as u64 {
            return None;
        }
        Some(blocks as u16)
    }

    /// Bytes occupied by one block on disk (CRC included for interleaved).
    pub fn disk_block_size(&self) -> u32 {
        match self {
            ChunkFormat::Split => BLOCK_SIZE,
            ChunkFormat::Interleaved => DISK_BLOCK_SIZE,
        }
    }

    /// Filename extension for this format, including the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ChunkFormat::Split => ".csf",
            ChunkFormat::Interleaved => ".cif",
        }
    }
}

/// Per-chunk state machine states (registry-lock protected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Avail,
    Locked,
    ToBeDeleted,
    Deleted,
}

/// Directory layout versions. Legacy trees are readable and migrated in the
/// background to the current layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryLayout {
    Current,
    Legacy,
}

/// Hash a chunk id into one of the 256 subfolder buckets.
pub fn subfolder_number(id: ChunkId) -> u32 {
    (*id & 0xFF) as u32
}

/// Subdirectory name for a bucket number under the given layout.
pub fn subfolder_name(number: u32, layout: DirectoryLayout) -> String {
    match layout {
        DirectoryLayout::Current => format!("chunks{:02X}", number),
        DirectoryLayout::Legacy => format!("{:02X}", number),
    }
}

/// Build the full path of a chunk file.
pub fn chunk_file_path(
    folder_path: &Path,
    layout: DirectoryLayout,
    id: ChunkId,
    version: u32,
    part_type: ChunkPartType,
    format: ChunkFormat,
) -> PathBuf {
    let name = format!(
        "chunk_{}{}_{:08X}{}",
        part_type.filename_infix(),
        id.to_hex(),
        version,
        format.extension()
    );
    folder_path
        .join(subfolder_name(subfolder_number(id), layout))
        .join(name)
}

/// Mutable chunk fields. Only the holder of the LOCKED registry state may
/// mutate these; the mutex makes the brief cross-thread reads sound.
#[derive(Debug)]
pub(crate) struct ChunkInner {
    pub version: u32,
    pub blocks: u16,
    pub validattr: bool,
    pub was_changed: bool,
    pub refcount: u32,
    pub next_expected_block: u16,
    pub fd: Option<PoolHandle>,
    pub layout: DirectoryLayout,
    pub owner: Weak<Folder>,
    pub filename: PathBuf,
}

/// One chunk known to the registry.
#[derive(Debug)]
pub struct Chunk {
    pub id: ChunkId,
    pub part_type: ChunkPartType,
    pub format: ChunkFormat,
    pub(crate) inner: Mutex<ChunkInner>,
}

impl Chunk {
    pub(crate) fn new(id: ChunkId, part_type: ChunkPartType, format: ChunkFormat) -> Self {
        Self {
            id,
            part_type,
            format,
            inner: Mutex::new(ChunkInner {
                version: 0,
                blocks: 0,
                validattr: false,
                was_changed: false,
                refcount: 0,
                next_expected_block: 0,
                fd: None,
                layout: DirectoryLayout::Current,
                owner: Weak::new(),
                filename: PathBuf::new(),
            }),
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.id, self.part_type)
    }

    pub fn max_blocks_in_file(&self) -> u16 {
        BLOCKS_IN_CHUNK
    }

    pub fn version(&self) -> u32 {
        self.inner.lock().version
    }

    pub fn blocks(&self) -> u16 {
        self.inner.lock().blocks
    }

    /// Current full path of the chunk file (empty until registered).
    pub fn filename(&self) -> PathBuf {
        self.inner.lock().filename.clone()
    }

    pub(crate) fn owner(&self) -> Option<std::sync::Arc<Folder>> {
        self.inner.lock().owner.upgrade()
    }

    /// Whether `file_size` is a size this chunk's format can produce.
    pub fn is_file_size_valid(&self, file_size: u64) -> bool {
        self.format.block_count_from_file_size(file_size).is_some()
    }

    /// Rename the on-disk file for a new version, moving it into the current
    /// directory layout. The in-memory version field is left untouched; the
    /// caller overwrites it once the header rewrite succeeds.
    pub(crate) fn rename_file(&self, new_version: u32) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        let owner = inner
            .owner
            .upgrade()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "folder gone"))?;
        let new_path = chunk_file_path(
            &owner.path,
            DirectoryLayout::Current,
            self.id,
            new_version,
            self.part_type,
            self.format,
        );
        std::fs::rename(&inner.filename, &new_path)?;
        inner.filename = new_path;
        inner.layout = DirectoryLayout::Current;
        Ok(())
    }
}
