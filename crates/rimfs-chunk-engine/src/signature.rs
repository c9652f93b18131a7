//! Split-format signature block.
//!
//! A split chunk starts with a signature identifying the chunk, padded to
//! [`SIGNATURE_BLOCK_SIZE`], followed by the CRC table, followed by the data
//! blocks. The version field sits at a fixed offset so that set-version can
//! rewrite it in place.

use std::fs::File;
use std::os::unix::fs::FileExt;

use rimfs_types::ChunkId;

use crate::chunk::ChunkPartType;
use crate::{BLOCKS_IN_CHUNK, CRC_SIZE};

pub const SIGNATURE_MAGIC: [u8; 16] = *b"RIMFS CHUNK 1.0\0";

/// Serialized signature: magic + chunk id (BE) + version (BE) + type id.
pub const SIGNATURE_SIZE: usize = 16 + 8 + 4 + 1;

/// Byte offset of the version field within the file.
pub const VERSION_OFFSET: u64 = 16 + 8;

/// The signature area is padded to this size; the CRC table follows it.
pub const SIGNATURE_BLOCK_SIZE: usize = 1024;

/// File offset of the CRC table.
pub const CRC_OFFSET: u64 = SIGNATURE_BLOCK_SIZE as u64;

/// Full split-format header: signature block + CRC table.
pub const HEADER_SIZE: usize = SIGNATURE_BLOCK_SIZE + BLOCKS_IN_CHUNK as usize * CRC_SIZE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSignature {
    pub chunk_id: ChunkId,
    pub version: u32,
    pub type_id: u8,
}

impl ChunkSignature {
    pub fn new(chunk_id: ChunkId, version: u32, part_type: ChunkPartType) -> Self {
        Self {
            chunk_id,
            version,
            type_id: part_type.type_id(),
        }
    }

    /// Write the signature into the first [`SIGNATURE_SIZE`] bytes of `out`.
    pub fn serialize(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(&SIGNATURE_MAGIC);
        out[16..24].copy_from_slice(&self.chunk_id.0.to_be_bytes());
        out[24..28].copy_from_slice(&self.version.to_be_bytes());
        out[28] = self.type_id;
    }

    /// Parse a signature, returning `None` when the magic does not match.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < SIGNATURE_SIZE || buf[0..16] != SIGNATURE_MAGIC {
            return None;
        }
        Some(Self {
            chunk_id: ChunkId(u64::from_be_bytes(buf[16..24].try_into().unwrap())),
            version: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            type_id: buf[28],
        })
    }

    /// Read and parse the signature at the start of `file`. An I/O error is
    /// distinct from a bad signature (`Ok(None)`).
    pub fn read_from(file: &File) -> std::io::Result<Option<Self>> {
        let mut buf = [0u8; SIGNATURE_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        Ok(Self::parse(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_header_layout_constants() {
        assert_eq!(SIGNATURE_SIZE, 29);
        assert_eq!(VERSION_OFFSET, 24);
        assert_eq!(CRC_OFFSET, 1024);
        assert_eq!(HEADER_SIZE, 1024 + 4096);
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let sig = ChunkSignature::new(ChunkId(0xDEAD_BEEF), 42, ChunkPartType::Standard);
        let mut buf = [0u8; SIGNATURE_SIZE];
        sig.serialize(&mut buf);
        assert_eq!(ChunkSignature::parse(&buf), Some(sig));
    }

    #[test]
    fn test_version_offset_matches_layout() {
        let sig = ChunkSignature::new(ChunkId(1), 0x0102_0304, ChunkPartType::Standard);
        let mut buf = [0u8; SIGNATURE_SIZE];
        sig.serialize(&mut buf);
        let off = VERSION_OFFSET as usize;
        assert_eq!(&buf[off..off + 4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut buf = [0u8; SIGNATURE_SIZE];
        buf[0] = b'X';
        assert_eq!(ChunkSignature::parse(&buf), None);
    }

    #[test]
    fn test_read_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let sig = ChunkSignature::new(ChunkId(7), 3, ChunkPartType::Ec2 { part: 1, total: 2 });
        let mut buf = [0u8; SIGNATURE_SIZE];
        sig.serialize(&mut buf);
        tmp.write_all(&buf).unwrap();
        tmp.flush().unwrap();

        let parsed = ChunkSignature::read_from(tmp.as_file()).unwrap();
        assert_eq!(parsed, Some(sig));
    }

    #[test]
    fn test_read_from_short_file_is_io_error() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(ChunkSignature::read_from(tmp.as_file()).is_err());
    }
}
