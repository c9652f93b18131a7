//! Chunk filename parsing.
//!
//! Recognized forms (id is 16 hex digits, version 8 hex digits):
//!
//! ```text
//! chunk_<id>_<version>.csf
//! chunk_ec2_<part>_of_<total>_<id>_<version>.cif
//! chunk_ec_<part>_of_<total>_<id>_<version>.cif     (legacy EC naming)
//! ```
//!
//! The extension selects the format: `.csf` split, `.cif` interleaved.

use rimfs_types::{ChunkId, ChunkVersion};

use crate::chunk::{ChunkFormat, ChunkPartType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedChunkFilename {
    pub id: ChunkId,
    pub version: u32,
    pub part_type: ChunkPartType,
    pub format: ChunkFormat,
    /// True for legacy `_ec_` names, which the scanner renames or deletes.
    pub legacy_ec: bool,
}

/// Parse a chunk filename. Returns `None` for anything that is not a
/// well-formed chunk name.
pub fn parse_chunk_filename(name: &str) -> Option<ParsedChunkFilename> {
    let rest = name.strip_prefix("chunk_")?;

    let (format, rest) = if let Some(r) = rest.strip_suffix(".csf") {
        (ChunkFormat::Split, r)
    } else if let Some(r) = rest.strip_suffix(".cif") {
        (ChunkFormat::Interleaved, r)
    } else {
        return None;
    };

    let (part_type, legacy_ec, rest) = if let Some(r) = rest.strip_prefix("ec2_") {
        let (pt, r) = parse_ec_parts(r)?;
        (pt, false, r)
    } else if let Some(r) = rest.strip_prefix("ec_") {
        let (pt, r) = parse_ec_parts(r)?;
        (pt, true, r)
    } else {
        (ChunkPartType::Standard, false, rest)
    };

    // <id>_<version>, both in their canonical fixed-width hex spelling.
    let mut halves = rest.splitn(2, '_');
    let id = ChunkId::from_hex(halves.next()?)?;
    let version = *ChunkVersion::from_hex(halves.next()?)?;

    Some(ParsedChunkFilename {
        id,
        version,
        part_type,
        format,
        legacy_ec,
    })
}

/// Parse `<part>_of_<total>_` and return the remaining tail.
fn parse_ec_parts(s: &str) -> Option<(ChunkPartType, &str)> {
    let (part_str, rest) = s.split_once('_')?;
    let rest = rest.strip_prefix("of_")?;
    let (total_str, rest) = rest.split_once('_')?;
    let part: u8 = part_str.parse().ok()?;
    let total: u8 = total_str.parse().ok()?;
    if !(2..=15).contains(&total) || part < 1 || part > total {
        return None;
    }
    Some((ChunkPartType::Ec2 { part, total }, rest))
}
