strong_type!(ChunkId, u64, hex_digits = 16);
strong_type!(ChunkVersion, u32, hex_digits = 8);

impl ChunkVersion {
    /// Zero means "any version" in version-checked operations.
    pub const ANY: ChunkVersion = ChunkVersion(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digit_widths() {
        // 16 digits for ids, 8 for versions — the filename convention.
        assert_eq!(ChunkId::HEX_DIGITS, 16);
        assert_eq!(ChunkVersion::HEX_DIGITS, 8);
    }

    #[test]
    fn test_any_version() {
        assert_eq!(*ChunkVersion::ANY, 0);
    }

    #[test]
    fn test_serde_stays_numeric() {
        // Ids serialize as bare numbers, not as their hex spelling.
        let id = ChunkId(999);
        assert_eq!(serde_json::to_string(&id).unwrap(), "999");
        assert_eq!(serde_json::from_str::<ChunkId>("999").unwrap(), id);
    }

    #[test]
    fn test_ordering_follows_raw_value() {
        assert!(ChunkId(1) < ChunkId(0x100));
        assert!(ChunkVersion(2) > ChunkVersion(1));
    }
}
