/// Status code type alias; codes fit in 16 bits so they travel cheaply in
/// wire replies.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const DATA_CORRUPTION: status_code_t = 2;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const QUEUE_EMPTY: status_code_t = 5;
    pub const INTERRUPTED: status_code_t = 27;
    pub const IO_ERROR: status_code_t = 69;
    pub const OS_ERROR: status_code_t = 72;
    pub const UNKNOWN: status_code_t = 999;
}

/// Chunk-storage status codes (4xxx), surfaced by the chunk engine.
pub mod ChunkCode {
    use super::status_code_t;

    pub const NO_CHUNK: status_code_t = 4000;
    pub const WRONG_VERSION: status_code_t = 4001;
    pub const WRONG_SIZE: status_code_t = 4002;
    pub const WRONG_OFFSET: status_code_t = 4003;
    pub const BNUM_TOO_BIG: status_code_t = 4004;
    pub const CRC_MISMATCH: status_code_t = 4005;
    pub const NO_SPACE: status_code_t = 4006;
    pub const CHUNK_EXISTS: status_code_t = 4007;
}

/// Human-readable name for a status code.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::DATA_CORRUPTION => "DataCorruption",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::QUEUE_EMPTY => "QueueEmpty",
        StatusCode::INTERRUPTED => "Interrupted",
        StatusCode::IO_ERROR => "IoError",
        StatusCode::OS_ERROR => "OsError",
        StatusCode::UNKNOWN => "Unknown",
        ChunkCode::NO_CHUNK => "Chunk::NoChunk",
        ChunkCode::WRONG_VERSION => "Chunk::WrongVersion",
        ChunkCode::WRONG_SIZE => "Chunk::WrongSize",
        ChunkCode::WRONG_OFFSET => "Chunk::WrongOffset",
        ChunkCode::BNUM_TOO_BIG => "Chunk::BlockNumberTooBig",
        ChunkCode::CRC_MISMATCH => "Chunk::CrcMismatch",
        ChunkCode::NO_SPACE => "Chunk::NoSpace",
        ChunkCode::CHUNK_EXISTS => "Chunk::ChunkExists",
        _ => "Invalid",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string_known_codes() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(ChunkCode::NO_CHUNK), "Chunk::NoChunk");
        assert_eq!(to_string(ChunkCode::CRC_MISMATCH), "Chunk::CrcMismatch");
    }

    #[test]
    fn test_to_string_unknown_code() {
        assert_eq!(to_string(12345), "Invalid");
    }
}
