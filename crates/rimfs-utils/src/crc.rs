//! CRC32 helpers for the per-block integrity protocol.
//!
//! The hashing itself is `crc32fast` (standard zlib polynomial); this module
//! adds the pieces the chunk engine needs on top: continuing a checksum from a
//! previous value, checksums of all-zero runs, zero-extension of a partial
//! block, and combining two independent checksums without touching the data.

/// CRC32 of `data`, continuing from `init` (pass 0 to start fresh).
pub fn crc32(init: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(init);
    hasher.update(data);
    hasher.finalize()
}

const ZERO_CHUNK: [u8; 4096] = [0u8; 4096];

/// CRC32 of `len` zero bytes, continuing from `init`.
pub fn crc32_zero_block(init: u32, mut len: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(init);
    while len > 0 {
        let n = len.min(ZERO_CHUNK.len());
        hasher.update(&ZERO_CHUNK[..n]);
        len -= n;
    }
    hasher.finalize()
}

/// CRC32 of `data` followed by `zeros` zero bytes, continuing from `init`.
pub fn crc32_zero_expanded(init: u32, data: &[u8], zeros: usize) -> u32 {
    crc32_zero_block(crc32(init, data), zeros)
}

// crc32_combine below is the classic zlib GF(2) matrix trick: the CRC of a
// concatenation A|B can be computed from crc(A), crc(B) and len(B) alone.

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0u32;
    let mut i = 0usize;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// Combine `crc1` (over some prefix) with `crc2` (over a suffix of `len2`
/// bytes) into the CRC32 of the concatenated data.
pub fn crc32_combine(crc1: u32, crc2: u32, mut len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u32; 32];
    let mut odd = [0u32; 32];

    // Operator for one zero bit: the reflected CRC-32 polynomial.
    odd[0] = 0xEDB8_8320;
    let mut row = 1u32;
    for item in odd.iter_mut().skip(1) {
        *item = row;
        row <<= 1;
    }

    // Square to get operators for two and four zero bits.
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc1 = crc1;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_matches_reference() {
        // Known CRC32 of "123456789".
        assert_eq!(crc32(0, b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_chaining() {
        let whole = crc32(0, b"hello world");
        let part = crc32(crc32(0, b"hello "), b"world");
        assert_eq!(whole, part);
    }

    #[test]
    fn test_zero_block_equals_explicit_zeros() {
        let zeros = vec![0u8; 10_000];
        assert_eq!(crc32_zero_block(0, zeros.len()), crc32(0, &zeros));
    }

    #[test]
    fn test_zero_expanded() {
        let data = b"abcdef";
        let mut full = data.to_vec();
        full.extend_from_slice(&[0u8; 100]);
        assert_eq!(crc32_zero_expanded(0, data, 100), crc32(0, &full));
    }

    #[test]
    fn test_combine_splits() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let whole = crc32(0, data);
        for split in [0usize, 1, 7, 20, data.len()] {
            let (a, b) = data.split_at(split);
            let combined = crc32_combine(crc32(0, a), crc32(0, b), b.len() as u64);
            assert_eq!(combined, whole, "split at {}", split);
        }
    }

    #[test]
    fn test_combine_zero_len() {
        assert_eq!(crc32_combine(0x1234_5678, 0, 0), 0x1234_5678);
    }

    #[test]
    fn test_combine_with_zero_suffix() {
        // combine(crc(data), crc(zeros), len) must equal zero-expansion.
        let data = b"partial block";
        let zeros = 5000usize;
        let combined = crc32_combine(
            crc32(0, data),
            crc32_zero_block(0, zeros),
            zeros as u64,
        );
        assert_eq!(combined, crc32_zero_expanded(0, data, zeros));
    }
}
