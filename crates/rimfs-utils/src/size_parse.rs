//! Parser for human-readable sizes like `"256MiB"`, `"1G"` or `"0.5TiB"`.
//!
//! Decimal suffixes (k, M, G, T, P, E) are powers of 1000, binary suffixes
//! (Ki..Ei) are powers of 1024. A trailing `B` is optional in both forms.

/// Parse a human-readable size into bytes. Returns `None` on malformed input
/// or overflow.
pub fn parse_human_size(s: &str) -> Option<u64> {
    let bytes = s.as_bytes();
    let mut pos = 0usize;

    let mut val: u64 = 0;
    let mut have_digits = false;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        have_digits = true;
        val = val.checked_mul(10)?.checked_add((bytes[pos] - b'0') as u64)?;
        pos += 1;
    }

    let mut frac: u64 = 0;
    let mut frac_div: u64 = 1;
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            frac_div = frac_div.checked_mul(10)?;
            frac = frac.checked_mul(10)?.checked_add((bytes[pos] - b'0') as u64)?;
            pos += 1;
        }
        // A dot must be followed by digits.
        if frac_div == 1 {
            return None;
        }
    } else if !have_digits {
        return None;
    }

    let rest = &s[pos..];
    let mult: f64 = match rest {
        "" | "B" => 1.0,
        "k" | "kB" => 1e3,
        "M" | "MB" => 1e6,
        "G" | "GB" => 1e9,
        "T" | "TB" => 1e12,
        "P" | "PB" => 1e15,
        "E" | "EB" => 1e18,
        "Ki" | "KiB" => 1024.0,
        "Mi" | "MiB" => 1024f64.powi(2),
        "Gi" | "GiB" => 1024f64.powi(3),
        "Ti" | "TiB" => 1024f64.powi(4),
        "Pi" | "PiB" => 1024f64.powi(5),
        "Ei" | "EiB" => 1024f64.powi(6),
        _ => return None,
    };

    let value = (val as f64 + frac as f64 / frac_div as f64) * mult;
    let rounded = value.round();
    if rounded > u64::MAX as f64 {
        return None;
    }
    Some(rounded as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_human_size("0"), Some(0));
        assert_eq!(parse_human_size("12345"), Some(12345));
        assert_eq!(parse_human_size("100B"), Some(100));
    }

    #[test]
    fn test_decimal_suffixes() {
        assert_eq!(parse_human_size("1k"), Some(1_000));
        assert_eq!(parse_human_size("2MB"), Some(2_000_000));
        assert_eq!(parse_human_size("3G"), Some(3_000_000_000));
    }

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(parse_human_size("1KiB"), Some(1024));
        assert_eq!(parse_human_size("256MiB"), Some(256 * 1024 * 1024));
        assert_eq!(parse_human_size("4Gi"), Some(4 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_fractional() {
        assert_eq!(parse_human_size("0.5KiB"), Some(512));
        assert_eq!(parse_human_size(".25KiB"), Some(256));
        assert_eq!(parse_human_size("1.5M"), Some(1_500_000));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(parse_human_size(""), None);
        assert_eq!(parse_human_size("."), None);
        assert_eq!(parse_human_size("1."), None);
        assert_eq!(parse_human_size("MiB"), None);
        assert_eq!(parse_human_size("1XB"), None);
        assert_eq!(parse_human_size("1 MiB"), None);
    }
}
