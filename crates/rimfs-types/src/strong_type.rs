/// Macro to create a strongly-typed identifier wrapping an unsigned integer.
///
/// Chunk identifiers travel through filenames, signature headers and log
/// lines in one canonical spelling: fixed-width uppercase hex (chunk id 0x42
/// renders as `0000000000000042`). The generated type owns that spelling —
/// `Display` and `to_hex` produce it, `from_hex` accepts exactly it — on top
/// of the usual id ergonomics: `Deref` to the raw integer, `From` in both
/// directions, ordering, hashing, and transparent serde (ids serialize as
/// bare numbers, not as hex strings).
#[macro_export]
macro_rules! strong_type {
    ($name:ident, $inner:ty, hex_digits = $digits:expr) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Width of the canonical hex spelling.
            pub const HEX_DIGITS: usize = $digits;

            /// Canonical fixed-width uppercase hex form, as spelled in chunk
            /// filenames.
            pub fn to_hex(&self) -> String {
                format!("{:0digits$X}", self.0, digits = $digits)
            }

            /// Parse the canonical fixed-width hex form. Any other length, a
            /// sign, or a non-hex digit is rejected.
            pub fn from_hex(s: &str) -> Option<Self> {
                if s.len() != $digits || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return None;
                }
                <$inner>::from_str_radix(s, 16).ok().map(Self)
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{:0digits$X}", self.0, digits = $digits)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}(0x{:X})", stringify!($name), self.0)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(raw: $inner) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::ids::{ChunkId, ChunkVersion};
    use std::collections::HashSet;

    #[test]
    fn test_display_matches_filename_spelling() {
        assert_eq!(ChunkId(0x42).to_string(), "0000000000000042");
        assert_eq!(ChunkVersion(7).to_string(), "00000007");
    }

    #[test]
    fn test_debug_shows_type_and_hex() {
        assert_eq!(format!("{:?}", ChunkId(0xDEAD_BEEF)), "ChunkId(0xDEADBEEF)");
        assert_eq!(format!("{:?}", ChunkVersion(0)), "ChunkVersion(0x0)");
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = ChunkId(u64::MAX);
        assert_eq!(ChunkId::from_hex(&id.to_hex()), Some(id));
        let v = ChunkVersion(0x1234);
        assert_eq!(ChunkVersion::from_hex(&v.to_hex()), Some(v));
    }

    #[test]
    fn test_from_hex_rejects_non_canonical() {
        // Wrong widths.
        assert_eq!(ChunkId::from_hex("42"), None);
        assert_eq!(ChunkId::from_hex("00000000000000042"), None);
        // Non-hex digit and sign.
        assert_eq!(ChunkVersion::from_hex("0000000G"), None);
        assert_eq!(ChunkVersion::from_hex("+0000007"), None);
    }

    #[test]
    fn test_raw_conversions() {
        let id: ChunkId = 0x1000u64.into();
        assert_eq!(*id, 0x1000);
        let raw: u64 = id.into();
        assert_eq!(raw, 0x1000);
    }

    #[test]
    fn test_usable_as_map_key() {
        let mut set = HashSet::new();
        set.insert(ChunkId(0x42));
        set.insert(ChunkId(0x43));
        set.insert(ChunkId(0x42));
        assert_eq!(set.len(), 2);
    }
}
