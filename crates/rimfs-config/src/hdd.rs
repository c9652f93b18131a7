use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Config, ConfigError};

/// Chunk-storage engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HddConfig {
    /// Path to the data-folder list file (one `[*]PATH` per line).
    pub hdd_conf_filename: PathBuf,

    /// Seconds between scrubber ticks; clamped to [1e-3, 1e6].
    pub hdd_test_freq_secs: f64,

    /// Apply POSIX_FADV_DONTNEED after I/O.
    pub advise_no_cache: bool,

    /// Fsync chunk files on I/O end when dirty.
    pub perform_fsync: bool,

    /// Punch holes for sparse writes where the filesystem supports it.
    pub punch_holes: bool,

    /// Create new chunks in the split format (signature header + CRC table);
    /// when false, new chunks use the interleaved format.
    pub create_new_chunks_in_split_format: bool,

    /// Minimum free space kept on each data folder, e.g. "4GiB" or "256MiB".
    pub leave_free_default: String,
}

impl Default for HddConfig {
    fn default() -> Self {
        Self {
            hdd_conf_filename: PathBuf::from("/etc/rimfs/hdd.cfg"),
            hdd_test_freq_secs: 10.0,
            advise_no_cache: false,
            perform_fsync: true,
            punch_holes: false,
            create_new_chunks_in_split_format: true,
            leave_free_default: "4GiB".to_string(),
        }
    }
}

impl HddConfig {
    /// Scrubber tick period in milliseconds, clamped to the supported range.
    pub fn test_freq_ms(&self) -> u32 {
        (self.hdd_test_freq_secs.clamp(1e-3, 1e6) * 1000.0) as u32
    }

    /// Reserved free space in bytes.
    pub fn leave_free_bytes(&self) -> Option<u64> {
        rimfs_utils::parse_human_size(&self.leave_free_default)
    }
}

impl Config for HddConfig {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        // The engine section lives under [hdd] when embedded in a larger
        // service config; a bare table works too.
        let section = value.get("hdd").unwrap_or(value);
        section
            .clone()
            .try_into()
            .map_err(ConfigError::Parse)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.hdd_test_freq_secs.is_finite() || self.hdd_test_freq_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "hdd_test_freq_secs must be positive, got {}",
                self.hdd_test_freq_secs
            )));
        }
        if self.leave_free_bytes().is_none() {
            return Err(ConfigError::Invalid(format!(
                "leave_free_default is not a valid size: {:?}",
                self.leave_free_default
            )));
        }
        Ok(())
    }

    fn hot_update(&mut self, newer: &Self) {
        // Every engine option is safe to change at reload time.
        *self = newer.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = HddConfig::default();
        assert_eq!(cfg.test_freq_ms(), 10_000);
        assert!(cfg.perform_fsync);
        assert!(cfg.create_new_chunks_in_split_format);
        assert_eq!(cfg.leave_free_bytes(), Some(4 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_from_toml_hdd_section() {
        let value: toml::Value = r#"
            [hdd]
            hdd_conf_filename = "/tmp/hdd.cfg"
            hdd_test_freq_secs = 0.5
            punch_holes = true
            leave_free_default = "256MiB"
        "#
        .parse()
        .unwrap();
        let cfg = HddConfig::from_toml(&value).unwrap();
        assert_eq!(cfg.hdd_conf_filename, PathBuf::from("/tmp/hdd.cfg"));
        assert_eq!(cfg.test_freq_ms(), 500);
        assert!(cfg.punch_holes);
        assert_eq!(cfg.leave_free_bytes(), Some(256 * 1024 * 1024));
    }

    #[test]
    fn test_freq_clamped() {
        let mut cfg = HddConfig::default();
        cfg.hdd_test_freq_secs = 1e-9;
        assert_eq!(cfg.test_freq_ms(), 1);
        cfg.hdd_test_freq_secs = 1e9;
        assert_eq!(cfg.test_freq_ms(), 1_000_000_000);
    }

    #[test]
    fn test_validate_rejects_bad_size() {
        let mut cfg = HddConfig::default();
        cfg.leave_free_default = "lots".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_freq() {
        let mut cfg = HddConfig::default();
        cfg.hdd_test_freq_secs = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_hot_update_replaces_all() {
        let mut cfg = HddConfig::default();
        let mut newer = HddConfig::default();
        newer.advise_no_cache = true;
        newer.hdd_test_freq_secs = 2.0;
        cfg.hot_update(&newer);
        assert!(cfg.advise_no_cache);
        assert_eq!(cfg.test_freq_ms(), 2_000);
    }
}
