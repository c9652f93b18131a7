//! Loading and hot-reloading of the chunkserver configuration.
//!
//! The daemon reads its TOML once at startup and again on demand. Readers
//! take lock-free snapshots through `arc-swap`; a reload applies the
//! hot-updatable fields and tells the caller what the engine has to do about
//! it — in particular whether the folder-list file moved, which forces a
//! re-read of the data folder set even when no engine option changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{Config, ConfigError, HddConfig};

/// What a reload changed, from the engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Some engine option changed (scrub frequency, fsync, chunk format,
    /// reserved space, ...). The engine should be handed the new config.
    pub options_changed: bool,
    /// The folder-list file path itself changed; the folder set must be
    /// re-read even if nothing else did.
    pub folder_list_moved: bool,
}

/// Owns the configuration file path and the live [`HddConfig`] snapshot.
pub struct ConfigManager {
    path: PathBuf,
    current: ArcSwap<HddConfig>,
}

impl ConfigManager {
    /// Read and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = read_config(&path)?;
        Ok(Self {
            current: ArcSwap::from_pointee(config),
            path,
        })
    }

    /// Lock-free handle to the live configuration.
    pub fn get(&self) -> arc_swap::Guard<Arc<HddConfig>> {
        self.current.load()
    }

    /// Owned copy of the live configuration.
    pub fn snapshot(&self) -> HddConfig {
        (*self.current.load_full()).clone()
    }

    /// The TOML file this manager re-reads on reload.
    pub fn config_path(&self) -> &Path {
        &self.path
    }

    /// Re-read the configuration file, apply the hot-updatable fields, and
    /// report what changed. A file that fails to parse or validate leaves
    /// the live configuration untouched.
    pub fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let newer = read_config(&self.path)?;
        let previous = self.current.load_full();

        let mut updated = (*previous).clone();
        updated.hot_update(&newer);

        let summary = ReloadSummary {
            options_changed: *previous != updated,
            folder_list_moved: previous.hdd_conf_filename != updated.hdd_conf_filename,
        };
        self.current.store(Arc::new(updated));

        if summary.options_changed {
            tracing::info!(file = %self.path.display(), "configuration reloaded");
        } else {
            tracing::debug!(file = %self.path.display(), "configuration unchanged on reload");
        }
        Ok(summary)
    }
}

fn read_config(path: &Path) -> Result<HddConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let value: toml::Value = content.parse()?;
    let config = HddConfig::from_toml(&value)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("chunkserver.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_reads_hdd_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
                [hdd]
                hdd_conf_filename = "/etc/rimfs/hdd.cfg"
                hdd_test_freq_secs = 2.0
            "#,
        );
        let manager = ConfigManager::load(&path).unwrap();
        assert_eq!(manager.get().test_freq_ms(), 2_000);
        assert_eq!(manager.config_path(), path.as_path());
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
                [hdd]
                leave_free_default = "plenty"
            "#,
        );
        assert!(ConfigManager::load(&path).is_err());
    }

    #[test]
    fn test_reload_reports_option_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[hdd]\nhdd_test_freq_secs = 10.0\n");
        let manager = ConfigManager::load(&path).unwrap();

        // Unchanged file: nothing to apply.
        let summary = manager.reload().unwrap();
        assert!(!summary.options_changed);
        assert!(!summary.folder_list_moved);

        std::fs::write(&path, "[hdd]\nhdd_test_freq_secs = 1.0\n").unwrap();
        let summary = manager.reload().unwrap();
        assert!(summary.options_changed);
        assert!(!summary.folder_list_moved);
        assert_eq!(manager.get().test_freq_ms(), 1_000);
    }

    #[test]
    fn test_reload_detects_folder_list_move() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[hdd]\nhdd_conf_filename = \"/a/hdd.cfg\"\n");
        let manager = ConfigManager::load(&path).unwrap();

        std::fs::write(&path, "[hdd]\nhdd_conf_filename = \"/b/hdd.cfg\"\n").unwrap();
        let summary = manager.reload().unwrap();
        assert!(summary.folder_list_moved);
        assert!(summary.options_changed);
    }

    #[test]
    fn test_failed_reload_keeps_live_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[hdd]\nhdd_test_freq_secs = 5.0\n");
        let manager = ConfigManager::load(&path).unwrap();

        std::fs::write(&path, "not toml at all [").unwrap();
        assert!(manager.reload().is_err());
        assert_eq!(manager.get().test_freq_ms(), 5_000);
    }
}
