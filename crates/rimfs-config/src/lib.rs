mod hdd;
mod manager;

pub use hdd::HddConfig;
pub use manager::{ConfigManager, ReloadSummary};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A configuration section that can be loaded from TOML, validated, and
/// hot-updated on reload.
pub trait Config: Sized + Send + Sync + 'static {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError>;

    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Apply the hot-updatable fields of `newer` onto `self`.
    fn hot_update(&mut self, newer: &Self);
}
