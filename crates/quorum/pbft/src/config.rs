//! PBFT configuration

use crate::PbftError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File holding the persisted view, relative to [`PbftConfig::data_dir`].
pub const PBFT_DB_FILENAME: &str = "pbftdb.dat";

/// PBFT engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbftConfig {
    /// Ticks without progress before a view change is sent
    pub view_change_timeout: u32,
    /// Committed blocks with `num % checkpoint_interval == 1` become checkpoints
    pub checkpoint_interval: u32,
    /// Whether this node takes part in consensus
    pub bp_candidate: bool,
    /// Directory for the persisted view
    pub data_dir: PathBuf,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            view_change_timeout: 6,
            checkpoint_interval: 100,
            bp_candidate: true,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl PbftConfig {
    /// Default configuration rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Default::default() }
    }

    /// Read a JSON configuration file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PbftError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), PbftError> {
        if self.view_change_timeout == 0 {
            return Err(PbftError::InvalidConfig("view_change_timeout must be positive".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(PbftError::InvalidConfig("checkpoint_interval must be positive".into()));
        }
        Ok(())
    }

    /// Path of the persisted view file
    pub fn view_file(&self) -> PathBuf {
        self.data_dir.join(PBFT_DB_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_load_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pbft.json");
        std::fs::write(&path, r#"{"view_change_timeout": 3, "data_dir": "/tmp/pbft"}"#).unwrap();

        let config = PbftConfig::load(&path).unwrap();
        assert_eq!(config.view_change_timeout, 3);
        assert_eq!(config.checkpoint_interval, 100);
        assert!(config.bp_candidate);
        assert_eq!(config.view_file(), PathBuf::from("/tmp/pbft").join(PBFT_DB_FILENAME));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = PbftConfig { checkpoint_interval: 0, ..Default::default() };
        assert_matches!(config.validate(), Err(PbftError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pbft.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_matches!(PbftConfig::load(&path), Err(PbftError::Config(_)));
    }
}
