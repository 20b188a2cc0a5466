//! Per-repository configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Acting-principal configuration for one repository
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Path to the hex-encoded signing key used by record operations
    /// when no key is passed explicitly
    pub signing_key: Option<PathBuf>,

    /// Display name of the acting principal
    pub author_name: Option<String>,
}

impl RepoConfig {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_is_default() {
        let dir = TempDir::new().unwrap();
        let config = RepoConfig::load(&dir.path().join("config.json")).unwrap();
        assert!(config.signing_key.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let config = RepoConfig {
            signing_key: Some(PathBuf::from("/keys/alice")),
            author_name: Some("Alice".to_string()),
        };
        config.save(&path).unwrap();

        let loaded = RepoConfig::load(&path).unwrap();
        assert_eq!(loaded.signing_key, config.signing_key);
        assert_eq!(loaded.author_name, config.author_name);
    }
}
