use serde::{Deserialize, Serialize};

use crate::error::{Result, SiloError};
use crate::id::Id;

/// Current repository format version.
pub const REPO_VERSION: u32 = 1;

/// Persisted encrypted at the fixed `config` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    /// Random repository identity, also naming the local cache directory.
    pub id: String,
    /// Polynomial used by the content-defined chunker that produced the
    /// repository's data blobs. Carried verbatim; chunking happens in the
    /// writers that feed this library.
    pub chunker_polynomial: String,
}

impl RepoConfig {
    pub fn generate() -> Self {
        RepoConfig {
            version: REPO_VERSION,
            id: Id::random().to_hex(),
            chunker_polynomial: "3dea92648f6e83".to_string(),
        }
    }

    pub fn repo_id(&self) -> Result<Id> {
        Id::parse(&self.id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != REPO_VERSION {
            return Err(SiloError::UnsupportedVersion(self.version));
        }
        self.repo_id()?;
        if self.chunker_polynomial.is_empty() {
            return Err(SiloError::Config("missing chunker polynomial".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_is_valid() {
        let config = RepoConfig::generate();
        config.validate().unwrap();
        assert_eq!(config.version, REPO_VERSION);
        assert_eq!(config.id.len(), 64);
    }

    #[test]
    fn rejects_future_version() {
        let mut config = RepoConfig::generate();
        config.version = 99;
        assert!(matches!(
            config.validate(),
            Err(SiloError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn wire_format() {
        let config = RepoConfig::generate();
        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&config).unwrap()).unwrap();
        assert!(value.get("version").is_some());
        assert!(value.get("id").is_some());
        assert!(value.get("chunker_polynomial").is_some());
    }
}
