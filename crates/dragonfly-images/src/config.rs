//! Cluster configuration
//!
//! The boot image service needs two facts from configuration: where the
//! resource root lives and which GnuPG home to verify signatures with. Both
//! come from a YAML file that is read once and cached for the life of the
//! process.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Default location of the cluster config file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dragonfly/cluster.yaml";

/// Default resource root served over TFTP
pub const DEFAULT_RESOURCE_ROOT: &str = "/var/lib/dragonfly/boot-resources";

/// Default GnuPG home used while importing
pub const DEFAULT_GNUPG_HOME: &str = "/var/lib/dragonfly/gnupg";

/// TFTP section of the cluster config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TftpConfig {
    #[serde(default = "default_resource_root")]
    pub resource_root: PathBuf,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            resource_root: default_resource_root(),
        }
    }
}

fn default_resource_root() -> PathBuf {
    PathBuf::from(DEFAULT_RESOURCE_ROOT)
}

/// Cluster configuration as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub tftp: TftpConfig,
    /// Overrides the GnuPG home used by imports
    #[serde(default)]
    pub gnupg_home: Option<PathBuf>,
}

impl ClusterConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(path: &Path, yaml: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = if yaml.trim().is_empty() {
            ClusterConfig::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tftp.resource_root.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "tftp.resource_root must be an absolute path, got {}",
                self.tftp.resource_root.display()
            )));
        }
        if let Some(home) = &self.gnupg_home {
            if !home.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "gnupg_home must be an absolute path, got {}",
                    home.display()
                )));
            }
        }
        Ok(())
    }

    pub fn resource_root(&self) -> &Path {
        &self.tftp.resource_root
    }

    /// GnuPG home exported to imports as `GNUPGHOME`
    pub fn gnupg_home(&self) -> PathBuf {
        self.gnupg_home
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_GNUPG_HOME))
    }
}

/// Where the service reads its configuration from
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Arc<ClusterConfig>, ConfigError>;
}

/// Config backed by a YAML file, parsed on first use and cached afterwards
///
/// A missing file yields the defaults. Parse and validation failures are
/// not cached, so fixing the file takes effect on the next call.
pub struct ConfigFile {
    path: PathBuf,
    cached: RwLock<Option<Arc<ClusterConfig>>>,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ClusterConfig, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(yaml) => {
                let config = ClusterConfig::from_yaml(&self.path, &yaml)?;
                info!(path = %self.path.display(), "Loaded cluster config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Cluster config not found, using defaults");
                Ok(ClusterConfig::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl ConfigSource for ConfigFile {
    fn load(&self) -> Result<Arc<ClusterConfig>, ConfigError> {
        if let Ok(cached) = self.cached.read() {
            if let Some(config) = cached.as_ref() {
                return Ok(config.clone());
            }
        }

        let config = Arc::new(self.read()?);
        if let Ok(mut cached) = self.cached.write() {
            *cached = Some(config.clone());
        }
        Ok(config)
    }
}

/// Fixed in-memory configuration
#[derive(Debug, Clone)]
pub struct StaticConfig(Arc<ClusterConfig>);

impl StaticConfig {
    pub fn new(config: ClusterConfig) -> Self {
        Self(Arc::new(config))
    }

    /// Config with only the resource root set
    pub fn with_resource_root(resource_root: impl Into<PathBuf>) -> Self {
        Self::new(ClusterConfig {
            tftp: TftpConfig {
                resource_root: resource_root.into(),
            },
            gnupg_home: None,
        })
    }
}

impl ConfigSource for StaticConfig {
    fn load(&self) -> Result<Arc<ClusterConfig>, ConfigError> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_config() {
        let yaml = "tftp:\n  resource_root: /srv/boot\ngnupg_home: /srv/gnupg\n";
        let config = ClusterConfig::from_yaml(Path::new("cluster.yaml"), yaml).unwrap();
        assert_eq!(config.resource_root(), Path::new("/srv/boot"));
        assert_eq!(config.gnupg_home(), PathBuf::from("/srv/gnupg"));
    }

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::from_yaml(Path::new("cluster.yaml"), "").unwrap();
        assert_eq!(config.resource_root(), Path::new(DEFAULT_RESOURCE_ROOT));
        assert_eq!(config.gnupg_home(), PathBuf::from(DEFAULT_GNUPG_HOME));

        let config = ClusterConfig::from_yaml(Path::new("cluster.yaml"), "tftp: {}\n").unwrap();
        assert_eq!(config.resource_root(), Path::new(DEFAULT_RESOURCE_ROOT));
    }

    #[test]
    fn test_relative_paths_rejected() {
        let err = ClusterConfig::from_yaml(
            Path::new("cluster.yaml"),
            "tftp:\n  resource_root: boot\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = ClusterConfig::from_yaml(Path::new("cluster.yaml"), "gnupg_home: .gnupg\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = ClusterConfig::from_yaml(Path::new("cluster.yaml"), "tftp: [1, 2")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_config_file_missing_uses_defaults() {
        let dir = tempdir().unwrap();
        let source = ConfigFile::new(dir.path().join("absent.yaml"));
        let config = source.load().unwrap();
        assert_eq!(config.resource_root(), Path::new(DEFAULT_RESOURCE_ROOT));
    }

    #[test]
    fn test_config_file_is_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(&path, "tftp:\n  resource_root: /srv/first\n").unwrap();

        let source = ConfigFile::new(&path);
        assert_eq!(source.load().unwrap().resource_root(), Path::new("/srv/first"));

        std::fs::write(&path, "tftp:\n  resource_root: /srv/second\n").unwrap();
        assert_eq!(source.load().unwrap().resource_root(), Path::new("/srv/first"));
    }

    #[test]
    fn test_static_config_validates() {
        let source = StaticConfig::with_resource_root("relative/root");
        assert!(matches!(source.load(), Err(ConfigError::Invalid(_))));
    }
}
