//! TOML configuration for a [`MountableFs`](crate::MountableFs).
//!
//! ```toml
//! [pool]
//! max_instances = 4
//! acquire_timeout_ms = 5000
//!
//! [unmount]
//! policy = "wait"
//! wait_timeout_ms = 10000
//!
//! [plugins]
//! load = ["/usr/lib/muxfs/libhellofs.so"]
//!
//! [[mount]]
//! path = "/data"
//! plugin = "localfs"
//! config = { local_dir = "/srv/data", read_only = true }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::VfsError;
use crate::pool::{DrainPolicy, PoolConfig, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_MAX_INSTANCES};
use crate::types::MountConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    /// Applying the configuration failed.
    #[error(transparent)]
    Vfs(#[from] VfsError),
}

/// Pool defaults applied to every mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub max_instances: usize,
    /// 0 waits forever.
    pub acquire_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_instances: DEFAULT_MAX_INSTANCES,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: None,
        }
    }
}

/// What unmount does with instances still lent out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmountPolicy {
    #[default]
    Fail,
    Wait,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnmountSection {
    pub policy: UnmountPolicy,
    /// Only used with `policy = "wait"`; unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginsSection {
    /// Plugin modules loaded at startup, in order.
    pub load: Vec<PathBuf>,
}

/// One `[[mount]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountSection {
    pub path: String,
    pub plugin: String,
    #[serde(default, skip_serializing_if = "MountConfig::is_empty")]
    pub config: MountConfig,
    /// Overrides `pool.max_instances` for this mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<usize>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MuxConfig {
    pub pool: PoolSection,
    pub unmount: UnmountSection,
    pub plugins: PluginsSection,
    #[serde(rename = "mount", skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSection>,
}

impl MuxConfig {
    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_instances == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_instances must be at least 1".into(),
            ));
        }
        for mount in &self.mounts {
            if !mount.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "mount path must be absolute: {}",
                    mount.path
                )));
            }
            if mount.plugin.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mount {} has no plugin",
                    mount.path
                )));
            }
            if mount.max_instances == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "mount {}: max_instances must be at least 1",
                    mount.path
                )));
            }
        }
        Ok(())
    }

    /// Pool defaults as runtime settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_instances: self.pool.max_instances,
            acquire_timeout: match self.pool.acquire_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            idle_timeout: self.pool.idle_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Pool settings for one mount entry.
    pub fn pool_config_for(&self, mount: &MountSection) -> PoolConfig {
        let base = self.pool_config();
        match mount.max_instances {
            Some(max) => base.with_max_instances(max),
            None => base,
        }
    }

    /// Unmount behaviour as a drain policy.
    pub fn drain_policy(&self) -> DrainPolicy {
        match self.unmount.policy {
            UnmountPolicy::Fail => DrainPolicy::Fail,
            UnmountPolicy::Wait => DrainPolicy::Wait {
                timeout: self.unmount.wait_timeout_ms.map(Duration::from_millis),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MuxConfig::from_toml("").unwrap();
        assert_eq!(config.pool.max_instances, 10);
        assert_eq!(config.pool_config().acquire_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.pool_config().idle_timeout, None);
        assert_eq!(config.drain_policy(), DrainPolicy::Fail);
        assert!(config.mounts.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = MuxConfig::from_toml(
            r#"
            [pool]
            max_instances = 4
            acquire_timeout_ms = 0
            idle_timeout_ms = 60000

            [unmount]
            policy = "wait"
            wait_timeout_ms = 500

            [plugins]
            load = ["/opt/muxfs/libhellofs.so"]

            [[mount]]
            path = "/mem"
            plugin = "memfs"

            [[mount]]
            path = "/data"
            plugin = "localfs"
            max_instances = 2

            [mount.config]
            local_dir = "/srv/data"
            read_only = true
            "#,
        )
        .unwrap();

        let pool = config.pool_config();
        assert_eq!(pool.max_instances, 4);
        assert_eq!(pool.acquire_timeout, None);
        assert_eq!(pool.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(
            config.drain_policy(),
            DrainPolicy::Wait {
                timeout: Some(Duration::from_millis(500))
            }
        );
        assert_eq!(config.plugins.load, vec![PathBuf::from("/opt/muxfs/libhellofs.so")]);

        assert_eq!(config.mounts.len(), 2);
        assert!(config.mounts[0].config.is_empty());
        let data = &config.mounts[1];
        assert_eq!(data.config.get_str("local_dir"), Some("/srv/data"));
        assert_eq!(data.config.get_bool("read_only"), Some(true));
        assert_eq!(config.pool_config_for(data).max_instances, 2);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            MuxConfig::from_toml("[pool]\nmax_instances = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MuxConfig::from_toml("[[mount]]\npath = \"relative\"\nplugin = \"memfs\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MuxConfig::from_toml("[unmount]\npolicy = \"maybe\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            MuxConfig::from_toml("[pool]\nmax_instancez = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = MuxConfig::load("/no/such/muxfs.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
