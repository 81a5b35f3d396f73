//! Configuration surface for the xCAT deployment driver.
//!
//! All options have defaults so a minimal YAML file (or none at all)
//! yields a working local configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::session::{AuthMethod, SshCredential};

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Driver configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XcatConfig {
    /// IP address of the network-controller management endpoint.
    pub network_node_ip: String,
    /// SSH port on the management endpoint.
    pub ssh_port: u16,
    /// SSH username on the management endpoint.
    pub ssh_user: String,
    /// SSH password. Also answers in-band password re-prompts.
    pub ssh_password: Option<String>,
    /// SSH private key file. Preferred over the password when present.
    pub ssh_key_file: Option<PathBuf>,
    /// Passphrase for the private key, if it has one.
    pub ssh_key_passphrase: Option<String>,
    /// Bound on SSH connect/auth and blocking channel operations, seconds.
    pub ssh_session_timeout_secs: u64,
    /// Poll interval while waiting for the remote shell prompt, seconds.
    pub ssh_login_wait_secs: u64,
    /// Settle time after sending each command, milliseconds.
    pub ssh_shell_wait_ms: u64,
    /// Receive buffer size for shell output, bytes.
    pub ssh_buf_size: usize,
    /// Path of the hostname-to-IP table maintained for DHCP.
    pub host_filepath: PathBuf,
    /// Minimum interval between commands against the same node, seconds.
    pub min_command_interval_secs: u64,
    /// Filesystem format used for ephemeral partitions when none is given.
    pub default_ephemeral_format: String,
    /// Base URL of the deployment API the booted ramdisk calls back into.
    pub api_url: Option<Url>,
    /// Base URL of the network-controller API.
    pub network_api_url: Option<Url>,
    /// Base URL of the image-catalog API.
    pub image_api_url: Option<Url>,
    /// Maximum size of the master image cache, MiB. Not used by this
    /// driver's scope; accepted so one config file serves the whole group.
    pub image_cache_size_mib: u64,
    /// TTL for old master images in the cache, minutes. See above.
    pub image_cache_ttl_minutes: u64,
}

impl Default for XcatConfig {
    fn default() -> Self {
        Self {
            network_node_ip: "127.0.0.1".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_password: None,
            ssh_key_file: None,
            ssh_key_passphrase: None,
            ssh_session_timeout_secs: 10,
            ssh_login_wait_secs: 3,
            ssh_shell_wait_ms: 500,
            ssh_buf_size: 65535,
            host_filepath: PathBuf::from("/etc/hosts"),
            min_command_interval_secs: 5,
            default_ephemeral_format: "ext4".to_string(),
            api_url: None,
            network_api_url: None,
            image_api_url: None,
            image_cache_size_mib: 1024,
            image_cache_ttl_minutes: 60,
        }
    }
}

impl XcatConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The SSH credential for the management endpoint, key preferred.
    #[must_use]
    pub fn ssh_credential(&self) -> SshCredential {
        let method = match &self.ssh_key_file {
            Some(path) => AuthMethod::Key {
                path: path.clone(),
                passphrase: self.ssh_key_passphrase.clone(),
            },
            None => AuthMethod::Password,
        };

        SshCredential {
            username: self.ssh_user.clone(),
            method,
            password: self.ssh_password.clone(),
        }
    }

    /// Management endpoint as `host:port`.
    #[must_use]
    pub fn ssh_endpoint(&self) -> String {
        format!("{}:{}", self.network_node_ip, self.ssh_port)
    }

    /// Session connect/auth timeout.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_session_timeout_secs)
    }

    /// Poll interval while waiting for shell readiness.
    #[must_use]
    pub fn login_wait(&self) -> Duration {
        Duration::from_secs(self.ssh_login_wait_secs)
    }

    /// Per-command settle interval.
    #[must_use]
    pub fn shell_wait(&self) -> Duration {
        Duration::from_millis(self.ssh_shell_wait_ms)
    }

    /// Minimum inter-command interval per target node.
    #[must_use]
    pub fn min_command_interval(&self) -> Duration {
        Duration::from_secs(self.min_command_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = XcatConfig::default();
        assert_eq!(config.network_node_ip, "127.0.0.1");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.ssh_session_timeout_secs, 10);
        assert_eq!(config.host_filepath, PathBuf::from("/etc/hosts"));
        assert_eq!(config.default_ephemeral_format, "ext4");
        assert!(config.api_url.is_none());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "network_node_ip: 10.1.2.3\nssh_user: admin\nssh_password: cluster\n";
        let config: XcatConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network_node_ip, "10.1.2.3");
        assert_eq!(config.ssh_user, "admin");
        // Untouched options keep their defaults.
        assert_eq!(config.ssh_buf_size, 65535);
        assert_eq!(config.min_command_interval_secs, 5);
    }

    #[test]
    fn test_credential_prefers_key() {
        let config = XcatConfig {
            ssh_password: Some("cluster".to_string()),
            ssh_key_file: Some(PathBuf::from("/root/.ssh/id_ed25519")),
            ..XcatConfig::default()
        };

        let cred = config.ssh_credential();
        assert!(matches!(cred.method, AuthMethod::Key { .. }));
        assert_eq!(cred.password.as_deref(), Some("cluster"));
    }

    #[test]
    fn test_ssh_endpoint_format() {
        let config = XcatConfig {
            network_node_ip: "192.0.2.10".to_string(),
            ssh_port: 2222,
            ..XcatConfig::default()
        };
        assert_eq!(config.ssh_endpoint(), "192.0.2.10:2222");
    }
}
