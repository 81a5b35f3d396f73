//! Task and node data model shared with the orchestration framework.
//!
//! A [`ProvisioningTask`] is the transient handle through which the external
//! framework exposes one node and its mutable deployment metadata to this
//! driver. The framework owns locking; this driver only declares which
//! phases require the exclusive lock and fails fast when it is absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DeployError;

/// Keys this driver reads and writes in the `instance_info` bag.
pub const FIXED_IP_KEY: &str = "fixed_ip_address";
pub const IMAGE_NAME_KEY: &str = "image_name";

/// Deployment states reported back to the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployState {
    /// Deployment side effects are being issued.
    Deploying,
    /// Reboot requested; waiting for the ramdisk to call back.
    DeployWait,
    /// Tear-down completed, node powered off.
    Deleted,
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploying => write!(f, "deploying"),
            Self::DeployWait => write!(f, "deploywait"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A physical machine under provisioning management.
///
/// `driver_info` and `instance_info` are loosely-typed bags owned by the
/// framework; [`DeployInfo::from_node`] extracts and validates the fields
/// this driver needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable node identifier.
    pub uuid: Uuid,
    /// Static driver configuration (management-system node name).
    #[serde(default)]
    pub driver_info: serde_json::Map<String, Value>,
    /// Deployment-time facts about the workload being provisioned.
    #[serde(default)]
    pub instance_info: serde_json::Map<String, Value>,
    /// MAC addresses of the ports associated with this node.
    #[serde(default)]
    pub mac_addresses: Vec<String>,
}

impl Node {
    /// The management-system node name from `driver_info`, when set.
    #[must_use]
    pub fn xcat_node(&self) -> Option<String> {
        string_param(&self.driver_info, "xcat_node")
    }
}

/// Handle for one workflow invocation against one node.
#[derive(Debug, Clone)]
pub struct ProvisioningTask {
    /// The node being acted on.
    pub node: Node,
    exclusive: bool,
}

impl ProvisioningTask {
    /// Wrap a node without the exclusive lock.
    #[must_use]
    pub fn new(node: Node) -> Self {
        Self {
            node,
            exclusive: false,
        }
    }

    /// Wrap a node with the framework's exclusive per-node lock held.
    #[must_use]
    pub fn with_exclusive_lock(node: Node) -> Self {
        Self {
            node,
            exclusive: true,
        }
    }

    /// Fail fast unless the exclusive lock is held. Never blocks.
    ///
    /// # Errors
    /// Returns [`DeployError::LockRequired`] when the lock is absent.
    pub fn require_exclusive_lock(&self) -> Result<(), DeployError> {
        if self.exclusive {
            Ok(())
        } else {
            Err(DeployError::LockRequired {
                node: self.node.uuid,
            })
        }
    }
}

/// Validated deployment info extracted from a node's info bags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployInfo {
    /// Management-system name of the node.
    pub xcat_node: String,
    /// Image identifier in the catalog.
    pub image_source: String,
    /// Root partition size, GiB.
    pub root_gb: i64,
    /// Swap size, MiB.
    pub swap_mb: i64,
    /// Ephemeral partition size, GiB.
    pub ephemeral_gb: i64,
    /// Filesystem format for the ephemeral partition.
    pub ephemeral_format: Option<String>,
    /// Keep the ephemeral partition across redeployments.
    pub preserve_ephemeral: bool,
    /// Fixed IP resolved during `prepare`, if already stored.
    pub fixed_ip: Option<String>,
    /// Image name resolved during `prepare`, if already stored.
    pub image_name: Option<String>,
}

impl DeployInfo {
    /// Extract and validate deployment info from a node.
    ///
    /// # Errors
    /// Returns [`DeployError::InvalidParameter`] naming the missing or
    /// malformed parameter.
    pub fn from_node(node: &Node, default_ephemeral_format: &str) -> Result<Self, DeployError> {
        let mut missing = Vec::new();

        let xcat_node = string_param(&node.driver_info, "xcat_node");
        if xcat_node.is_none() {
            missing.push("xcat_node");
        }
        let image_source = string_param(&node.instance_info, "image_source");
        if image_source.is_none() {
            missing.push("image_source");
        }
        if !node.instance_info.contains_key("root_gb") {
            missing.push("root_gb");
        }
        if !missing.is_empty() {
            return Err(DeployError::InvalidParameter(format!(
                "cannot validate deployment, the following parameters were not passed: {missing:?}"
            )));
        }

        let root_gb = int_param(&node.instance_info, "root_gb")?;
        let swap_mb = int_param_or(&node.instance_info, "swap_mb", 0)?;
        let ephemeral_gb = int_param_or(&node.instance_info, "ephemeral_gb", 0)?;

        let mut ephemeral_format = string_param(&node.instance_info, "ephemeral_format");
        if ephemeral_gb > 0 && ephemeral_format.is_none() {
            ephemeral_format = Some(default_ephemeral_format.to_string());
        }

        let preserve_ephemeral = bool_param_or(&node.instance_info, "preserve_ephemeral", false)?;

        Ok(Self {
            // Presence was checked above.
            xcat_node: xcat_node.unwrap_or_default(),
            image_source: image_source.unwrap_or_default(),
            root_gb,
            swap_mb,
            ephemeral_gb,
            ephemeral_format,
            preserve_ephemeral,
            fixed_ip: string_param(&node.instance_info, FIXED_IP_KEY),
            image_name: string_param(&node.instance_info, IMAGE_NAME_KEY),
        })
    }
}

fn string_param(bag: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match bag.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn int_param(bag: &serde_json::Map<String, Value>, key: &str) -> Result<i64, DeployError> {
    match bag.get(key) {
        Some(Value::Number(n)) if n.is_i64() => Ok(n.as_i64().unwrap_or_default()),
        Some(Value::String(s)) => s.parse::<i64>().map_err(|_| invalid_int(key, s)),
        Some(other) => Err(invalid_int(key, &other.to_string())),
        None => Err(DeployError::InvalidParameter(format!(
            "missing parameter '{key}'"
        ))),
    }
}

fn int_param_or(
    bag: &serde_json::Map<String, Value>,
    key: &str,
    default: i64,
) -> Result<i64, DeployError> {
    if bag.contains_key(key) {
        int_param(bag, key)
    } else {
        Ok(default)
    }
}

fn invalid_int(key: &str, value: &str) -> DeployError {
    DeployError::InvalidParameter(format!(
        "invalid parameter {key}: '{value}' is not an integer value"
    ))
}

/// Strict boolean parse: booleans and the usual true/false spellings only.
fn bool_param_or(
    bag: &serde_json::Map<String, Value>,
    key: &str,
    default: bool,
) -> Result<bool, DeployError> {
    match bag.get(key) {
        None => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "on" | "1" => Ok(true),
            "false" | "f" | "no" | "n" | "off" | "0" => Ok(false),
            _ => Err(DeployError::InvalidParameter(format!(
                "invalid parameter {key}: '{s}' is not a boolean value"
            ))),
        },
        Some(other) => Err(DeployError::InvalidParameter(format!(
            "invalid parameter {key}: '{other}' is not a boolean value"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_node() -> Node {
        let mut node = Node {
            uuid: Uuid::new_v4(),
            driver_info: serde_json::Map::new(),
            instance_info: serde_json::Map::new(),
            mac_addresses: vec!["aa:bb:cc:dd:ee:ff".to_string()],
        };
        node.driver_info
            .insert("xcat_node".to_string(), json!("node01"));
        node.instance_info
            .insert("image_source".to_string(), json!("img-123"));
        node.instance_info.insert("root_gb".to_string(), json!(10));
        node
    }

    #[test]
    fn test_parse_minimal_node() {
        let node = test_node();
        let info = DeployInfo::from_node(&node, "ext4").unwrap();
        assert_eq!(info.xcat_node, "node01");
        assert_eq!(info.image_source, "img-123");
        assert_eq!(info.root_gb, 10);
        assert_eq!(info.swap_mb, 0);
        assert_eq!(info.ephemeral_gb, 0);
        assert!(info.ephemeral_format.is_none());
        assert!(!info.preserve_ephemeral);
        assert!(info.fixed_ip.is_none());
    }

    #[test]
    fn test_missing_params_are_named() {
        let mut node = test_node();
        node.instance_info.remove("image_source");
        node.instance_info.remove("root_gb");

        let err = DeployInfo::from_node(&node, "ext4").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("image_source"), "{msg}");
        assert!(msg.contains("root_gb"), "{msg}");
    }

    #[test]
    fn test_non_integer_size_is_rejected() {
        let mut node = test_node();
        node.instance_info
            .insert("swap_mb".to_string(), json!("lots"));

        let err = DeployInfo::from_node(&node, "ext4").unwrap_err();
        assert!(err.to_string().contains("swap_mb"));
    }

    #[test]
    fn test_integer_as_string_is_accepted() {
        let mut node = test_node();
        node.instance_info
            .insert("root_gb".to_string(), json!("40"));

        let info = DeployInfo::from_node(&node, "ext4").unwrap();
        assert_eq!(info.root_gb, 40);
    }

    #[test]
    fn test_ephemeral_format_defaulted_when_sized() {
        let mut node = test_node();
        node.instance_info
            .insert("ephemeral_gb".to_string(), json!(20));

        let info = DeployInfo::from_node(&node, "ext4").unwrap();
        assert_eq!(info.ephemeral_format.as_deref(), Some("ext4"));
    }

    #[test]
    fn test_preserve_ephemeral_strict_parse() {
        let mut node = test_node();
        node.instance_info
            .insert("preserve_ephemeral".to_string(), json!("yes"));
        let info = DeployInfo::from_node(&node, "ext4").unwrap();
        assert!(info.preserve_ephemeral);

        node.instance_info
            .insert("preserve_ephemeral".to_string(), json!("maybe"));
        let err = DeployInfo::from_node(&node, "ext4").unwrap_err();
        assert!(err.to_string().contains("preserve_ephemeral"));
    }

    #[test]
    fn test_exclusive_lock_fails_fast() {
        let task = ProvisioningTask::new(test_node());
        let err = task.require_exclusive_lock().unwrap_err();
        assert!(matches!(err, DeployError::LockRequired { node } if node == task.node.uuid));

        let locked = ProvisioningTask::with_exclusive_lock(test_node());
        assert!(locked.require_exclusive_lock().is_ok());
    }

    #[test]
    fn test_deploy_state_display() {
        assert_eq!(DeployState::Deploying.to_string(), "deploying");
        assert_eq!(DeployState::DeployWait.to_string(), "deploywait");
        assert_eq!(DeployState::Deleted.to_string(), "deleted");
    }
}
