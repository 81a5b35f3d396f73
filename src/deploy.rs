//! The deployment workflow.
//!
//! Phases run in a fixed order driven by the external framework:
//! `validate` proves the node is deployable without side effects,
//! `prepare` binds the node's network identity and registers it with the
//! management system, `deploy` points the node at its image and reboots
//! it into the management system's netboot path. Side effects are not
//! rolled back on failure; the recovery strategy is to fix the cause and
//! retry the phase, which every step tolerates by being idempotent or
//! last-write-wins.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{ImageCatalog, ServiceCatalog};
use crate::command::{run_local, NodeCommand};
use crate::config::XcatConfig;
use crate::error::{ApiError, DeployError};
use crate::hosts;
use crate::net::{resolve_network_identity, NetworkIdentity, PortLister};
use crate::power::{BootDevice, PowerCommand, PowerController};
use crate::session::{SessionError, SessionRunner};
use crate::task::{DeployInfo, DeployState, ProvisioningTask, FIXED_IP_KEY, IMAGE_NAME_KEY};

/// Netboot deployment driver backed by an xCAT management system.
pub struct XcatDeploy {
    config: XcatConfig,
    ports: Arc<dyn PortLister>,
    images: Arc<dyn ImageCatalog>,
    services: Arc<dyn ServiceCatalog>,
    power: Arc<dyn PowerController>,
    xcat: Arc<dyn NodeCommand>,
    session: Arc<dyn SessionRunner>,
}

impl XcatDeploy {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: XcatConfig,
        ports: Arc<dyn PortLister>,
        images: Arc<dyn ImageCatalog>,
        services: Arc<dyn ServiceCatalog>,
        power: Arc<dyn PowerController>,
        xcat: Arc<dyn NodeCommand>,
        session: Arc<dyn SessionRunner>,
    ) -> Self {
        Self {
            config,
            ports,
            images,
            services,
            power,
            xcat,
            session,
        }
    }

    /// Check that the node can be deployed. No side effects.
    ///
    /// # Errors
    /// Returns [`DeployError::InvalidParameter`] for missing parameters,
    /// missing MAC addresses, or an unresolvable deployment API endpoint,
    /// and [`DeployError::ImageNotFound`] when the catalog has no such
    /// image.
    pub async fn validate(&self, task: &ProvisioningTask) -> Result<(), DeployError> {
        let node = &task.node;

        if node.mac_addresses.is_empty() {
            return Err(DeployError::InvalidParameter(format!(
                "node {} has no port associated with it, cannot deploy",
                node.uuid
            )));
        }

        let info = DeployInfo::from_node(node, &self.config.default_ephemeral_format)?;

        if self.config.api_url.is_none() {
            self.services.deploy_api_url().await.map_err(|e| {
                DeployError::InvalidParameter(format!(
                    "could not determine the deployment API endpoint: {e}"
                ))
            })?;
        }

        match self.images.show(&info.image_source).await {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound(_)) => Err(DeployError::ImageNotFound(info.image_source)),
            Err(e) => Err(DeployError::InvalidParameter(format!(
                "failed to validate image {}: {e}",
                info.image_source
            ))),
        }
    }

    /// Bind the node's network identity and register it with the
    /// management system.
    ///
    /// Resolves the virtual port matching one of the node's MACs, stores
    /// the fixed IP and image name into `instance_info`, blocks the MAC
    /// in the deployment network's DHCP namespace so only the management
    /// system answers the node's netboot, and registers the MAC with the
    /// management system. Each step overwrites its previous result, so a
    /// retried `prepare` converges.
    ///
    /// # Errors
    /// Returns [`DeployError::NoPortMatch`] when no port carries any of
    /// the node's MAC addresses. A port listing failure surfaces as
    /// [`DeployError::PortLookup`].
    pub async fn prepare(&self, task: &mut ProvisioningTask) -> Result<(), DeployError> {
        let info = DeployInfo::from_node(&task.node, &self.config.default_ephemeral_format)?;

        let image = self
            .images
            .show(&info.image_source)
            .await
            .map_err(|e| match e {
                ApiError::NotFound(_) => DeployError::ImageNotFound(info.image_source.clone()),
                other => DeployError::InvalidParameter(format!(
                    "cannot get image info for {}: {other}",
                    info.image_source
                )),
            })?;

        let identity = self.bind_network_identity(task).await?;
        info!(
            node = %task.node.uuid,
            fixed_ip = %identity.fixed_ip,
            mac = %identity.mac_address,
            port = %identity.port_id,
            "resolved network identity"
        );

        task.node
            .instance_info
            .insert(FIXED_IP_KEY.to_string(), Value::String(identity.fixed_ip));
        task.node
            .instance_info
            .insert(IMAGE_NAME_KEY.to_string(), Value::String(image.name));

        self.isolate_dhcp_mac(&identity.network_id, &identity.mac_address)
            .await?;

        // Register the deployment MAC with the management system. chdef
        // replaces any previous value.
        self.xcat
            .invoke(
                &info.xcat_node,
                "chdef",
                &format!("mac={}", identity.mac_address),
            )
            .await?;

        Ok(())
    }

    /// Point the node at its image and reboot it into netboot.
    ///
    /// Requires the exclusive lock. All inputs are checked before the
    /// first side effect.
    ///
    /// # Errors
    /// Returns [`DeployError::LockRequired`] without the lock and
    /// [`DeployError::InvalidParameter`] when `prepare` has not stored
    /// the fixed IP and image name.
    pub async fn deploy(&self, task: &ProvisioningTask) -> Result<DeployState, DeployError> {
        task.require_exclusive_lock()?;

        let info = DeployInfo::from_node(&task.node, &self.config.default_ephemeral_format)?;

        let Some(fixed_ip) = info.fixed_ip.as_deref() else {
            return Err(DeployError::InvalidParameter(format!(
                "node {}: no fixed IP stored, prepare must run first",
                task.node.uuid
            )));
        };
        let Some(image_name) = info.image_name.as_deref() else {
            return Err(DeployError::InvalidParameter(format!(
                "node {}: no image name stored, prepare must run first",
                task.node.uuid
            )));
        };

        info!(node = %task.node.uuid, state = %DeployState::Deploying, "deployment started");

        hosts::sync_host_entry(&self.config.host_filepath, &info.xcat_node, fixed_ip)?;
        self.refresh_dhcp().await;

        self.xcat
            .invoke(&info.xcat_node, "nodeset", &format!("osimage={image_name}"))
            .await?;

        self.power
            .set_boot_device(&info.xcat_node, BootDevice::Network, true)
            .await?;
        self.power
            .power(&info.xcat_node, PowerCommand::Reboot)
            .await?;

        info!(node = %task.node.uuid, state = %DeployState::DeployWait, "reboot issued");
        Ok(DeployState::DeployWait)
    }

    /// Power the node off and release it.
    ///
    /// Needs only the management node name; the instance info may already
    /// be gone by the time a node is torn down.
    ///
    /// # Errors
    /// Returns [`DeployError::LockRequired`] without the exclusive lock.
    pub async fn tear_down(&self, task: &ProvisioningTask) -> Result<DeployState, DeployError> {
        task.require_exclusive_lock()?;

        let xcat_node = task.node.xcat_node().ok_or_else(|| {
            DeployError::InvalidParameter(format!(
                "node {}: driver_info is missing xcat_node",
                task.node.uuid
            ))
        })?;
        self.power.power(&xcat_node, PowerCommand::Off).await?;

        info!(node = %task.node.uuid, state = %DeployState::Deleted, "torn down");
        Ok(DeployState::Deleted)
    }

    /// Nothing to clean up; deployment leaves no per-node residue beyond
    /// what the next `prepare` overwrites.
    pub fn clean_up(&self, task: &ProvisioningTask) {
        info!(node = %task.node.uuid, "clean up, nothing to do");
    }

    /// Adopt a node another conductor was managing. Stateless, nothing
    /// to reclaim.
    pub fn take_over(&self, task: &ProvisioningTask) {
        info!(node = %task.node.uuid, "take over, nothing to do");
    }

    async fn bind_network_identity(
        &self,
        task: &ProvisioningTask,
    ) -> Result<NetworkIdentity, DeployError> {
        let ports = self
            .ports
            .list_ports(task)
            .await
            .map_err(|source| DeployError::PortLookup {
                node: task.node.uuid,
                source,
            })?;

        resolve_network_identity(&ports, &task.node.mac_addresses).ok_or(
            DeployError::NoPortMatch {
                node: task.node.uuid,
            },
        )
    }

    /// Drop the node's MAC in the deployment network's DHCP namespace so
    /// the network controller's DHCP agent stops answering it. The
    /// delete-then-append pair makes a retried `prepare` leave exactly
    /// one rule.
    async fn isolate_dhcp_mac(&self, network_id: &str, mac: &str) -> Result<(), DeployError> {
        let rule = format!("INPUT -m mac --mac-source {mac} -j DROP");
        let netns = format!("qdhcp-{network_id}");
        let commands = vec![
            format!("sudo ip netns exec {netns} iptables -D {rule}"),
            format!("sudo ip netns exec {netns} iptables -A {rule}"),
        ];

        self.run_session_batch(commands).await
    }

    async fn run_session_batch(&self, commands: Vec<String>) -> Result<(), DeployError> {
        let session = Arc::clone(&self.session);
        let endpoint = self.config.ssh_endpoint();
        let result = tokio::task::spawn_blocking(move || session.run_batch(&commands))
            .await
            .map_err(|e| DeployError::Session {
                endpoint: endpoint.clone(),
                source: SessionError::Aborted(e.to_string()),
            })?;

        result.map_err(|source| DeployError::Session { endpoint, source })
    }

    /// Regenerate and reload the management system's DHCP configuration.
    /// Best effort; a stale lease file does not block the deployment.
    async fn refresh_dhcp(&self) {
        for args in [["-n"], ["-a"]] {
            if let Err(reason) = run_local("makedhcp", &args).await {
                warn!(?args, %reason, "makedhcp failed, continuing");
            }
        }
    }
}
