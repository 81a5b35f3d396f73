//! Power and boot-device control through the management system.
//!
//! Both operations are addressed to the management node name and go
//! through the paced command invoker, since the BMC behind a node is the
//! same target the deployment commands race against.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::NodeCommand;
use crate::error::DeployError;

/// Where the node boots from next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    Network,
    Disk,
}

impl BootDevice {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Network => "net",
            Self::Disk => "hd",
        }
    }
}

/// Power actions the driver issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    On,
    Off,
    Reboot,
}

impl PowerCommand {
    fn as_arg(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Reboot => "reset",
        }
    }
}

/// Power control seam, injected into the orchestrator.
#[async_trait]
pub trait PowerController: Send + Sync {
    /// Select the next boot device.
    async fn set_boot_device(
        &self,
        xcat_node: &str,
        device: BootDevice,
        persistent: bool,
    ) -> Result<(), DeployError>;

    /// Issue a power action.
    async fn power(&self, xcat_node: &str, action: PowerCommand) -> Result<(), DeployError>;
}

/// Power control via `rsetboot` and `rpower`.
pub struct XcatPower {
    xcat: Arc<dyn NodeCommand>,
}

impl XcatPower {
    #[must_use]
    pub fn new(xcat: Arc<dyn NodeCommand>) -> Self {
        Self { xcat }
    }
}

#[async_trait]
impl PowerController for XcatPower {
    async fn set_boot_device(
        &self,
        xcat_node: &str,
        device: BootDevice,
        persistent: bool,
    ) -> Result<(), DeployError> {
        // rsetboot is one-shot by default; -p makes it stick.
        let args = if persistent {
            format!("{} -p", device.as_arg())
        } else {
            device.as_arg().to_string()
        };
        self.xcat.invoke(xcat_node, "rsetboot", &args).await?;
        Ok(())
    }

    async fn power(&self, xcat_node: &str, action: PowerCommand) -> Result<(), DeployError> {
        self.xcat.invoke(xcat_node, "rpower", action.as_arg()).await?;
        Ok(())
    }
}
