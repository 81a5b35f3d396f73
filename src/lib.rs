//! Bare metal provisioning through an xCAT management system.
//!
//! This crate drives the netboot deployment of physical machines: it
//! correlates a node's MAC addresses with its virtual port to learn the
//! deployment IP, registers the node with the management system over its
//! CLI and the network controller's interactive shell, and reboots the
//! node into the management system's netboot path.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use xcat_metal::command::{CommandPacer, XcatCommand};
//! use xcat_metal::config::XcatConfig;
//! use xcat_metal::deploy::XcatDeploy;
//! use xcat_metal::task::ProvisioningTask;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = XcatConfig::load("/etc/xcat-metal.yaml".as_ref())?;
//!     let driver = build_driver(config)?;
//!
//!     let mut task = ProvisioningTask::new(load_node()?);
//!     driver.validate(&task).await?;
//!     driver.prepare(&mut task).await?;
//!
//!     let task = ProvisioningTask::with_exclusive_lock(task.node);
//!     let state = driver.deploy(&task).await?;
//!     println!("node is {state}");
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod command;
pub mod config;
pub mod deploy;
pub mod error;
pub mod hosts;
pub mod net;
pub mod power;
pub mod session;
pub mod task;

pub use config::XcatConfig;
pub use deploy::XcatDeploy;
pub use error::{ApiError, DeployError};
pub use task::{DeployState, Node, ProvisioningTask};
