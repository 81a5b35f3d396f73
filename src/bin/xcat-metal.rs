//! xCAT metal CLI - drive the deployment workflow for one node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use xcat_metal::catalog::{HttpImageCatalog, StaticCatalog};
use xcat_metal::command::{CommandPacer, NodeCommand, XcatCommand};
use xcat_metal::config::XcatConfig;
use xcat_metal::deploy::XcatDeploy;
use xcat_metal::net::HttpPortLister;
use xcat_metal::power::XcatPower;
use xcat_metal::session::SessionDriver;
use xcat_metal::task::{Node, ProvisioningTask};

/// Drive netboot deployments through an xCAT management system.
#[derive(Parser)]
#[command(name = "xcat-metal")]
#[command(about = "Deploy and tear down bare metal nodes via xCAT")]
struct Cli {
    /// Configuration file (or set `XCAT_METAL_CONFIG` env var).
    #[arg(long, env = "XCAT_METAL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a node is deployable. No side effects.
    Validate {
        /// Node description file (YAML).
        #[arg(long)]
        node: PathBuf,
    },

    /// Resolve the node's network identity and register it with xCAT.
    ///
    /// Updates the node file in place with the resolved fixed IP and
    /// image name.
    Prepare {
        /// Node description file (YAML).
        #[arg(long)]
        node: PathBuf,
    },

    /// Set the node's image and reboot it into netboot.
    Deploy {
        /// Node description file (YAML).
        #[arg(long)]
        node: PathBuf,
    },

    /// Power the node off and release it.
    TearDown {
        /// Node description file (YAML).
        #[arg(long)]
        node: PathBuf,
    },

    /// Print the effective configuration.
    ShowConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<XcatConfig> {
    match path {
        Some(path) => XcatConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(XcatConfig::default()),
    }
}

fn load_node(path: &PathBuf) -> Result<Node> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read node file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse node file {}", path.display()))
}

fn build_driver(config: &XcatConfig) -> Result<XcatDeploy> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let network_api_url = config
        .network_api_url
        .clone()
        .context("network_api_url is not configured")?;
    let image_api_url = config
        .image_api_url
        .clone()
        .context("image_api_url is not configured")?;

    let pacer = Arc::new(CommandPacer::new(config.min_command_interval()));
    let xcat: Arc<dyn NodeCommand> = Arc::new(XcatCommand::new(pacer));

    let session = SessionDriver::new(
        config.ssh_endpoint(),
        config.ssh_credential(),
        config.session_timeout(),
        config.login_wait(),
        config.shell_wait(),
        config.ssh_buf_size,
    );

    Ok(XcatDeploy::new(
        config.clone(),
        Arc::new(HttpPortLister::new(client.clone(), network_api_url)),
        Arc::new(HttpImageCatalog::new(client, image_api_url)),
        Arc::new(StaticCatalog::new(config.api_url.clone())),
        Arc::new(XcatPower::new(Arc::clone(&xcat))),
        xcat,
        Arc::new(session),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Validate { node } => {
            let driver = build_driver(&config)?;
            let task = ProvisioningTask::new(load_node(&node)?);

            driver.validate(&task).await?;
            println!("node {} is deployable", task.node.uuid);
        }

        Commands::Prepare { node } => {
            let driver = build_driver(&config)?;
            let mut task = ProvisioningTask::new(load_node(&node)?);

            driver.prepare(&mut task).await?;

            let updated = serde_yaml::to_string(&task.node)
                .context("failed to serialize updated node")?;
            std::fs::write(&node, updated)
                .with_context(|| format!("failed to update node file {}", node.display()))?;
            info!(node = %task.node.uuid, "node file updated with network identity");
            println!("node {} prepared", task.node.uuid);
        }

        Commands::Deploy { node } => {
            let driver = build_driver(&config)?;
            let task = ProvisioningTask::with_exclusive_lock(load_node(&node)?);

            let state = driver.deploy(&task).await?;
            println!("node {} is {state}", task.node.uuid);
        }

        Commands::TearDown { node } => {
            let driver = build_driver(&config)?;
            let task = ProvisioningTask::with_exclusive_lock(load_node(&node)?);

            let state = driver.tear_down(&task).await?;
            println!("node {} is {state}", task.node.uuid);
        }

        Commands::ShowConfig => {
            let rendered =
                serde_yaml::to_string(&config).context("failed to render configuration")?;
            print!("{rendered}");
        }
    }

    Ok(())
}
