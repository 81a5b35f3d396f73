//! Failure taxonomy for the deployment workflow.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionError;

/// Errors that can occur during deployment operations.
///
/// Validation and lookup failures abort a phase before any externally
/// visible mutation. Remote and local command failures are not rolled
/// back; retrying the whole phase is the recovery strategy.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Bad or missing input. Never retried, surfaced verbatim.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The image does not exist in the image catalog.
    #[error("image not found in catalog: {0}")]
    ImageNotFound(String),

    /// No virtual port carries any of the node's MAC addresses.
    #[error("no virtual port matches the MAC addresses of node {node}")]
    NoPortMatch { node: Uuid },

    /// The network controller could not be queried for a port.
    #[error("failed to get port info for node {node}")]
    PortLookup {
        node: Uuid,
        #[source]
        source: ApiError,
    },

    /// Connect, auth, or transport failure on the management endpoint shell.
    #[error("remote session to {endpoint} failed")]
    Session {
        endpoint: String,
        #[source]
        source: SessionError,
    },

    /// A local management-system command exited non-zero or could not start.
    #[error("xcat call failed: {cmd} {node} {args}")]
    Command {
        cmd: String,
        node: String,
        args: String,
    },

    /// The host table file could not be read or rewritten.
    #[error("host table {path}")]
    HostTable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The phase requires the framework's exclusive per-node lock.
    #[error("node {node}: exclusive lock required")]
    LockRequired { node: Uuid },
}

/// Errors from the HTTP collaborator APIs (network controller, image catalog).
#[derive(Error, Debug)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Response body could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
