//! Local management-system CLI invocation with per-target pacing.
//!
//! The management system rejects commands that arrive too quickly against
//! the same node, so every invocation is paced: a command against a target
//! that was commanded less than the minimum interval ago sleeps out the
//! remainder first. The timestamp is updated whether or not the command
//! succeeds, so pacing holds regardless of outcome.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::DeployError;

/// Failure of one local process invocation.
#[derive(Error, Debug)]
pub enum LocalCommandError {
    /// The program could not be started.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran but exited non-zero.
    #[error("{program} exited with {status}: {stderr}")]
    NonZero {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Seam for commands addressed to one management-system node.
#[async_trait]
pub trait NodeCommand: Send + Sync {
    /// Run `<command> <xcat_node> <args...>`.
    ///
    /// # Errors
    /// Returns [`DeployError::Command`] when the invocation fails.
    async fn invoke(
        &self,
        xcat_node: &str,
        command: &str,
        args: &str,
    ) -> Result<(String, String), DeployError>;
}

/// Per-target last-invocation times.
///
/// Constructed once per process and injected; the map is keyed by target
/// identity and never evicted — target cardinality equals the number of
/// managed nodes.
#[derive(Debug)]
pub struct CommandPacer {
    min_interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl CommandPacer {
    /// Create a pacer enforcing `min_interval` between commands per target.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Time still to wait before `target` may be commanded again.
    #[must_use]
    pub fn remaining(&self, target: &str) -> Duration {
        let last = self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match last.get(target) {
            Some(at) => self.min_interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Record an invocation attempt against `target`, successful or not.
    pub fn stamp(&self, target: &str) {
        let mut last = self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        last.insert(target.to_string(), Instant::now());
    }
}

/// Run a local program, capturing stdout and stderr.
///
/// # Errors
/// Returns [`LocalCommandError::Spawn`] when the program cannot be
/// started, [`LocalCommandError::NonZero`] with the captured stderr when
/// it exits non-zero.
pub async fn run_local(
    program: &str,
    args: &[&str],
) -> Result<(String, String), LocalCommandError> {
    debug!(program, ?args, "executing local command");

    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| LocalCommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Ok((stdout, stderr))
    } else {
        Err(LocalCommandError::NonZero {
            program: program.to_string(),
            status: output.status,
            stderr,
        })
    }
}

/// Paced invoker for management-system commands addressed to one node.
#[derive(Clone)]
pub struct XcatCommand {
    pacer: std::sync::Arc<CommandPacer>,
}

impl XcatCommand {
    /// Create an invoker around an injected pacer.
    #[must_use]
    pub fn new(pacer: std::sync::Arc<CommandPacer>) -> Self {
        Self { pacer }
    }
}

#[async_trait]
impl NodeCommand for XcatCommand {
    /// Run the command paced per node.
    ///
    /// The error carries the command, node, and arguments when the
    /// process cannot start or exits non-zero.
    async fn invoke(
        &self,
        xcat_node: &str,
        command: &str,
        args: &str,
    ) -> Result<(String, String), DeployError> {
        let wait = self.pacer.remaining(xcat_node);
        if !wait.is_zero() {
            debug!(node = xcat_node, wait_ms = wait.as_millis() as u64, "pacing command");
            tokio::time::sleep(wait).await;
        }

        let mut argv: Vec<&str> = vec![xcat_node];
        argv.extend(args.split(' ').filter(|a| !a.is_empty()));

        let result = run_local(command, &argv).await;
        // Stamp unconditionally so pacing holds even across failures.
        self.pacer.stamp(xcat_node);

        result.map_err(|reason| {
            tracing::warn!(node = xcat_node, command, args, %reason, "xcat command failed");
            DeployError::Command {
                cmd: command.to_string(),
                node: xcat_node.to_string(),
                args: args.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pacer_is_idle_for_new_target() {
        let pacer = CommandPacer::new(Duration::from_secs(5));
        assert_eq!(pacer.remaining("node01"), Duration::ZERO);
    }

    #[test]
    fn test_pacer_tracks_targets_independently() {
        let pacer = CommandPacer::new(Duration::from_secs(5));
        pacer.stamp("node01");

        assert!(pacer.remaining("node01") > Duration::ZERO);
        assert_eq!(pacer.remaining("node02"), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_run_local_spawn_failure_is_typed() {
        let err = run_local("definitely-not-a-real-command", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LocalCommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_local_nonzero_exit_carries_status() {
        let err = run_local("false", &[]).await.unwrap_err();
        match err {
            LocalCommandError::NonZero { program, status, .. } => {
                assert_eq!(program, "false");
                assert!(!status.success());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_second_invocation_waits_out_the_interval() {
        let pacer = Arc::new(CommandPacer::new(Duration::from_millis(200)));
        let xcat = XcatCommand::new(pacer);

        let start = Instant::now();
        xcat.invoke("node01", "true", "").await.unwrap();
        xcat.invoke("node01", "true", "").await.unwrap();

        assert!(
            start.elapsed() >= Duration::from_millis(200),
            "second command was not paced: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_failed_invocation_still_stamps() {
        let pacer = Arc::new(CommandPacer::new(Duration::from_secs(30)));
        let xcat = XcatCommand::new(Arc::clone(&pacer));

        let err = xcat
            .invoke("node01", "definitely-not-a-real-command", "mac=aa:bb")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Command { .. }));

        // The failure still counts for pacing purposes.
        assert!(pacer.remaining("node01") > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_command_failure_carries_context() {
        let pacer = Arc::new(CommandPacer::new(Duration::ZERO));
        let xcat = XcatCommand::new(pacer);

        let err = xcat
            .invoke("node07", "false", "osimage=img")
            .await
            .unwrap_err();
        match err {
            DeployError::Command { cmd, node, args } => {
                assert_eq!(cmd, "false");
                assert_eq!(node, "node07");
                assert_eq!(args, "osimage=img");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
