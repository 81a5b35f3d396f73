//! Host table synchronization.
//!
//! The management system resolves node hostnames through a flat
//! `/etc/hosts`-style file. Before every deployment the managed node's
//! single entry must be rewritten to its current deployment IP without
//! disturbing anything else in the file.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::DeployError;

/// Rewrite the table so `hostname` maps to exactly `ip`.
///
/// Every non-comment line whose second whitespace-delimited token equals
/// `hostname` is dropped; all other lines, comments and blanks included,
/// are kept verbatim in their original order. One `"<ip>\t<hostname>"`
/// line is appended last. Idempotent. The file is rewritten only after a
/// complete successful read; the read and write are not atomic against
/// concurrent writers, so callers serialize access (the orchestrator's
/// exclusive lock covers this).
///
/// # Errors
/// Returns [`DeployError::HostTable`] if the file cannot be read or the
/// replacement cannot be written.
pub fn sync_host_entry(path: &Path, hostname: &str, ip: &str) -> Result<(), DeployError> {
    let contents = fs::read_to_string(path).map_err(|source| DeployError::HostTable {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines: Vec<&str> = contents
        .lines()
        .filter(|line| entry_hostname(line) != Some(hostname))
        .collect();

    let entry = format!("{ip}\t{hostname}");
    lines.push(&entry);

    let mut output = lines.join("\n");
    output.push('\n');

    fs::write(path, output).map_err(|source| DeployError::HostTable {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), hostname, ip, "host table entry synced");
    Ok(())
}

/// The hostname of an entry line, or `None` for comments, blanks, and
/// lines without a hostname field.
///
/// Only the part before an inline `#` counts; the split tolerates any mix
/// of spaces and tabs and collapses consecutive delimiters.
fn entry_hostname(line: &str) -> Option<&str> {
    let entry = line.split('#').next().unwrap_or("");
    entry.split_whitespace().nth(1)
}
