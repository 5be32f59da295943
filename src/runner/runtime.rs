//! Container runtime health and housekeeping.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::RuntimeError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fail fast when the container runtime cannot be reached.
pub async fn ensure_available(runtime: &str) -> Result<(), RuntimeError> {
    let unavailable = |reason: String| RuntimeError::Unavailable {
        runtime: runtime.to_string(),
        reason,
    };

    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(runtime)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| unavailable(format!("`{runtime} info` timed out")))?
    .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(unavailable(stderr.trim().to_string()));
    }
    tracing::debug!(runtime = %runtime, "Container runtime available");
    Ok(())
}

/// Stop sandboxes left running by a previous host process.
///
/// Returns the names of the sandboxes that were stopped.
pub async fn cleanup_orphans(runtime: &str, prefix: &str) -> Result<Vec<String>, RuntimeError> {
    let output = Command::new(runtime)
        .args([
            "ps",
            "--filter",
            &format!("name={prefix}-"),
            "--format",
            "{{.Names}}",
        ])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        tracing::warn!(runtime = %runtime, "Could not list running sandboxes");
        return Ok(Vec::new());
    }

    let names = orphan_names(&String::from_utf8_lossy(&output.stdout), prefix);
    let mut stopped = Vec::new();
    for name in names {
        let status = Command::new(runtime)
            .args(["stop", &name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => stopped.push(name),
            Ok(s) => tracing::warn!(sandbox = %name, status = %s, "Failed to stop orphan"),
            Err(e) => tracing::warn!(sandbox = %name, error = %e, "Failed to stop orphan"),
        }
    }
    if !stopped.is_empty() {
        tracing::info!(count = stopped.len(), names = ?stopped, "Stopped orphaned sandboxes");
    }
    Ok(stopped)
}

/// `ps` filters match substrings, so keep only names that really carry the prefix.
fn orphan_names(listing: &str, prefix: &str) -> Vec<String> {
    let wanted = format!("{prefix}-");
    listing
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(&wanted))
        .map(String::from)
        .collect()
}
