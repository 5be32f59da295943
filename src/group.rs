//! Registered groups and their per-group sandbox settings.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Folder names that belong to the host itself.
const RESERVED_FOLDERS: &[&str] = &["global"];

static FOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("folder pattern is valid")
});

/// A conversational workspace the host runs agents for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    /// Chat identifier the group is keyed by in the queue.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Folder under the groups directory owned by this group.
    pub folder: String,
    /// Privileged groups see the project root and every group's state.
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

impl GroupConfig {
    /// Create a non-privileged group.
    pub fn new(id: impl Into<String>, name: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: folder.into(),
            is_main: false,
            added_at: Some(Utc::now()),
            sandbox: SandboxOverrides::default(),
        }
    }

    /// Mark this group as the privileged main group.
    pub fn main(mut self) -> Self {
        self.is_main = true;
        self
    }

    /// Add an additional mount request.
    pub fn with_mount(mut self, mount: AdditionalMount) -> Self {
        self.sandbox.additional_mounts.push(mount);
        self
    }

    /// Override the idle timeout for this group.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Idle timeout for this group, or `default` when not overridden.
    pub fn idle_timeout(&self, default: Duration) -> Duration {
        self.sandbox
            .idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Check the folder name is safe to use as a path component.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_folder(&self.folder)
    }
}

/// Per-group sandbox settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOverrides {
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

/// A host directory a group asks to have mounted into its sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    /// Host-side path; `~/` expands to the home directory.
    pub host_path: String,
    /// Path relative to `/workspace/extra`. Defaults to the host directory name.
    #[serde(default)]
    pub container_path: Option<String>,
    /// Requested access; read-only unless the allowlist permits writes.
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

impl AdditionalMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: Some(container_path.into()),
            readonly: true,
        }
    }

    pub fn read_write(mut self) -> Self {
        self.readonly = false;
        self
    }
}

/// Validate a group folder name.
pub fn validate_folder(folder: &str) -> Result<(), ConfigError> {
    if !FOLDER_PATTERN.is_match(folder)
        || RESERVED_FOLDERS
            .iter()
            .any(|r| r.eq_ignore_ascii_case(folder))
    {
        return Err(ConfigError::InvalidGroupFolder(folder.to_string()));
    }
    Ok(())
}
