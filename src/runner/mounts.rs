//! Mount set for a sandbox run.
//!
//! Every run gets the group's own folder read-write, its session state and IPC
//! directories, the credentials directory read-only, and either the project
//! root (privileged group) or the shared global folder (everyone else)
//! read-only. Groups may ask for additional host directories; those are
//! checked against an allowlist kept outside the project, so an agent cannot
//! widen its own access by editing files it can see.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::ipc::IpcDir;
use crate::config::RunnerConfig;
use crate::error::{ConfigError, MountError};
use crate::group::{AdditionalMount, GroupConfig};

/// Where additional mounts land inside the sandbox.
pub const EXTRA_MOUNT_ROOT: &str = "/workspace/extra";

/// Shared agent scripts, relative to the project root.
pub const AGENT_SCRIPTS_DIR: &str = "sandbox/agent-runner/src";

/// Path components that are never mounted, whatever the allowlist says.
const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    ".netrc",
    ".npmrc",
    ".env",
    "credentials",
    "id_rsa",
    "id_ed25519",
    "private_key",
];

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    fn rw(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    fn ro(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::rw(host_path, container_path)
        }
    }
}

/// A host directory tree additional mounts may come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default)]
    pub allow_read_write: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Host-side policy for additional mounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountAllowlist {
    #[serde(default)]
    pub allowed_roots: Vec<AllowedRoot>,
    /// Extra path components to block on top of the built-in list.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Force every non-privileged group's additional mounts read-only.
    #[serde(default = "default_true")]
    pub non_main_read_only: bool,
}

fn default_true() -> bool {
    true
}

impl MountAllowlist {
    /// Load the allowlist. A missing file means no additional mounts are allowed.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn blocked_pattern(&self, path: &Path) -> Option<String> {
        let patterns = DEFAULT_BLOCKED_PATTERNS
            .iter()
            .copied()
            .chain(self.blocked_patterns.iter().map(String::as_str));
        for pattern in patterns {
            let hit = path.components().any(|c| match c {
                Component::Normal(part) => part.to_string_lossy().contains(pattern),
                _ => false,
            });
            if hit {
                return Some(pattern.to_string());
            }
        }
        None
    }
}

/// Check a requested container path: relative, non-empty, no traversal.
pub fn validate_container_path(container_path: &str) -> Result<(), MountError> {
    let reject = |reason: &str| MountError::InvalidContainerPath {
        container_path: container_path.to_string(),
        reason: reason.to_string(),
    };

    if container_path.trim().is_empty() {
        return Err(reject("must not be empty"));
    }
    if container_path.contains(':') {
        return Err(reject("must not contain ':'"));
    }
    let path = Path::new(container_path);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(reject("must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(reject("must be relative to /workspace/extra"));
            }
        }
    }
    Ok(())
}

/// Builds the mount list for a group.
pub struct MountBuilder<'a> {
    config: &'a RunnerConfig,
    allowlist: Option<&'a MountAllowlist>,
}

impl<'a> MountBuilder<'a> {
    pub fn new(config: &'a RunnerConfig, allowlist: Option<&'a MountAllowlist>) -> Self {
        Self { config, allowlist }
    }

    /// Validate additional mounts and build the full, ordered mount list.
    ///
    /// Validation runs before any directory is created, so a rejected group
    /// leaves nothing behind.
    pub async fn build(&self, group: &GroupConfig) -> Result<Vec<VolumeMount>, MountError> {
        let extra = self.validate_additional(group).await?;

        let config = self.config;
        let group_dir = config.groups_dir.join(&group.folder);
        fs::create_dir_all(&group_dir).await?;
        fs::create_dir_all(group_dir.join("logs")).await?;

        let mut mounts = vec![VolumeMount::rw(&group_dir, "/workspace/group")];

        if group.is_main {
            mounts.push(VolumeMount::ro(&config.project_root, "/workspace/project"));
        } else {
            let global = config.groups_dir.join("global");
            if fs::try_exists(&global).await.unwrap_or(false) {
                mounts.push(VolumeMount::ro(global, "/workspace/global"));
            }
        }

        let sessions = config
            .data_dir
            .join("sessions")
            .join(&group.folder)
            .join(".claude");
        fs::create_dir_all(&sessions).await?;
        mounts.push(VolumeMount::rw(sessions, "/home/node/.claude"));

        let ipc = IpcDir::new(&config.data_dir, &group.folder);
        ipc.ensure().await?;
        mounts.push(VolumeMount::rw(ipc.root(), "/workspace/ipc"));

        let env_dir = env_dir(config, &group.folder);
        fs::create_dir_all(&env_dir).await?;
        mounts.push(VolumeMount::ro(env_dir, "/workspace/env-dir"));

        let scripts = config.project_root.join(AGENT_SCRIPTS_DIR);
        if fs::try_exists(&scripts).await.unwrap_or(false) {
            mounts.push(VolumeMount::ro(scripts, "/app/src"));
        }

        mounts.extend(extra);
        Ok(mounts)
    }

    async fn validate_additional(&self, group: &GroupConfig) -> Result<Vec<VolumeMount>, MountError> {
        let mut seen = HashSet::new();
        let mut mounts = Vec::new();

        for request in &group.sandbox.additional_mounts {
            let mount = self.validate_one(group, request).await?;
            if !seen.insert(mount.container_path.clone()) {
                return Err(MountError::InvalidContainerPath {
                    container_path: mount.container_path,
                    reason: "mounted twice".to_string(),
                });
            }
            mounts.push(mount);
        }
        Ok(mounts)
    }

    async fn validate_one(
        &self,
        group: &GroupConfig,
        request: &AdditionalMount,
    ) -> Result<VolumeMount, MountError> {
        let host = expand_home(&request.host_path);
        let container_rel = match &request.container_path {
            Some(p) => p.clone(),
            None => host
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        validate_container_path(&container_rel)?;

        let Some(allowlist) = self.allowlist else {
            return Err(MountError::NoAllowlist { path: host });
        };

        let real = fs::canonicalize(&host)
            .await
            .map_err(|_| MountError::HostPathMissing { path: host.clone() })?;

        if let Some(pattern) = allowlist.blocked_pattern(&real) {
            return Err(MountError::Blocked { path: real, pattern });
        }

        let mut root_allows_rw = None;
        for root in &allowlist.allowed_roots {
            let Ok(root_path) = fs::canonicalize(expand_home(&root.path)).await else {
                continue;
            };
            if real.starts_with(&root_path) {
                root_allows_rw = Some(root.allow_read_write);
                break;
            }
        }
        let Some(root_allows_rw) = root_allows_rw else {
            return Err(MountError::NotAllowed { path: real });
        };

        let mut read_only = request.readonly || !root_allows_rw;
        if !group.is_main && allowlist.non_main_read_only {
            read_only = true;
        }

        let container_rel = container_rel.trim_start_matches("./").trim_end_matches('/');
        Ok(VolumeMount {
            host_path: real,
            container_path: format!("{EXTRA_MOUNT_ROOT}/{container_rel}"),
            read_only,
        })
    }
}

/// Host directory holding a group's credentials file.
pub fn env_dir(config: &RunnerConfig, folder: &str) -> PathBuf {
    config.data_dir.join("env").join(folder)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}
