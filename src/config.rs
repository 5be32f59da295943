//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Default container runtime binary.
pub const DEFAULT_RUNTIME: &str = "docker";

/// Default sandbox image.
pub const DEFAULT_IMAGE: &str = "agent-sandbox:latest";

/// Credentials the sandbox is allowed to see.
pub const DEFAULT_CREDENTIAL_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"];

/// Host configuration, usually read from `HOST_*` environment variables.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Maximum number of sandboxes running at once, across all groups.
    pub max_concurrent: usize,
    /// Idle timeout for a running sandbox (reset on every output chunk).
    pub idle_timeout: Duration,
    /// Delay before the first retry; doubled for each further retry.
    pub retry_base: Duration,
    /// Attempts a transiently failing run gets before it fails permanently.
    pub max_attempts: u32,
    /// How long shutdown waits for active runs to unwind.
    pub shutdown_grace: Duration,
    /// Container runtime binary (`docker`, `podman`, ...).
    pub runtime: String,
    /// Sandbox image.
    pub image: String,
    /// Prefix for sandbox names; also used to find orphans.
    pub name_prefix: String,
    /// Project root (mounted read-only for privileged groups).
    pub project_root: PathBuf,
    /// Directory holding per-group folders.
    pub groups_dir: PathBuf,
    /// Directory for host-owned state (sessions, IPC, env, snapshots).
    pub data_dir: PathBuf,
    /// Environment keys passed through to the sandbox credentials file.
    pub credential_keys: Vec<String>,
    /// Path to the mount allowlist JSON file.
    pub mount_allowlist: Option<PathBuf>,
    /// Upper bound for a single output frame.
    pub max_frame_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            max_concurrent: 5,
            idle_timeout: Duration::from_secs(30 * 60), // 30 minutes
            retry_base: Duration::from_secs(5),
            max_attempts: 5,
            shutdown_grace: Duration::from_secs(10),
            runtime: DEFAULT_RUNTIME.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            name_prefix: "assist".to_string(),
            groups_dir: project_root.join("groups"),
            data_dir: project_root.join("data"),
            project_root,
            credential_keys: DEFAULT_CREDENTIAL_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            mount_allowlist: default_allowlist_path(),
            max_frame_bytes: 10 * 1024 * 1024,
        }
    }
}

impl HostConfig {
    /// Build configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let project_root = std::env::var("HOST_PROJECT_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.project_root);

        let groups_dir = std::env::var("HOST_GROUPS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_root.join("groups"));

        let data_dir = std::env::var("HOST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_root.join("data"));

        let credential_keys = std::env::var("HOST_CREDENTIAL_KEYS")
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.credential_keys);

        let mount_allowlist = std::env::var("HOST_MOUNT_ALLOWLIST")
            .ok()
            .map(PathBuf::from)
            .or(defaults.mount_allowlist);

        Self {
            max_concurrent: env_parse("HOST_MAX_CONCURRENT", defaults.max_concurrent).max(1),
            idle_timeout: Duration::from_secs(env_parse(
                "HOST_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            retry_base: Duration::from_millis(env_parse(
                "HOST_RETRY_BASE_MS",
                defaults.retry_base.as_millis() as u64,
            )),
            max_attempts: env_parse("HOST_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            shutdown_grace: Duration::from_secs(env_parse(
                "HOST_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )),
            runtime: std::env::var("HOST_RUNTIME").unwrap_or(defaults.runtime),
            image: std::env::var("HOST_IMAGE").unwrap_or(defaults.image),
            name_prefix: std::env::var("HOST_NAME_PREFIX").unwrap_or(defaults.name_prefix),
            project_root,
            groups_dir,
            data_dir,
            credential_keys,
            mount_allowlist,
            max_frame_bytes: env_parse("HOST_MAX_FRAME_BYTES", defaults.max_frame_bytes),
        }
    }

    /// Queue settings derived from this configuration.
    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent,
            retry_base: self.retry_base,
            max_attempts: self.max_attempts,
        }
    }

    /// Runner settings derived from this configuration.
    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            idle_timeout: self.idle_timeout,
            project_root: self.project_root.clone(),
            groups_dir: self.groups_dir.clone(),
            data_dir: self.data_dir.clone(),
            credential_keys: self.credential_keys.clone(),
            max_frame_bytes: self.max_frame_bytes,
            name_prefix: self.name_prefix.clone(),
        }
    }
}

/// Admission and retry settings for the group queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global cap on concurrently active groups.
    pub max_concurrent: usize,
    /// Delay before the first retry.
    pub retry_base: Duration,
    /// Attempts a transiently failing run gets before it fails permanently.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            retry_base: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(1u32 << exponent)
    }
}

/// Settings for the process runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Default idle timeout when a group has no override.
    pub idle_timeout: Duration,
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Environment keys written to the credentials file.
    pub credential_keys: Vec<String>,
    pub max_frame_bytes: usize,
    pub name_prefix: String,
}

impl RunnerConfig {
    /// Runner configuration rooted at `root`, with `groups/` and `data/` below it.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let defaults = HostConfig::default();
        Self {
            idle_timeout: defaults.idle_timeout,
            groups_dir: root.join("groups"),
            data_dir: root.join("data"),
            project_root: root,
            credential_keys: defaults.credential_keys,
            max_frame_bytes: defaults.max_frame_bytes,
            name_prefix: defaults.name_prefix,
        }
    }
}

fn default_allowlist_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config/assist-host/mount-allowlist.json"))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
