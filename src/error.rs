//! Error types for the group run host.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Top-level error type for the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid group folder name: {0:?}")]
    InvalidGroupFolder(String),

    #[error("Failed to parse {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections raised while building a run's mount set.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("Container path {container_path:?} is invalid: {reason}")]
    InvalidContainerPath {
        container_path: String,
        reason: String,
    },

    #[error("Host path {} does not exist", path.display())]
    HostPathMissing { path: PathBuf },

    #[error("Host path {} is not under any allowed root", path.display())]
    NotAllowed { path: PathBuf },

    #[error("Host path {} matches blocked pattern {pattern:?}", path.display())]
    Blocked { path: PathBuf, pattern: String },

    #[error("No mount allowlist configured, additional mount {} rejected", path.display())]
    NoAllowlist { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single run, classified for the queue's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Group {group}: failed to start sandbox: {reason}")]
    TransientSpawn { group: String, reason: String },

    #[error("Group {group}: no output within idle timeout of {idle_timeout:?} (last activity {last_activity_at})")]
    PreOutputTimeout {
        group: String,
        idle_timeout: Duration,
        last_activity_at: DateTime<Utc>,
        stderr_tail: String,
    },

    #[error("Group {group}: malformed output frame after {frames_emitted} frame(s): {reason}")]
    FrameParse {
        group: String,
        reason: String,
        frames_emitted: u32,
    },

    #[error("Group {group}: process exited with code {exit_code:?} before producing output")]
    ProcessCrash {
        group: String,
        exit_code: Option<i32>,
        stderr_tail: String,
        last_activity_at: DateTime<Utc>,
    },

    #[error("Group {group}: process exited cleanly without producing output")]
    NoOutput { group: String, stderr_tail: String },

    #[error("Group {group}: {source}")]
    Mount {
        group: String,
        #[source]
        source: MountError,
    },

    #[error("Group {group}: failed to prepare run: {reason}")]
    Setup { group: String, reason: String },

    #[error("Group {group}: run cancelled")]
    Cancelled { group: String },
}

impl RunError {
    /// How many attempts in a row a run failing with this error may get.
    ///
    /// Transient spawn failures use the full budget, a crash before output is
    /// retried once, everything else surfaces on the first failure.
    pub fn max_attempts(&self, max_attempts: u32) -> u32 {
        match self {
            Self::TransientSpawn { .. } => max_attempts.max(1),
            Self::ProcessCrash { .. } => max_attempts.clamp(1, 2),
            _ => 1,
        }
    }

    /// Whether this error is infrastructure flakiness rather than agent logic.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSpawn { .. })
    }

    /// The group this error belongs to.
    pub fn group(&self) -> &str {
        match self {
            Self::TransientSpawn { group, .. }
            | Self::PreOutputTimeout { group, .. }
            | Self::FrameParse { group, .. }
            | Self::ProcessCrash { group, .. }
            | Self::NoOutput { group, .. }
            | Self::Mount { group, .. }
            | Self::Setup { group, .. }
            | Self::Cancelled { group } => group,
        }
    }

    /// Captured stderr tail, when the error carries one.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            Self::PreOutputTimeout { stderr_tail, .. }
            | Self::ProcessCrash { stderr_tail, .. }
            | Self::NoOutput { stderr_tail, .. } => Some(stderr_tail),
            _ => None,
        }
    }

    /// Short plain-language description suitable for showing to a user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::TransientSpawn { .. } => "The assistant could not be started right now.",
            Self::PreOutputTimeout { .. } => "The assistant took too long to respond.",
            Self::FrameParse { .. } => "The assistant returned a response that could not be read.",
            Self::ProcessCrash { .. } => "The assistant stopped unexpectedly.",
            Self::NoOutput { .. } => "The assistant finished without a response.",
            Self::Mount { .. } => "This workspace has an invalid mount configuration.",
            Self::Setup { .. } => "The assistant's workspace could not be prepared.",
            Self::Cancelled { .. } => "The request was cancelled.",
        }
    }
}

/// Persistence read-model errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container runtime {runtime} is not available: {reason}")]
    Unavailable { runtime: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the host.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn crash() -> RunError {
        RunError::ProcessCrash {
            group: "acme".into(),
            exit_code: Some(1),
            stderr_tail: "boom".into(),
            last_activity_at: Utc::now(),
        }
    }

    #[test]
    fn attempt_budget_follows_classification() {
        let spawn = RunError::TransientSpawn {
            group: "acme".into(),
            reason: "no daemon".into(),
        };
        assert_eq!(spawn.max_attempts(5), 5);
        assert!(spawn.is_transient());

        assert_eq!(crash().max_attempts(5), 2);
        assert_eq!(crash().max_attempts(1), 1);
        assert!(!crash().is_transient());

        let parse = RunError::FrameParse {
            group: "acme".into(),
            reason: "bad json".into(),
            frames_emitted: 0,
        };
        assert_eq!(parse.max_attempts(5), 1);

        let timeout = RunError::PreOutputTimeout {
            group: "acme".into(),
            idle_timeout: Duration::from_secs(1),
            last_activity_at: Utc::now(),
            stderr_tail: String::new(),
        };
        assert_eq!(timeout.max_attempts(5), 1);
    }

    #[test]
    fn error_context_accessors() {
        let err = crash();
        assert_eq!(err.group(), "acme");
        assert_eq!(err.stderr_tail(), Some("boom"));
        assert!(err.to_string().contains("code Some(1)"));

        let cancelled = RunError::Cancelled {
            group: "beta".into(),
        };
        assert_eq!(cancelled.group(), "beta");
        assert!(cancelled.stderr_tail().is_none());
    }

    #[test]
    fn mount_error_wraps_into_top_level() {
        let err: Error = MountError::InvalidContainerPath {
            container_path: "../../etc".into(),
            reason: "contains '..'".into(),
        }
        .into();
        assert!(err.to_string().contains("../../etc"));
    }
}
