//! How a sandbox process is started and stopped.
//!
//! The runner only needs a configured [`Command`] with the sandbox's mounts
//! applied; the [`Launcher`] trait is the seam between run lifecycle and the
//! container runtime.

use std::process::Stdio;

use tokio::process::Command;

use super::mounts::VolumeMount;

/// Everything a launcher needs to start one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    /// Unique sandbox name for this invocation.
    pub name: &'a str,
    pub group_folder: &'a str,
    pub mounts: &'a [VolumeMount],
}

/// Builds the commands that start and stop sandboxes.
pub trait Launcher: Send + Sync {
    /// Command that starts the sandbox. Stdio is configured by the runner.
    fn command(&self, spec: &LaunchSpec<'_>) -> Command;

    /// Command that stops a running sandbox by name. `None` means the runner
    /// should kill the child process directly.
    fn stop_command(&self, _name: &str) -> Option<Command> {
        None
    }
}

/// Launches sandboxes with a docker-compatible container runtime.
#[derive(Debug, Clone)]
pub struct ContainerLauncher {
    runtime: String,
    image: String,
    extra_args: Vec<String>,
}

impl ContainerLauncher {
    pub fn new(runtime: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            extra_args: Vec::new(),
        }
    }

    /// Add runtime arguments placed before the image name (e.g. `--network none`).
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Argument list for `<runtime> run`.
    pub fn run_args(&self, spec: &LaunchSpec<'_>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.to_string(),
        ];
        for mount in spec.mounts {
            let mut volume = format!("{}:{}", mount.host_path.display(), mount.container_path);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(volume);
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.image.clone());
        args
    }
}

impl Launcher for ContainerLauncher {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command {
        let mut command = Command::new(&self.runtime);
        command.args(self.run_args(spec));
        command
    }

    fn stop_command(&self, name: &str) -> Option<Command> {
        let mut command = Command::new(&self.runtime);
        command
            .args(["stop", "--time", "5", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Some(command)
    }
}

/// Sandbox name for one invocation: `<prefix>-<folder>-<millis>`.
pub fn sandbox_name(prefix: &str, folder: &str) -> String {
    let safe: String = folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{prefix}-{safe}-{}", chrono::Utc::now().timestamp_millis())
}
