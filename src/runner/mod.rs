//! Sandboxed process runner.
//!
//! One call to [`ProcessRunner::run`] is one invocation: prepare the group's
//! mounts, credentials and snapshots, start the sandbox through a
//! [`Launcher`], hand it a [`RunInput`] on stdin, then stream its output
//! through the [`FrameParser`] until the process exits, goes idle or is
//! terminated.
//!
//! Frames are delivered to the [`RunObserver`] as soon as they are parsed,
//! so callers see results while the agent keeps running.

pub mod env;
pub mod frame;
pub mod ipc;
pub mod launcher;
pub mod mounts;
pub mod protocol;
pub mod runlog;
pub mod runtime;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::{MountError, RunError};
use crate::group::GroupConfig;
use crate::store::SnapshotSource;

pub use env::Credentials;
pub use frame::{FrameError, FrameParser, ParserState};
pub use ipc::IpcDir;
pub use launcher::{ContainerLauncher, LaunchSpec, Launcher};
pub use mounts::{MountAllowlist, MountBuilder, VolumeMount};
pub use protocol::{Frame, RunInput, RunOutput, Sentinels};

use runlog::{RunRecord, TailBuffer};

/// Bytes of stderr kept for errors and the run log.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Bytes of stdout kept for the run log of a failed run.
const STDOUT_TAIL_BYTES: usize = 16 * 1024;

/// How long to wait for a stop command before killing the child.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Exit codes meaning the runtime or the entrypoint itself could not start.
const SPAWN_FAILURE_CODES: [i32; 3] = [125, 126, 127];

/// Handle to a running sandbox, shared with the queue.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    group: String,
    input_dir: PathBuf,
    accepts_input: bool,
    /// Set once input is closed or the output stream has ended.
    input_closed: Arc<AtomicBool>,
    terminate: Arc<Notify>,
}

impl ProcessHandle {
    /// Sandbox name, unique per invocation.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Whether the agent still picks up follow-up messages. False for task
    /// runs, and for any run once its input was closed or its output ended.
    pub fn accepts_input(&self) -> bool {
        self.accepts_input && !self.input_closed.load(Ordering::SeqCst)
    }

    /// Pipe a follow-up message into the running agent.
    ///
    /// Fails without writing anything once the handle no longer accepts input.
    pub async fn send(&self, text: &str) -> std::io::Result<PathBuf> {
        if !self.accepts_input() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "agent input is closed",
            ));
        }
        ipc::write_input_message(&self.input_dir, text).await
    }

    /// Tell the agent no more input is coming, so it winds down once idle.
    pub async fn close_input(&self) -> std::io::Result<()> {
        self.mark_input_closed();
        ipc::write_close_sentinel(&self.input_dir).await
    }

    fn mark_input_closed(&self) {
        self.input_closed.store(true, Ordering::SeqCst);
    }

    /// Ask the runner to stop the process. The run ends with `RunError::Cancelled`.
    pub fn terminate(&self) {
        self.terminate.notify_one();
    }
}

/// Receives run events while the process is still running.
pub trait RunObserver: Send + Sync {
    /// The sandbox started.
    fn spawned(&self, handle: ProcessHandle);

    /// A frame was parsed.
    fn frame(&self, frame: &Frame);
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn spawned(&self, _handle: ProcessHandle) {}
    fn frame(&self, _frame: &Frame) {}
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub sandbox: String,
    pub frames: u32,
    pub exit_code: Option<i32>,
    /// The process was stopped by the idle timer after producing output.
    pub idle_reaped: bool,
    pub duration: Duration,
    /// Last session id reported by the agent.
    pub new_session_id: Option<String>,
}

/// Why the read loop stopped.
enum StreamEnd {
    Eof,
    IdleTimeout,
    BadFrame(String),
    Cancelled,
}

/// Per-invocation streaming state.
struct Invocation<'a> {
    group: &'a str,
    observer: &'a dyn RunObserver,
    parser: FrameParser,
    frames: u32,
    new_session_id: Option<String>,
    last_activity_at: DateTime<Utc>,
    stdout_tail: TailBuffer,
    stderr_tail: TailBuffer,
}

impl Invocation<'_> {
    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Deliver parsed documents. Stops at the first bad frame.
    fn deliver(&mut self, results: Vec<Result<Value, FrameError>>) -> Result<(), String> {
        for result in results {
            let document = result.map_err(|e| e.to_string())?;
            let frame = Frame::from_document(document)?;
            self.frames += 1;
            if let Some(id) = &frame.output.new_session_id {
                self.new_session_id = Some(id.clone());
            }
            tracing::debug!(
                group = %self.group,
                frame = self.frames,
                status = %frame.output.status,
                "Frame received"
            );
            self.observer.frame(&frame);
        }
        Ok(())
    }
}

/// Runs agents in sandboxes, one invocation per call.
pub struct ProcessRunner {
    config: RunnerConfig,
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn SnapshotSource>,
    allowlist: Option<MountAllowlist>,
    sentinels: Sentinels,
}

impl ProcessRunner {
    pub fn new(
        config: RunnerConfig,
        launcher: Arc<dyn Launcher>,
        store: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            config,
            launcher,
            store,
            allowlist: None,
            sentinels: Sentinels::default(),
        }
    }

    /// Allowlist consulted for additional mounts. Without one, every
    /// additional mount is rejected.
    pub fn with_allowlist(mut self, allowlist: Option<MountAllowlist>) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn with_sentinels(mut self, sentinels: Sentinels) -> Self {
        self.sentinels = sentinels;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one invocation for `group`.
    pub async fn run(
        &self,
        group: &GroupConfig,
        mut input: RunInput,
        observer: &dyn RunObserver,
    ) -> Result<RunSummary, RunError> {
        let group_id = group.id.as_str();
        let setup = |reason: String| RunError::Setup {
            group: group_id.to_string(),
            reason,
        };

        group.validate().map_err(|e| setup(e.to_string()))?;

        let mounts = MountBuilder::new(&self.config, self.allowlist.as_ref())
            .build(group)
            .await
            .map_err(|source| match source {
                MountError::Io(e) => setup(format!("preparing directories: {e}")),
                source => RunError::Mount {
                    group: group_id.to_string(),
                    source,
                },
            })?;

        let carried = self.prepare(group).await.map_err(setup)?;
        if !carried.is_empty() {
            tracing::info!(
                group = %group_id,
                messages = carried.len(),
                "Carrying undelivered follow-up messages into run"
            );
            input.prompt.push('\n');
            input.prompt.push_str(&carried.join("\n"));
        }

        let name = launcher::sandbox_name(&self.config.name_prefix, &group.folder);
        let spec = LaunchSpec {
            name: &name,
            group_folder: &group.folder,
            mounts: &mounts,
        };
        let mut command = self.launcher.command(&spec);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| RunError::TransientSpawn {
            group: group_id.to_string(),
            reason: e.to_string(),
        })?;

        let idle_timeout = group.idle_timeout(self.config.idle_timeout);
        tracing::info!(
            group = %group_id,
            run_id = %run_id,
            sandbox = %name,
            mounts = mounts.len(),
            idle_timeout_secs = idle_timeout.as_secs(),
            scheduled = input.is_scheduled_task,
            "Sandbox started"
        );

        let payload = serde_json::to_vec(&input).map_err(|e| setup(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            let group_for_log = group_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(group = %group_for_log, error = %e, "Failed to write run input");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let handle = ProcessHandle {
            name: name.clone(),
            group: group_id.to_string(),
            input_dir: IpcDir::new(&self.config.data_dir, &group.folder).input_dir(),
            accepts_input: !input.is_scheduled_task,
            input_closed: Arc::new(AtomicBool::new(false)),
            terminate: Arc::new(Notify::new()),
        };
        observer.spawned(handle.clone());

        let mut inv = Invocation {
            group: group_id,
            observer,
            parser: FrameParser::new(self.sentinels.clone(), self.config.max_frame_bytes),
            frames: 0,
            new_session_id: None,
            last_activity_at: started_at,
            stdout_tail: TailBuffer::new(STDOUT_TAIL_BYTES),
            stderr_tail: TailBuffer::new(STDERR_TAIL_BYTES),
        };

        let end = self
            .stream(&mut child, &mut inv, idle_timeout, &handle.terminate)
            .await;
        handle.mark_input_closed();

        let exit_code = match &end {
            StreamEnd::Eof => match tokio::time::timeout(idle_timeout, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    tracing::warn!(group = %group_id, error = %e, "Failed to wait for sandbox");
                    None
                }
                Err(_) => {
                    tracing::warn!(group = %group_id, "Sandbox closed its output but did not exit");
                    self.stop(&name, &mut child).await
                }
            },
            _ => self.stop(&name, &mut child).await,
        };

        let duration = started.elapsed();
        let result = classify(end, exit_code, &inv, idle_timeout);
        let summary = result.map(|idle_reaped| RunSummary {
            run_id,
            sandbox: name.clone(),
            frames: inv.frames,
            exit_code,
            idle_reaped,
            duration,
            new_session_id: inv.new_session_id.clone(),
        });

        let outcome = match &summary {
            Ok(s) if s.idle_reaped => "success (idle reaped)".to_string(),
            Ok(_) => "success".to_string(),
            Err(e) => e.to_string(),
        };
        let record = RunRecord {
            group: group_id,
            run_id,
            sandbox: &name,
            started_at,
            duration,
            exit_code,
            frames: inv.frames,
            outcome: &outcome,
            mounts: &mounts,
            stderr: &inv.stderr_tail,
            stdout: summary.is_err().then_some(&inv.stdout_tail),
        };
        let logs_dir = self.config.groups_dir.join(&group.folder).join("logs");
        if let Err(e) = record.write(&logs_dir).await {
            tracing::warn!(group = %group_id, error = %e, "Failed to write run log");
        }

        match &summary {
            Ok(s) => {
                if s.exit_code.is_some_and(|c| c != 0) {
                    tracing::warn!(
                        group = %group_id,
                        exit_code = ?s.exit_code,
                        frames = s.frames,
                        "Sandbox exited with error after producing output"
                    );
                }
                tracing::info!(
                    group = %group_id,
                    run_id = %run_id,
                    frames = s.frames,
                    idle_reaped = s.idle_reaped,
                    duration_ms = duration.as_millis() as u64,
                    "Sandbox run finished"
                );
            }
            Err(e) => tracing::warn!(
                group = %group_id,
                run_id = %run_id,
                error = %e,
                duration_ms = duration.as_millis() as u64,
                "Sandbox run failed"
            ),
        }
        summary
    }

    /// Write credentials and snapshots, drop a stale close sentinel and
    /// collect follow-up messages the previous run never picked up.
    async fn prepare(&self, group: &GroupConfig) -> Result<Vec<String>, String> {
        let credentials = Credentials::load(&self.config.project_root, &self.config.credential_keys)
            .await
            .map_err(|e| format!("reading .env: {e}"))?;
        if credentials.is_empty() {
            tracing::warn!(group = %group.id, "No credentials found for sandbox");
        }
        credentials
            .write_to(&mounts::env_dir(&self.config, &group.folder))
            .await
            .map_err(|e| format!("writing credentials: {e}"))?;

        let ipc = IpcDir::new(&self.config.data_dir, &group.folder);
        let tasks = self.store.list_tasks().await.map_err(|e| e.to_string())?;
        let groups = self.store.list_groups().await.map_err(|e| e.to_string())?;
        snapshot::write_tasks_snapshot(ipc.root(), group, &tasks)
            .await
            .map_err(|e| format!("writing task snapshot: {e}"))?;
        snapshot::write_groups_snapshot(ipc.root(), group, &groups)
            .await
            .map_err(|e| format!("writing group snapshot: {e}"))?;
        ipc.take_leftover_input()
            .await
            .map_err(|e| format!("collecting leftover input: {e}"))
    }

    /// Read stdout and stderr until both close, the idle timer fires, a frame
    /// is bad, or termination is requested.
    async fn stream(
        &self,
        child: &mut Child,
        inv: &mut Invocation<'_>,
        idle_timeout: Duration,
        terminate: &Notify,
    ) -> StreamEnd {
        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return StreamEnd::Eof;
        };
        let mut out_buf = vec![0u8; 8192];
        let mut err_buf = vec![0u8; 8192];
        let mut stdout_open = true;
        let mut stderr_open = true;

        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            if !stdout_open && !stderr_open {
                return StreamEnd::Eof;
            }
            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => match read {
                    Ok(0) | Err(_) => {
                        stdout_open = false;
                        let results = inv.parser.finish();
                        if let Err(reason) = inv.deliver(results) {
                            return StreamEnd::BadFrame(reason);
                        }
                    }
                    Ok(n) => {
                        inv.touch();
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                        inv.stdout_tail.push(&out_buf[..n]);
                        let results = inv.parser.push(&out_buf[..n]);
                        if let Err(reason) = inv.deliver(results) {
                            return StreamEnd::BadFrame(reason);
                        }
                    }
                },
                read = stderr.read(&mut err_buf), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => {
                        inv.touch();
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                        inv.stderr_tail.push(&err_buf[..n]);
                        for line in String::from_utf8_lossy(&err_buf[..n]).lines() {
                            if !line.trim().is_empty() {
                                tracing::debug!(group = %inv.group, "{line}");
                            }
                        }
                    }
                },
                () = &mut idle => return StreamEnd::IdleTimeout,
                () = terminate.notified() => return StreamEnd::Cancelled,
            }
        }
    }

    /// Stop the sandbox and reap the child. Returns its exit code, if any.
    async fn stop(&self, name: &str, child: &mut Child) -> Option<i32> {
        if let Some(mut stop) = self.launcher.stop_command(name) {
            match tokio::time::timeout(STOP_TIMEOUT, stop.status()).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => {
                    tracing::warn!(sandbox = %name, status = %status, "Stop command failed")
                }
                Ok(Err(e)) => tracing::warn!(sandbox = %name, error = %e, "Stop command failed"),
                Err(_) => tracing::warn!(sandbox = %name, "Stop command timed out"),
            }
            if let Ok(Ok(status)) = tokio::time::timeout(Duration::from_secs(1), child.wait()).await
            {
                return status.code();
            }
        }
        if let Err(e) = child.kill().await {
            tracing::debug!(sandbox = %name, error = %e, "Kill failed");
        }
        child.wait().await.ok().and_then(|s| s.code())
    }
}

/// Turn how the stream ended into the run's result. `Ok(true)` means the run
/// succeeded and was reaped by the idle timer.
fn classify(
    end: StreamEnd,
    exit_code: Option<i32>,
    inv: &Invocation<'_>,
    idle_timeout: Duration,
) -> Result<bool, RunError> {
    let group = inv.group.to_string();
    match end {
        StreamEnd::Cancelled => Err(RunError::Cancelled { group }),
        StreamEnd::BadFrame(reason) => Err(RunError::FrameParse {
            group,
            reason,
            frames_emitted: inv.frames,
        }),
        StreamEnd::IdleTimeout if inv.frames > 0 => Ok(true),
        StreamEnd::IdleTimeout => Err(RunError::PreOutputTimeout {
            group,
            idle_timeout,
            last_activity_at: inv.last_activity_at,
            stderr_tail: inv.stderr_tail.text(),
        }),
        StreamEnd::Eof if inv.frames > 0 => Ok(false),
        StreamEnd::Eof => match exit_code {
            Some(0) => Err(RunError::NoOutput {
                group,
                stderr_tail: inv.stderr_tail.text(),
            }),
            Some(code) if SPAWN_FAILURE_CODES.contains(&code) => {
                let stderr = inv.stderr_tail.text();
                let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty());
                Err(RunError::TransientSpawn {
                    group,
                    reason: match last_line {
                        Some(line) => format!("exit code {code}: {}", line.trim()),
                        None => format!("exit code {code}"),
                    },
                })
            }
            exit_code => Err(RunError::ProcessCrash {
                group,
                exit_code,
                stderr_tail: inv.stderr_tail.text(),
                last_activity_at: inv.last_activity_at,
            }),
        },
    }
}
