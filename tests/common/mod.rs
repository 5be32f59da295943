//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use assist_host::config::RunnerConfig;
use assist_host::error::RunError;
use assist_host::queue::{GroupQueue, QueuedTask, RunHandler};
use assist_host::runner::{Frame, LaunchSpec, Launcher, ProcessHandle, RunObserver};

pub const START: &str = "---AGENT_OUTPUT_START---";
pub const END: &str = "---AGENT_OUTPUT_END---";

/// Shell snippet printing one framed document.
pub fn frame_sh(json: &str) -> String {
    format!("printf '%s\\n' '{START}' '{json}' '{END}'")
}

/// Launches `sh -c <script>` instead of a container.
///
/// `IPC_DIR` points at the group's IPC directory on the host.
pub struct ScriptLauncher {
    script: String,
    pub launches: AtomicUsize,
}

impl ScriptLauncher {
    pub fn new(script: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            script: script.into(),
            launches: AtomicUsize::new(0),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for ScriptLauncher {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.script);
        if let Some(ipc) = spec
            .mounts
            .iter()
            .find(|m| m.container_path == "/workspace/ipc")
        {
            command.env("IPC_DIR", &ipc.host_path);
        }
        command
    }
}

/// Runner configuration rooted in a temp dir with a short idle timeout.
pub fn runner_config(root: &std::path::Path, idle: Duration) -> RunnerConfig {
    let mut config = RunnerConfig::rooted_at(root);
    config.idle_timeout = idle;
    config.credential_keys = vec!["ASSIST_HOST_TEST_CREDENTIAL".to_string()];
    config
}

/// Collects everything a run reports.
#[derive(Default)]
pub struct Recorder {
    pub frames: Mutex<Vec<Frame>>,
    pub handles: Mutex<Vec<ProcessHandle>>,
}

impl Recorder {
    pub fn frames(&self) -> Vec<serde_json::Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.raw.clone())
            .collect()
    }
}

impl RunObserver for Recorder {
    fn spawned(&self, handle: ProcessHandle) {
        self.handles.lock().unwrap().push(handle);
    }

    fn frame(&self, frame: &Frame) {
        self.frames.lock().unwrap().push(frame.clone());
    }
}

/// One recorded run start.
#[derive(Debug, Clone)]
pub struct Start {
    pub group: String,
    pub task: Option<String>,
    pub at: Instant,
}

/// Handler that plays back scripted outcomes without spawning processes.
///
/// Each run takes `run_for`, then pops the group's next scripted result
/// (default success). Tracks concurrency so tests can assert on it.
pub struct ScriptedHandler {
    run_for: Duration,
    results: Mutex<HashMap<String, VecDeque<Result<(), RunError>>>>,
    pub starts: Mutex<Vec<Start>>,
    pub permanent: Mutex<Vec<(String, String)>>,
    running: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub max_per_group: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(run_for: Duration) -> Arc<Self> {
        Arc::new(Self {
            run_for,
            results: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            permanent: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            max_per_group: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, group: &str, results: Vec<Result<(), RunError>>) {
        self.results
            .lock()
            .unwrap()
            .insert(group.to_string(), results.into());
    }

    pub fn starts(&self) -> Vec<Start> {
        self.starts.lock().unwrap().clone()
    }

    pub fn start_order(&self) -> Vec<String> {
        self.starts().into_iter().map(|s| s.group).collect()
    }

    pub fn permanent(&self) -> Vec<(String, String)> {
        self.permanent.lock().unwrap().clone()
    }

    async fn play(&self, group: &str, task: Option<&QueuedTask>) -> Result<(), RunError> {
        self.starts.lock().unwrap().push(Start {
            group: group.to_string(),
            task: task.map(|t| t.id.clone()),
            at: Instant::now(),
        });
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        {
            let mut running = self.running.lock().unwrap();
            let count = running.entry(group.to_string()).or_default();
            *count += 1;
            self.max_per_group.fetch_max(*count, Ordering::SeqCst);
        }

        tokio::time::sleep(self.run_for).await;

        *self.running.lock().unwrap().get_mut(group).unwrap() -= 1;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap()
            .get_mut(group)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl RunHandler for ScriptedHandler {
    async fn process_messages(&self, _queue: Arc<GroupQueue>, group: &str) -> Result<(), RunError> {
        self.play(group, None).await
    }

    async fn run_task(
        &self,
        _queue: Arc<GroupQueue>,
        group: &str,
        task: &QueuedTask,
    ) -> Result<(), RunError> {
        self.play(group, Some(task)).await
    }

    async fn on_permanent_failure(&self, group: &str, error: &RunError) {
        self.permanent
            .lock()
            .unwrap()
            .push((group.to_string(), error.to_string()));
    }
}

pub fn transient(group: &str) -> RunError {
    RunError::TransientSpawn {
        group: group.to_string(),
        reason: "daemon unavailable".to_string(),
    }
}

pub fn crash(group: &str) -> RunError {
    RunError::ProcessCrash {
        group: group.to_string(),
        exit_code: Some(1),
        stderr_tail: "boom".to_string(),
        last_activity_at: chrono::Utc::now(),
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
