//! Process runner lifecycle against real child processes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use assist_host::config::QueueConfig;
use assist_host::dispatch::{Dispatcher, OutboundMessage};
use assist_host::error::{MountError, RunError};
use assist_host::group::{AdditionalMount, GroupConfig};
use assist_host::queue::{GroupPhase, GroupQueue, QueuedTask};
use assist_host::runner::{ProcessRunner, RunInput};
use assist_host::store::{MemoryStore, ScheduledTask, SnapshotSource, TaskStatus};

use common::{Recorder, ScriptLauncher, frame_sh, runner_config, wait_until};

const IDLE: Duration = Duration::from_millis(400);

fn acme() -> GroupConfig {
    GroupConfig::new("acme@chat", "Acme", "acme")
}

fn input(group: &GroupConfig) -> RunInput {
    RunInput {
        prompt: "hello".into(),
        session_id: None,
        group_folder: group.folder.clone(),
        chat_jid: group.id.clone(),
        is_main: group.is_main,
        is_scheduled_task: false,
    }
}

fn runner(dir: &TempDir, launcher: Arc<ScriptLauncher>) -> ProcessRunner {
    runner_with_store(dir, launcher, Arc::new(MemoryStore::new(vec![acme()], Vec::new())))
}

fn runner_with_store(
    dir: &TempDir,
    launcher: Arc<ScriptLauncher>,
    store: Arc<dyn SnapshotSource>,
) -> ProcessRunner {
    ProcessRunner::new(runner_config(dir.path(), IDLE), launcher, store)
}

#[tokio::test]
async fn frame_is_extracted_from_noisy_output() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(format!(
        "echo noise; {}; echo 'more noise'",
        frame_sh(r#"{"status":"ok"}"#)
    ));
    let recorder = Recorder::default();
    let group = acme();

    let summary = runner(&dir, launcher)
        .run(&group, input(&group), &recorder)
        .await
        .unwrap();

    assert_eq!(summary.frames, 1);
    assert_eq!(summary.exit_code, Some(0));
    assert!(!summary.idle_reaped);
    assert_eq!(recorder.frames(), vec![json!({"status": "ok"})]);
    assert_eq!(recorder.handles.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn silence_before_output_is_a_timeout() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new("echo 'pulling image' >&2; exec sleep 10");
    let group = acme();

    let started = std::time::Instant::now();
    let err = runner(&dir, launcher)
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        RunError::PreOutputTimeout { stderr_tail, .. } => {
            assert!(stderr_tail.contains("pulling image"))
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn idle_after_output_is_success() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(format!(
        "{}; exec sleep 10",
        frame_sh(r#"{"status":"success","result":"done","newSessionId":"s-1"}"#)
    ));
    let group = acme();

    let summary = runner(&dir, launcher)
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap();

    assert!(summary.idle_reaped);
    assert_eq!(summary.frames, 1);
    assert_eq!(summary.new_session_id.as_deref(), Some("s-1"));
}

#[tokio::test]
async fn crash_before_output_carries_context() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new("echo 'fatal: boom' >&2; exit 3");
    let group = acme();

    let err = runner(&dir, launcher)
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap_err();

    match err {
        RunError::ProcessCrash {
            exit_code,
            stderr_tail,
            ..
        } => {
            assert_eq!(exit_code, Some(3));
            assert!(stderr_tail.contains("fatal: boom"));
        }
        other => panic!("expected crash, got {other:?}"),
    }
}

#[tokio::test]
async fn clean_exit_without_output_is_an_error() {
    let dir = TempDir::new().unwrap();
    let group = acme();
    let err = runner(&dir, ScriptLauncher::new("echo 'nothing to say'"))
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::NoOutput { .. }));
}

#[tokio::test]
async fn missing_entrypoint_is_transient() {
    let dir = TempDir::new().unwrap();
    let group = acme();
    let err = runner(&dir, ScriptLauncher::new("exec /nonexistent/agent-entrypoint"))
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap_err();
    assert!(err.is_transient(), "got {err:?}");
}

#[tokio::test]
async fn nonzero_exit_after_output_is_success() {
    let dir = TempDir::new().unwrap();
    let group = acme();
    let launcher = ScriptLauncher::new(format!("{}; exit 1", frame_sh(r#"{"status":"success"}"#)));
    let summary = runner(&dir, launcher)
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap();
    assert_eq!(summary.exit_code, Some(1));
    assert_eq!(summary.frames, 1);
}

#[tokio::test]
async fn malformed_frame_terminates_process() {
    let dir = TempDir::new().unwrap();
    let group = acme();
    let launcher = ScriptLauncher::new(format!(
        "{}; printf '%s\\n' '{}' 'not json' '{}'; exec sleep 10",
        frame_sh(r#"{"status":"success","result":"first"}"#),
        common::START,
        common::END
    ));
    let recorder = Recorder::default();

    let started = std::time::Instant::now();
    let err = runner(&dir, launcher)
        .run(&group, input(&group), &recorder)
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, RunError::FrameParse { frames_emitted: 1, .. }));
    assert_eq!(recorder.frames().len(), 1);
}

#[tokio::test]
async fn steady_output_keeps_run_alive_past_idle_timeout() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(format!(
        "for i in 1 2 3 4 5 6; do echo tick; sleep 0.2; done; {}",
        frame_sh(r#"{"status":"success","result":"slow"}"#)
    ));
    let group = acme();

    let started = std::time::Instant::now();
    let summary = runner(&dir, launcher)
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap();

    assert!(started.elapsed() > IDLE * 2);
    assert_eq!(summary.frames, 1);
    assert!(!summary.idle_reaped);
}

#[tokio::test]
async fn stderr_activity_also_resets_idle_timer() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(format!(
        "for i in 1 2 3 4 5 6; do echo 'still thinking' >&2; sleep 0.2; done; {}",
        frame_sh(r#"{"status":"success","result":"slow"}"#)
    ));
    let group = acme();

    let summary = runner(&dir, launcher)
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap();

    assert_eq!(summary.frames, 1);
    assert!(!summary.idle_reaped);
}

#[tokio::test]
async fn leftover_input_is_carried_into_next_run() {
    let dir = TempDir::new().unwrap();
    let input_dir = dir.path().join("data/ipc/acme/input");
    std::fs::create_dir_all(&input_dir).unwrap();
    std::fs::write(input_dir.join("_close"), "").unwrap();
    std::fs::write(
        input_dir.join("1000-abcdef.json"),
        r#"{"type":"message","text":"late question"}"#,
    )
    .unwrap();

    let script = format!(
        r#"if grep -q 'late question' && [ ! -f "$IPC_DIR/input/_close" ]; then {}; fi"#,
        frame_sh(r#"{"status":"success","result":"carried"}"#)
    );
    let recorder = Recorder::default();
    let group = acme();
    runner(&dir, ScriptLauncher::new(script))
        .run(&group, input(&group), &recorder)
        .await
        .unwrap();

    assert_eq!(recorder.frames().len(), 1);
    assert_eq!(std::fs::read_dir(&input_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn traversing_mount_is_rejected_before_spawn() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(frame_sh(r#"{"status":"ok"}"#));
    let group = acme().with_mount(AdditionalMount::new(
        dir.path().to_string_lossy().into_owned(),
        "../../etc",
    ));

    let err = runner(&dir, launcher.clone())
        .run(&group, input(&group), &Recorder::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::Mount {
            source: MountError::InvalidContainerPath { .. },
            ..
        }
    ));
    assert_eq!(launcher.launches(), 0);
    assert!(!dir.path().join("groups/acme").exists());
}

#[tokio::test]
async fn input_reaches_stdin_and_snapshots_are_written() {
    let dir = TempDir::new().unwrap();
    let script = format!(
        r#"if grep -q '"isScheduledTask":true'; then {}; fi"#,
        frame_sh(r#"{"status":"success","result":"task seen"}"#)
    );
    let task = ScheduledTask {
        id: "t1".into(),
        group_folder: "acme".into(),
        prompt: "report".into(),
        schedule_type: "cron".into(),
        schedule_value: "0 9 * * *".into(),
        status: TaskStatus::Active,
        next_run: None,
    };
    let other = ScheduledTask {
        id: "t2".into(),
        group_folder: "beta".into(),
        ..task.clone()
    };
    let store = Arc::new(MemoryStore::new(vec![acme()], vec![task, other]));
    let group = acme();
    let mut run_input = input(&group);
    run_input.is_scheduled_task = true;

    let recorder = Recorder::default();
    runner_with_store(&dir, ScriptLauncher::new(script), store)
        .run(&group, run_input, &recorder)
        .await
        .unwrap();

    assert!(!recorder.handles.lock().unwrap()[0].accepts_input());
    let ipc = dir.path().join("data/ipc/acme");
    let tasks: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(ipc.join("current_tasks.json")).unwrap())
            .unwrap();
    assert_eq!(tasks.as_array().unwrap().len(), 1);
    assert!(dir.path().join("data/env/acme/env").exists());

    let logs: Vec<_> = std::fs::read_dir(dir.path().join("groups/acme/logs"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(logs.len(), 1);
}

/// Agent that answers, waits for follow-ups until closed, then reports how
/// many it received.
const CONVERSATION: &str = r#"
printf '%s\n' '---AGENT_OUTPUT_START---' '{"status":"success","result":"ready"}' '---AGENT_OUTPUT_END---'
while [ ! -f "$IPC_DIR/input/_close" ]; do sleep 0.05; done
n=$(ls "$IPC_DIR/input" | grep -c '\.json$')
rm -f "$IPC_DIR"/input/*.json
printf '%s\n' '---AGENT_OUTPUT_START---' "{\"status\":\"success\",\"result\":\"got $n\"}" '---AGENT_OUTPUT_END---'
"#;

async fn next_text(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> String {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed")
        .text
}

#[tokio::test]
async fn follow_up_messages_reach_running_agent() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SnapshotSource> = Arc::new(MemoryStore::new(vec![acme()], Vec::new()));
    let runner = Arc::new(ProcessRunner::new(
        runner_config(dir.path(), Duration::from_secs(10)),
        ScriptLauncher::new(CONVERSATION),
        Arc::clone(&store),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(runner, store, tx));
    let queue = GroupQueue::new(QueueConfig::default(), dispatcher.clone());

    dispatcher.push_message("acme@chat", "hi");
    queue.enqueue_message_check("acme@chat");

    assert_eq!(next_text(&mut rx).await, "ready");
    assert!(queue.send_message("acme@chat", "one more thing").await);
    queue.close_stdin("acme@chat").await;
    assert_eq!(next_text(&mut rx).await, "got 1");

    assert!(
        wait_until(Duration::from_secs(5), || {
            queue.group_phase("acme@chat") == Some(GroupPhase::Idle)
        })
        .await
    );
    assert_eq!(dispatcher.pending_messages("acme@chat"), 0);
    assert!(!queue.send_message("acme@chat", "too late").await);
}

#[tokio::test]
async fn repeated_crash_notifies_user() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SnapshotSource> = Arc::new(MemoryStore::new(vec![acme()], Vec::new()));
    let launcher = ScriptLauncher::new("exit 2");
    let runner = Arc::new(ProcessRunner::new(
        runner_config(dir.path(), IDLE),
        launcher.clone(),
        Arc::clone(&store),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(runner, store, tx));
    let queue = GroupQueue::new(
        QueueConfig {
            max_concurrent: 1,
            retry_base: Duration::from_millis(20),
            max_attempts: 5,
        },
        dispatcher.clone(),
    );

    dispatcher.push_message("acme@chat", "hi");
    queue.enqueue_message_check("acme@chat");

    assert_eq!(next_text(&mut rx).await, "The assistant stopped unexpectedly.");
    assert_eq!(launcher.launches(), 2);
    // Unanswered messages stay for the next attempt.
    assert_eq!(dispatcher.pending_messages("acme@chat"), 1);
}

#[tokio::test]
async fn task_closes_idle_conversation_and_runs_next() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SnapshotSource> = Arc::new(MemoryStore::new(vec![acme()], Vec::new()));
    let launcher = ScriptLauncher::new(CONVERSATION);
    let runner = Arc::new(ProcessRunner::new(
        runner_config(dir.path(), Duration::from_secs(1)),
        launcher.clone(),
        Arc::clone(&store),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(runner, store, tx));
    let queue = GroupQueue::new(QueueConfig::default(), dispatcher.clone());

    dispatcher.push_message("acme@chat", "hi");
    queue.enqueue_message_check("acme@chat");
    assert_eq!(next_text(&mut rx).await, "ready");

    // The agent reported a result, so the pending task closes its input.
    queue.enqueue_task("acme@chat", QueuedTask::new("t1", "daily summary"));
    assert_eq!(next_text(&mut rx).await, "got 0");
    assert_eq!(next_text(&mut rx).await, "ready");
    assert_eq!(launcher.launches(), 2);

    assert!(
        wait_until(Duration::from_secs(5), || {
            queue.group_phase("acme@chat") == Some(GroupPhase::Idle)
        })
        .await
    );
}

/// Agent that answers a prompt mentioning the late question directly and
/// otherwise behaves like `CONVERSATION`.
const LATE_AWARE: &str = r#"
if grep -q 'late question'; then
  printf '%s\n' '---AGENT_OUTPUT_START---' '{"status":"success","result":"answered late"}' '---AGENT_OUTPUT_END---'
  exit 0
fi
printf '%s\n' '---AGENT_OUTPUT_START---' '{"status":"success","result":"ready"}' '---AGENT_OUTPUT_END---'
while [ ! -f "$IPC_DIR/input/_close" ]; do sleep 0.05; done
n=$(ls "$IPC_DIR/input" | grep -c '\.json$')
rm -f "$IPC_DIR"/input/*.json
printf '%s\n' '---AGENT_OUTPUT_START---' "{\"status\":\"success\",\"result\":\"got $n\"}" '---AGENT_OUTPUT_END---'
"#;

#[tokio::test]
async fn message_after_close_is_refused_and_queued() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SnapshotSource> = Arc::new(MemoryStore::new(vec![acme()], Vec::new()));
    let launcher = ScriptLauncher::new(LATE_AWARE);
    let runner = Arc::new(ProcessRunner::new(
        runner_config(dir.path(), Duration::from_secs(10)),
        launcher.clone(),
        Arc::clone(&store),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(runner, store, tx));
    let queue = GroupQueue::new(QueueConfig::default(), dispatcher.clone());

    dispatcher.push_message("acme@chat", "hi");
    queue.enqueue_message_check("acme@chat");
    assert_eq!(next_text(&mut rx).await, "ready");

    queue.close_stdin("acme@chat").await;
    assert!(!queue.send_message("acme@chat", "late question").await);
    let input_dir = dir.path().join("data/ipc/acme/input");
    assert!(
        std::fs::read_dir(&input_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .all(|e| e.file_name() == "_close")
    );

    // Refused input goes through the inbox instead.
    dispatcher.push_message("acme@chat", "late question");
    queue.enqueue_message_check("acme@chat");

    assert_eq!(next_text(&mut rx).await, "got 0");
    assert_eq!(next_text(&mut rx).await, "answered late");
    assert_eq!(launcher.launches(), 2);
    assert!(
        wait_until(Duration::from_secs(5), || {
            queue.group_phase("acme@chat") == Some(GroupPhase::Idle)
        })
        .await
    );
    assert_eq!(dispatcher.pending_messages("acme@chat"), 0);
}
