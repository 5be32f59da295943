use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use assist_host::config::HostConfig;
use assist_host::dispatch::Dispatcher;
use assist_host::queue::{GroupQueue, QueuedTask};
use assist_host::runner::{ContainerLauncher, MountAllowlist, ProcessRunner, runtime};
use assist_host::store::{JsonStore, SnapshotSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing();

    let config = HostConfig::from_env();

    eprintln!("🛠  Assist host v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Runtime: {} ({})", config.runtime, config.image);
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Max concurrent: {}", config.max_concurrent);
    eprintln!("   Input: `<group_id> <message>`, `/task <task_id>`, `/status`, `/quit`\n");

    runtime::ensure_available(&config.runtime)
        .await
        .context("container runtime is required")?;
    if let Err(e) = runtime::cleanup_orphans(&config.runtime, &config.name_prefix).await {
        tracing::warn!(error = %e, "Failed to clean up orphaned sandboxes");
    }

    let allowlist = match &config.mount_allowlist {
        Some(path) => MountAllowlist::load(path)
            .with_context(|| format!("loading mount allowlist {}", path.display()))?,
        None => None,
    };
    if allowlist.is_none() {
        tracing::info!("No mount allowlist, additional mounts are disabled");
    }

    let store: Arc<dyn SnapshotSource> = Arc::new(JsonStore::new(&config.data_dir));
    let launcher = Arc::new(ContainerLauncher::new(&config.runtime, &config.image));
    let runner = Arc::new(
        ProcessRunner::new(config.runner(), launcher, Arc::clone(&store)).with_allowlist(allowlist),
    );

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(runner, Arc::clone(&store), outbound_tx));
    let queue = GroupQueue::new(config.queue(), dispatcher.clone());

    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            println!("[{}] {}", msg.group, msg.text);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line == "/quit" {
                        break;
                    }
                    if !line.is_empty() {
                        handle_line(&queue, &dispatcher, store.as_ref(), line).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Error reading stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    queue.shutdown(config.shutdown_grace).await;
    Ok(())
}

async fn handle_line(
    queue: &Arc<GroupQueue>,
    dispatcher: &Dispatcher,
    store: &dyn SnapshotSource,
    line: &str,
) {
    if line == "/status" {
        match serde_json::to_string_pretty(&queue.snapshot()) {
            Ok(json) => eprintln!("{json}"),
            Err(e) => tracing::warn!(error = %e, "Failed to render queue status"),
        }
        return;
    }

    if let Some(task_id) = line.strip_prefix("/task ") {
        if let Err(e) = enqueue_task(queue, store, task_id.trim()).await {
            eprintln!("Error: {e:#}");
        }
        return;
    }

    let Some((group, text)) = line.split_once(char::is_whitespace) else {
        eprintln!("Usage: <group_id> <message>");
        return;
    };
    let text = text.trim();

    match store.get_group(group).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            eprintln!("Unknown group: {group}");
            return;
        }
        Err(e) => {
            tracing::error!(group = %group, error = %e, "Failed to look up group");
            return;
        }
    }

    if queue.send_message(group, text).await {
        tracing::debug!(group = %group, "Message piped to running agent");
        return;
    }
    dispatcher.push_message(group, text);
    queue.enqueue_message_check(group);
}

async fn enqueue_task(
    queue: &Arc<GroupQueue>,
    store: &dyn SnapshotSource,
    task_id: &str,
) -> anyhow::Result<()> {
    let tasks = store.list_tasks().await?;
    let task = tasks
        .iter()
        .find(|t| t.id == task_id)
        .with_context(|| format!("no task with id {task_id}"))?;
    let group = store
        .list_groups()
        .await?
        .into_iter()
        .find(|g| g.folder == task.group_folder)
        .with_context(|| format!("no group registered for folder {}", task.group_folder))?;
    queue.enqueue_task(&group.id, QueuedTask::from(task));
    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let Ok(log_dir) = std::env::var("HOST_LOG_DIR") else {
        tracing_subscriber::registry().with(filter).with(console).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "assist-host.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Some(guard)
}
