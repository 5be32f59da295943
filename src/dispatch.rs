//! Dispatcher: turns queue admissions into sandbox runs.
//!
//! Holds each group's unprocessed messages and agent session, looks the group
//! up in the store, runs the agent and forwards its results as
//! [`OutboundMessage`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::error::RunError;
use crate::group::GroupConfig;
use crate::queue::{GroupQueue, QueuedTask, RunHandler};
use crate::runner::{Frame, ProcessHandle, ProcessRunner, RunInput, RunObserver};
use crate::store::SnapshotSource;

/// A message for a group's chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub group: String,
    pub text: String,
}

/// Runs queued work for groups.
pub struct Dispatcher {
    runner: Arc<ProcessRunner>,
    store: Arc<dyn SnapshotSource>,
    inbox: Mutex<HashMap<String, Vec<String>>>,
    sessions: RwLock<HashMap<String, String>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl Dispatcher {
    pub fn new(
        runner: Arc<ProcessRunner>,
        store: Arc<dyn SnapshotSource>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            runner,
            store,
            inbox: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            outbound,
        }
    }

    /// Store a message until the group's next run picks it up.
    pub fn push_message(&self, group: &str, text: impl Into<String>) {
        self.inbox
            .lock()
            .expect("inbox mutex poisoned")
            .entry(group.to_string())
            .or_default()
            .push(text.into());
    }

    pub fn pending_messages(&self, group: &str) -> usize {
        self.inbox
            .lock()
            .expect("inbox mutex poisoned")
            .get(group)
            .map_or(0, Vec::len)
    }

    pub async fn session(&self, group: &str) -> Option<String> {
        self.sessions.read().await.get(group).cloned()
    }

    async fn group_config(&self, group: &str) -> Result<GroupConfig, RunError> {
        let setup = |reason: String| RunError::Setup {
            group: group.to_string(),
            reason,
        };
        self.store
            .get_group(group)
            .await
            .map_err(|e| setup(e.to_string()))?
            .ok_or_else(|| setup("group is not registered".to_string()))
    }

    async fn run(
        &self,
        queue: Arc<GroupQueue>,
        config: &GroupConfig,
        prompt: String,
        scheduled: bool,
    ) -> Result<(), RunError> {
        let input = RunInput {
            prompt,
            session_id: self.session(&config.id).await,
            group_folder: config.folder.clone(),
            chat_jid: config.id.clone(),
            is_main: config.is_main,
            is_scheduled_task: scheduled,
        };
        let observer = Forwarder {
            queue,
            group: config.id.clone(),
            outbound: self.outbound.clone(),
        };
        let summary = self.runner.run(config, input, &observer).await?;
        if let Some(session) = summary.new_session_id {
            self.sessions.write().await.insert(config.id.clone(), session);
        }
        Ok(())
    }
}

#[async_trait]
impl RunHandler for Dispatcher {
    async fn process_messages(&self, queue: Arc<GroupQueue>, group: &str) -> Result<(), RunError> {
        let messages = self
            .inbox
            .lock()
            .expect("inbox mutex poisoned")
            .get(group)
            .cloned()
            .unwrap_or_default();
        if messages.is_empty() {
            tracing::debug!(group = %group, "No pending messages");
            return Ok(());
        }

        let config = self.group_config(group).await?;
        self.run(queue, &config, messages.join("\n"), false).await?;

        // Messages that arrived during the run stay for the next one.
        if let Some(pending) = self.inbox.lock().expect("inbox mutex poisoned").get_mut(group) {
            pending.drain(..messages.len().min(pending.len()));
        }
        Ok(())
    }

    async fn run_task(
        &self,
        queue: Arc<GroupQueue>,
        group: &str,
        task: &QueuedTask,
    ) -> Result<(), RunError> {
        tracing::info!(group = %group, task_id = %task.id, "Running scheduled task");
        let config = self.group_config(group).await?;
        self.run(queue, &config, task.prompt.clone(), true).await
    }

    async fn on_permanent_failure(&self, group: &str, error: &RunError) {
        tracing::error!(group = %group, error = %error, "Group run failed permanently");
        send_outbound(&self.outbound, group, error.user_message().to_string());
    }
}

/// Forwards frames from a run to the outbound channel.
struct Forwarder {
    queue: Arc<GroupQueue>,
    group: String,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl RunObserver for Forwarder {
    fn spawned(&self, handle: ProcessHandle) {
        self.queue.register_process(&self.group, handle);
    }

    fn frame(&self, frame: &Frame) {
        if frame.output.is_error() {
            tracing::warn!(
                group = %self.group,
                error = frame.output.error.as_deref().unwrap_or("unknown"),
                "Agent reported an error"
            );
            return;
        }
        if let Some(text) = frame.output.result_text() {
            let text = strip_internal(&text);
            if !text.is_empty() {
                send_outbound(&self.outbound, &self.group, text);
            }
        }
        // A result means the agent finished this turn and is waiting for input.
        self.queue.notify_idle(&self.group);
    }
}

/// Queue a message for the group's chat. Returns false if nobody is listening.
fn send_outbound(
    outbound: &mpsc::UnboundedSender<OutboundMessage>,
    group: &str,
    text: String,
) -> bool {
    match outbound.send(OutboundMessage {
        group: group.to_string(),
        text,
    }) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(group = %group, error = %e, "Outbound channel closed, dropping message");
            false
        }
    }
}

/// Drop `<internal>...</internal>` reasoning blocks the agent keeps for itself.
fn strip_internal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<internal>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</internal>") {
            Some(end) => rest = &rest[start + end + "</internal>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}
