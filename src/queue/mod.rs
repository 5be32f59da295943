//! Per-group concurrency queue.
//!
//! Each group runs at most one agent at a time and the host runs at most
//! `max_concurrent` agents overall. Work that cannot start immediately waits
//! in its group's pending list, and the group waits in a FIFO line for a slot.
//!
//! All admission state lives behind one mutex. A slot is reserved inside the
//! lock before the run is spawned, so concurrent enqueues can never admit
//! more than the cap. The lock is never held across an await.

pub mod state;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::QueueConfig;
use crate::error::RunError;
use crate::runner::ProcessHandle;

pub use state::{
    GroupPhase, GroupRunState, GroupStatus, PendingInput, QueueSnapshot, QueueState, QueuedTask,
};

/// Performs the work the queue admits.
///
/// Implementations receive the queue so they can register the process they
/// start and report when it goes idle.
#[async_trait]
pub trait RunHandler: Send + Sync {
    /// Run the agent over the group's pending messages.
    async fn process_messages(&self, queue: Arc<GroupQueue>, group: &str) -> Result<(), RunError>;

    /// Run a scheduled task for the group.
    async fn run_task(
        &self,
        queue: Arc<GroupQueue>,
        group: &str,
        task: &QueuedTask,
    ) -> Result<(), RunError>;

    /// A run failed and will not be retried.
    async fn on_permanent_failure(&self, group: &str, error: &RunError) {
        tracing::error!(group = %group, error = %error, "Group run failed permanently");
    }
}

/// Work admitted under the lock, started after it is released.
struct Launch {
    group: String,
    work: PendingInput,
}

/// The per-group concurrency queue.
pub struct GroupQueue {
    config: QueueConfig,
    handler: Arc<dyn RunHandler>,
    state: Mutex<QueueState>,
    /// Signalled whenever a slot is released.
    released: Notify,
}

impl GroupQueue {
    pub fn new(config: QueueConfig, handler: Arc<dyn RunHandler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            state: Mutex::new(QueueState::default()),
            released: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue state mutex poisoned")
    }

    /// New messages arrived for `group`.
    pub fn enqueue_message_check(self: &Arc<Self>, group: &str) {
        self.admit(group, PendingInput::Messages);
    }

    /// A scheduled task is due for `group`.
    pub fn enqueue_task(self: &Arc<Self>, group: &str, task: QueuedTask) {
        self.admit(group, PendingInput::Task(task));
    }

    fn admit(self: &Arc<Self>, group: &str, input: PendingInput) {
        let mut close = None;
        let launch = {
            let mut guard = self.lock();
            if guard.shutting_down {
                tracing::debug!(group = %group, "Queue shutting down, ignoring enqueue");
                return;
            }
            let max = self.config.max_concurrent;
            let QueueState {
                groups,
                active_count,
                waiting,
                ..
            } = &mut *guard;
            let entry = groups.entry(group.to_string()).or_default();

            match entry.phase {
                GroupPhase::Active => {
                    let is_task = input.is_task();
                    if entry.push_pending(input) {
                        tracing::debug!(group = %group, "Group busy, work pending");
                    }
                    if is_task && entry.idle_waiting {
                        close = entry.process.clone();
                    }
                    None
                }
                GroupPhase::Waiting | GroupPhase::RetryBackoff => {
                    entry.push_pending(input);
                    None
                }
                GroupPhase::Drained => None,
                GroupPhase::Idle if *active_count < max => {
                    entry.transition_to(group, GroupPhase::Active);
                    *active_count += 1;
                    Some(Launch {
                        group: group.to_string(),
                        work: input,
                    })
                }
                GroupPhase::Idle => {
                    entry.push_pending(input);
                    entry.transition_to(group, GroupPhase::Waiting);
                    if !waiting.iter().any(|g| g == group) {
                        waiting.push_back(group.to_string());
                    }
                    tracing::info!(
                        group = %group,
                        active = *active_count,
                        waiting = waiting.len(),
                        "At concurrency limit, group queued"
                    );
                    None
                }
            }
        };

        if let Some(handle) = close {
            tracing::debug!(group = %group, "Closing idle process so pending task can run");
            spawn_close(handle);
        }
        if let Some(launch) = launch {
            self.start(launch);
        }
    }

    /// Attach the process started for the group's current run.
    pub fn register_process(&self, group: &str, handle: ProcessHandle) {
        let mut guard = self.lock();
        match guard.groups.get_mut(group) {
            Some(entry) if entry.phase == GroupPhase::Active => {
                entry.process = Some(handle);
                entry.idle_waiting = false;
            }
            _ => {
                tracing::warn!(group = %group, "Process registered for inactive group, terminating");
                handle.terminate();
            }
        }
    }

    /// Pipe a message into the group's running process.
    ///
    /// Returns false when there is no running process that takes input, which
    /// includes a process whose input was already closed. The caller must then
    /// keep the message and enqueue a message check.
    pub async fn send_message(&self, group: &str, text: &str) -> bool {
        let handle = {
            let mut guard = self.lock();
            let Some(entry) = guard.groups.get_mut(group) else {
                return false;
            };
            if entry.phase != GroupPhase::Active {
                return false;
            }
            let Some(handle) = entry.process.clone().filter(ProcessHandle::accepts_input) else {
                return false;
            };
            entry.idle_waiting = false;
            handle
        };
        match handle.send(text).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(group = %group, error = %e, "Failed to pipe message to running agent");
                false
            }
        }
    }

    /// Tell the group's running process that no more input is coming.
    pub async fn close_stdin(&self, group: &str) {
        let handle = {
            let guard = self.lock();
            guard.groups.get(group).and_then(|g| g.process.clone())
        };
        if let Some(handle) = handle
            && let Err(e) = handle.close_input().await
        {
            tracing::warn!(group = %group, error = %e, "Failed to close agent input");
        }
    }

    /// The group's process finished its current work and is waiting for input.
    /// If a task is pending, the process is closed so the task runs next.
    pub fn notify_idle(&self, group: &str) {
        let close = {
            let mut guard = self.lock();
            let Some(entry) = guard.groups.get_mut(group) else {
                return;
            };
            entry.idle_waiting = true;
            if entry.has_pending_task() {
                entry.process.clone()
            } else {
                None
            }
        };
        if let Some(handle) = close {
            tracing::debug!(group = %group, "Closing idle process so pending task can run");
            spawn_close(handle);
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let guard = self.lock();
        QueueSnapshot {
            active_count: guard.active_count,
            max_concurrent: self.config.max_concurrent,
            waiting: guard.waiting.iter().cloned().collect(),
            shutting_down: guard.shutting_down,
        }
    }

    pub fn group_phase(&self, group: &str) -> Option<GroupPhase> {
        self.lock().groups.get(group).map(|g| g.phase)
    }

    pub fn group_status(&self, group: &str) -> Option<GroupStatus> {
        self.lock().groups.get(group).map(GroupStatus::from)
    }

    /// Stop accepting work and wind down every group.
    ///
    /// Retry timers are cancelled and waiting groups dropped. Active processes
    /// get their input closed and are terminated; runs have up to `grace` to
    /// unwind before every slot is released.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<ProcessHandle> = {
            let mut guard = self.lock();
            guard.shutting_down = true;
            guard.waiting.clear();
            let mut handles = Vec::new();
            for (group, entry) in guard.groups.iter_mut() {
                if let Some(timer) = entry.retry_timer.take() {
                    timer.abort();
                }
                entry.pending.clear();
                match entry.phase {
                    GroupPhase::Active => handles.extend(entry.process.clone()),
                    GroupPhase::Drained => {}
                    _ => {
                        entry.transition_to(group, GroupPhase::Drained);
                    }
                }
            }
            handles
        };

        tracing::info!(active = handles.len(), "Shutting down group queue");
        for handle in &handles {
            if let Err(e) = handle.close_input().await {
                tracing::debug!(group = %handle.group(), error = %e, "Failed to close agent input");
            }
            handle.terminate();
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let released = self.released.notified();
            if self.lock().active_count == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                tracing::warn!(
                    active = self.lock().active_count,
                    "Runs still active after shutdown grace period"
                );
                break;
            }
        }

        let mut guard = self.lock();
        guard.active_count = 0;
        for (group, entry) in guard.groups.iter_mut() {
            if entry.phase != GroupPhase::Drained {
                entry.transition_to(group, GroupPhase::Drained);
            }
            entry.process = None;
        }
    }

    fn start(self: &Arc<Self>, launch: Launch) {
        tracing::info!(
            group = %launch.group,
            task = matches!(launch.work, PendingInput::Task(_)),
            "Starting group run"
        );
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(launch).await });
    }

    async fn run(self: Arc<Self>, launch: Launch) {
        let Launch { group, work } = launch;

        let handler = Arc::clone(&self.handler);
        let queue = Arc::clone(&self);
        let run_group = group.clone();
        let run_work = work.clone();
        let joined = tokio::spawn(async move {
            match &run_work {
                PendingInput::Messages => handler.process_messages(queue, &run_group).await,
                PendingInput::Task(task) => handler.run_task(queue, &run_group, task).await,
            }
        })
        .await;
        let result = joined.unwrap_or_else(|e| {
            Err(RunError::Setup {
                group: group.clone(),
                reason: format!("run task aborted: {e}"),
            })
        });

        let (launches, permanent) = self.complete(&group, work, result);
        for launch in launches {
            self.start(launch);
        }
        if let Some(error) = permanent {
            self.handler.on_permanent_failure(&group, &error).await;
        }
    }

    /// Settle a finished run: schedule a retry, drain the group's own pending
    /// work, or release the slot and promote waiting groups.
    fn complete(
        self: &Arc<Self>,
        group: &str,
        work: PendingInput,
        result: Result<(), RunError>,
    ) -> (Vec<Launch>, Option<RunError>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let shutting_down = state.shutting_down;
        let Some(entry) = state.groups.get_mut(group) else {
            return (Vec::new(), None);
        };
        entry.process = None;
        entry.idle_waiting = false;
        if entry.phase != GroupPhase::Active {
            return (Vec::new(), None);
        }

        if shutting_down {
            entry.transition_to(group, GroupPhase::Drained);
            state.active_count = state.active_count.saturating_sub(1);
            self.released.notify_waiters();
            return (Vec::new(), None);
        }

        let mut permanent = None;
        match result {
            Ok(()) => {
                entry.retry_count = 0;
                entry.last_error = None;
            }
            Err(error) => {
                entry.last_error = Some(error.to_string());
                entry.retry_count += 1;
                let attempts = error.max_attempts(self.config.max_attempts);
                if entry.retry_count < attempts {
                    let delay = self.config.backoff(entry.retry_count);
                    tracing::warn!(
                        group = %group,
                        error = %error,
                        retry = entry.retry_count,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Run failed, scheduling retry"
                    );
                    entry.requeue_front(work);
                    entry.transition_to(group, GroupPhase::RetryBackoff);
                    entry.retry_timer = Some(self.schedule_retry(group.to_string(), delay));
                    state.active_count = state.active_count.saturating_sub(1);
                    self.released.notify_waiters();
                    return (self.promote_waiting(state), None);
                }
                if attempts > 1 {
                    tracing::error!(
                        group = %group,
                        error = %error,
                        attempts = entry.retry_count,
                        "Retries exhausted"
                    );
                }
                entry.retry_count = 0;
                permanent = Some(error);
            }
        }

        if let Some(next) = entry.take_next() {
            tracing::debug!(group = %group, "Draining pending work for group");
            return (
                vec![Launch {
                    group: group.to_string(),
                    work: next,
                }],
                permanent,
            );
        }

        entry.transition_to(group, GroupPhase::Idle);
        state.active_count = state.active_count.saturating_sub(1);
        self.released.notify_waiters();
        (self.promote_waiting(state), permanent)
    }

    /// Hand free slots to waiting groups in arrival order.
    fn promote_waiting(&self, state: &mut QueueState) -> Vec<Launch> {
        let mut launches = Vec::new();
        while state.active_count < self.config.max_concurrent {
            let Some(group) = state.waiting.pop_front() else {
                break;
            };
            let Some(entry) = state.groups.get_mut(&group) else {
                continue;
            };
            if entry.phase != GroupPhase::Waiting {
                continue;
            }
            let Some(work) = entry.take_next() else {
                entry.transition_to(&group, GroupPhase::Idle);
                continue;
            };
            entry.transition_to(&group, GroupPhase::Active);
            state.active_count += 1;
            launches.push(Launch { group, work });
        }
        launches
    }

    fn schedule_retry(self: &Arc<Self>, group: String, delay: Duration) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.retry_due(&group);
        })
    }

    fn retry_due(self: &Arc<Self>, group: &str) {
        let launch = {
            let mut guard = self.lock();
            if guard.shutting_down {
                return;
            }
            let max = self.config.max_concurrent;
            let QueueState {
                groups,
                active_count,
                waiting,
                ..
            } = &mut *guard;
            let Some(entry) = groups.get_mut(group) else {
                return;
            };
            entry.retry_timer = None;
            if entry.phase != GroupPhase::RetryBackoff {
                return;
            }
            if *active_count >= max {
                entry.transition_to(group, GroupPhase::Waiting);
                if !waiting.iter().any(|g| g == group) {
                    waiting.push_back(group.to_string());
                }
                tracing::info!(group = %group, "Retry due at concurrency limit, group queued");
                return;
            }
            let Some(work) = entry.take_next() else {
                entry.transition_to(group, GroupPhase::Idle);
                return;
            };
            entry.transition_to(group, GroupPhase::Active);
            *active_count += 1;
            Launch {
                group: group.to_string(),
                work,
            }
        };
        tracing::info!(group = %group, "Retrying group run");
        self.start(launch);
    }
}

fn spawn_close(handle: ProcessHandle) {
    tokio::spawn(async move {
        if let Err(e) = handle.close_input().await {
            tracing::warn!(group = %handle.group(), error = %e, "Failed to close agent input");
        }
    });
}
