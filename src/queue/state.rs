//! Per-group run state and the shared admission state.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::runner::ProcessHandle;
use crate::store::ScheduledTask;

/// Where a group is in its run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    /// Nothing running, nothing pending.
    #[default]
    Idle,
    /// Holds a concurrency slot; a run is in flight.
    Active,
    /// Has pending work and is queued for a slot.
    Waiting,
    /// A failed run is scheduled to retry; no slot held.
    RetryBackoff,
    /// The host shut down; no further work is accepted.
    Drained,
}

impl GroupPhase {
    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: GroupPhase) -> bool {
        use GroupPhase::*;

        matches!(
            (self, target),
            (Idle, Active) | (Idle, Waiting) |
            (Active, Idle) | (Active, RetryBackoff) |
            (Waiting, Active) | (Waiting, Idle) |
            (RetryBackoff, Active) | (RetryBackoff, Waiting) | (RetryBackoff, Idle) |
            // Shutdown reaches every non-terminal phase
            (Idle, Drained) | (Active, Drained) | (Waiting, Drained) | (RetryBackoff, Drained)
        )
    }
}

impl std::fmt::Display for GroupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::RetryBackoff => "retry_backoff",
            Self::Drained => "drained",
        };
        write!(f, "{s}")
    }
}

/// A scheduled task handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: String,
    pub prompt: String,
}

impl QueuedTask {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
        }
    }
}

impl From<&ScheduledTask> for QueuedTask {
    fn from(task: &ScheduledTask) -> Self {
        Self::new(&task.id, &task.prompt)
    }
}

/// A unit of work waiting for the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingInput {
    /// New messages may be waiting. Coalesced: at most one per group.
    Messages,
    /// A scheduled task. Deduplicated by id.
    Task(QueuedTask),
}

impl PendingInput {
    pub fn is_task(&self) -> bool {
        matches!(self, Self::Task(_))
    }

    fn same_slot(&self, other: &PendingInput) -> bool {
        match (self, other) {
            (Self::Messages, Self::Messages) => true,
            (Self::Task(a), Self::Task(b)) => a.id == b.id,
            _ => false,
        }
    }
}

/// Run state of one group. Created on first enqueue, kept for the host's lifetime.
#[derive(Debug, Default)]
pub struct GroupRunState {
    pub phase: GroupPhase,
    pub process: Option<ProcessHandle>,
    pub pending: VecDeque<PendingInput>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub retry_timer: Option<JoinHandle<()>>,
    /// The running process reported it is waiting for input.
    pub idle_waiting: bool,
}

impl GroupRunState {
    /// Move to `target`. Invalid transitions are refused and logged.
    pub fn transition_to(&mut self, group: &str, target: GroupPhase) -> bool {
        if !self.phase.can_transition_to(target) {
            tracing::warn!(
                group = %group,
                from = %self.phase,
                to = %target,
                "Refused invalid group transition"
            );
            return false;
        }
        tracing::trace!(group = %group, from = %self.phase, to = %target, "Group transition");
        self.phase = target;
        true
    }

    /// Record pending work. Returns false when it was already pending.
    pub fn push_pending(&mut self, input: PendingInput) -> bool {
        if self.pending.iter().any(|p| p.same_slot(&input)) {
            return false;
        }
        self.pending.push_back(input);
        true
    }

    /// Put failed work back at the front so a retry picks it up first.
    pub fn requeue_front(&mut self, input: PendingInput) {
        self.pending.retain(|p| !p.same_slot(&input));
        self.pending.push_front(input);
    }

    /// Next work for this group, in arrival order.
    pub fn take_next(&mut self) -> Option<PendingInput> {
        self.pending.pop_front()
    }

    pub fn has_pending_task(&self) -> bool {
        self.pending.iter().any(PendingInput::is_task)
    }
}

/// Everything the queue guards with its single lock.
#[derive(Debug, Default)]
pub struct QueueState {
    pub groups: HashMap<String, GroupRunState>,
    pub active_count: usize,
    /// Groups queued for a slot, in arrival order, without duplicates.
    pub waiting: VecDeque<String>,
    pub shutting_down: bool,
}

/// Read-only view of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub phase: GroupPhase,
    pub pending: usize,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub has_process: bool,
}

impl From<&GroupRunState> for GroupStatus {
    fn from(state: &GroupRunState) -> Self {
        Self {
            phase: state.phase,
            pending: state.pending.len(),
            retry_count: state.retry_count,
            last_error: state.last_error.clone(),
            has_process: state.process.is_some(),
        }
    }
}

/// Read-only view of global admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub waiting: Vec<String>,
    pub shutting_down: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions() {
        use GroupPhase::*;

        assert!(Idle.can_transition_to(Active));
        assert!(Idle.can_transition_to(Waiting));
        assert!(Active.can_transition_to(RetryBackoff));
        assert!(RetryBackoff.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Active));

        assert!(!Idle.can_transition_to(RetryBackoff));
        assert!(!Waiting.can_transition_to(RetryBackoff));
        assert!(!Active.can_transition_to(Waiting));
        for target in [Idle, Active, Waiting, RetryBackoff] {
            assert!(!Drained.can_transition_to(target));
        }
    }

    #[test]
    fn refused_transition_keeps_phase() {
        let mut state = GroupRunState::default();
        assert!(!state.transition_to("acme", GroupPhase::RetryBackoff));
        assert_eq!(state.phase, GroupPhase::Idle);
        assert!(state.transition_to("acme", GroupPhase::Active));
        assert_eq!(state.phase, GroupPhase::Active);
    }

    #[test]
    fn messages_coalesce_and_tasks_dedupe() {
        let mut state = GroupRunState::default();
        assert!(state.push_pending(PendingInput::Messages));
        assert!(!state.push_pending(PendingInput::Messages));
        assert!(state.push_pending(PendingInput::Task(QueuedTask::new("t1", "a"))));
        assert!(!state.push_pending(PendingInput::Task(QueuedTask::new("t1", "b"))));
        assert!(state.push_pending(PendingInput::Task(QueuedTask::new("t2", "c"))));
        assert_eq!(state.pending.len(), 3);
    }

    #[test]
    fn pending_work_drains_in_arrival_order() {
        let mut state = GroupRunState::default();
        state.push_pending(PendingInput::Messages);
        state.push_pending(PendingInput::Task(QueuedTask::new("t1", "a")));
        state.push_pending(PendingInput::Task(QueuedTask::new("t2", "b")));

        assert_eq!(state.take_next(), Some(PendingInput::Messages));
        assert!(state.has_pending_task());
        assert_eq!(
            state.take_next(),
            Some(PendingInput::Task(QueuedTask::new("t1", "a")))
        );
        assert_eq!(
            state.take_next(),
            Some(PendingInput::Task(QueuedTask::new("t2", "b")))
        );
        assert_eq!(state.take_next(), None);
    }

    #[test]
    fn requeue_moves_to_front_without_duplicating() {
        let mut state = GroupRunState::default();
        state.push_pending(PendingInput::Task(QueuedTask::new("t1", "a")));
        state.push_pending(PendingInput::Messages);
        state.requeue_front(PendingInput::Messages);
        assert_eq!(state.pending.len(), 2);
        assert_eq!(state.take_next(), Some(PendingInput::Messages));
        assert!(state.take_next().is_some_and(|p| p.is_task()));
    }
}
