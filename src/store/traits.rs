//! Read-only `SnapshotSource` trait over the host's persisted state.
//!
//! The queue never touches persistence; only the runner reads these models
//! when it writes a run's snapshot artifacts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::group::GroupConfig;

/// Status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

/// A scheduled task as persisted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    /// Folder of the group that owns the task.
    pub group_folder: String,
    pub prompt: String,
    /// `cron`, `interval` or `once`.
    pub schedule_type: String,
    pub schedule_value: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

/// Backend-agnostic read access to tasks and registered groups.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// All scheduled tasks, in any status.
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError>;

    /// All registered groups.
    async fn list_groups(&self) -> Result<Vec<GroupConfig>, StoreError>;

    /// Look up a group by its chat identifier.
    async fn get_group(&self, id: &str) -> Result<Option<GroupConfig>, StoreError> {
        Ok(self.list_groups().await?.into_iter().find(|g| g.id == id))
    }
}

/// In-memory source, for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<Vec<ScheduledTask>>,
    groups: RwLock<Vec<GroupConfig>>,
}

impl MemoryStore {
    pub fn new(groups: Vec<GroupConfig>, tasks: Vec<ScheduledTask>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
            groups: RwLock::new(groups),
        }
    }

    /// Register (or replace) a group.
    pub async fn upsert_group(&self, group: GroupConfig) {
        let mut groups = self.groups.write().await;
        groups.retain(|g| g.id != group.id);
        groups.push(group);
    }

    /// Add a task.
    pub async fn add_task(&self, task: ScheduledTask) {
        self.tasks.write().await.push(task);
    }
}

#[async_trait]
impl SnapshotSource for MemoryStore {
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        Ok(self.tasks.read().await.clone())
    }

    async fn list_groups(&self) -> Result<Vec<GroupConfig>, StoreError> {
        Ok(self.groups.read().await.clone())
    }
}
