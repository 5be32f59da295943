//! Point-in-time snapshots written into the group's IPC directory at spawn.
//!
//! The agent reads these instead of querying the host. They are written once
//! per run and never refreshed while it is running.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::group::GroupConfig;
use crate::store::ScheduledTask;

pub const TASKS_SNAPSHOT: &str = "current_tasks.json";
pub const GROUPS_SNAPSHOT: &str = "available_groups.json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskEntry<'a> {
    id: &'a str,
    group_folder: &'a str,
    prompt: &'a str,
    schedule_type: &'a str,
    schedule_value: &'a str,
    status: crate::store::TaskStatus,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupEntry<'a> {
    jid: &'a str,
    name: &'a str,
    folder: &'a str,
    is_main: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupsSnapshot<'a> {
    groups: Vec<GroupEntry<'a>>,
    last_sync: DateTime<Utc>,
}

/// Write `current_tasks.json`. Privileged groups see every task, others only their own.
pub async fn write_tasks_snapshot(
    ipc_root: &Path,
    group: &GroupConfig,
    tasks: &[ScheduledTask],
) -> std::io::Result<PathBuf> {
    let visible: Vec<TaskEntry<'_>> = tasks
        .iter()
        .filter(|t| group.is_main || t.group_folder == group.folder)
        .map(|t| TaskEntry {
            id: &t.id,
            group_folder: &t.group_folder,
            prompt: &t.prompt,
            schedule_type: &t.schedule_type,
            schedule_value: &t.schedule_value,
            status: t.status,
            next_run: t.next_run,
        })
        .collect();
    write_json(&ipc_root.join(TASKS_SNAPSHOT), &visible).await
}

/// Write `available_groups.json`. Only privileged groups see the registry.
pub async fn write_groups_snapshot(
    ipc_root: &Path,
    group: &GroupConfig,
    groups: &[GroupConfig],
) -> std::io::Result<PathBuf> {
    let visible = if group.is_main {
        groups
            .iter()
            .map(|g| GroupEntry {
                jid: &g.id,
                name: &g.name,
                folder: &g.folder,
                is_main: g.is_main,
            })
            .collect()
    } else {
        Vec::new()
    };
    let snapshot = GroupsSnapshot {
        groups: visible,
        last_sync: Utc::now(),
    };
    write_json(&ipc_root.join(GROUPS_SNAPSHOT), &snapshot).await
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, body).await?;
    Ok(path.to_path_buf())
}
