//! JSON-file backed read model.
//!
//! Reads `tasks.json` and `registered_groups.json` from the data directory on
//! every call, so edits made by other host components are picked up without a
//! reload. A missing file reads as an empty list.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::fs;

use super::traits::{ScheduledTask, SnapshotSource};
use crate::error::StoreError;
use crate::group::GroupConfig;

const TASKS_FILE: &str = "tasks.json";
const GROUPS_FILE: &str = "registered_groups.json";

/// Snapshot source reading JSON files from a directory.
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_list<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        read_json_list(&self.dir.join(name)).await
    }
}

async fn read_json_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl SnapshotSource for JsonStore {
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        self.read_list(TASKS_FILE).await
    }

    async fn list_groups(&self) -> Result<Vec<GroupConfig>, StoreError> {
        let groups: Vec<GroupConfig> = self.read_list(GROUPS_FILE).await?;
        Ok(groups
            .into_iter()
            .filter(|g| match g.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(group = %g.id, error = %e, "Skipping group with invalid folder");
                    false
                }
            })
            .collect())
    }
}
