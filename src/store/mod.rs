//! Persistence read models: the task list and group registry the runner snapshots.

pub mod json;
pub mod traits;

pub use json::JsonStore;
pub use traits::{MemoryStore, ScheduledTask, SnapshotSource, TaskStatus};
