//! Per-group IPC directory shared with the sandbox.
//!
//! Layout under `<data>/ipc/<folder>/`:
//! - `messages/`, `tasks/`: requests the agent sends to the host (handled elsewhere)
//! - `input/`: follow-up messages the host pipes into a running agent
//! - `current_tasks.json`, `available_groups.json`: snapshots written at spawn

use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Name of the file that tells a running agent no more input will arrive.
pub const CLOSE_SENTINEL: &str = "_close";

/// A follow-up message written into the input directory.
#[derive(Debug, Serialize)]
struct InputMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// What is read back from an input file the agent never consumed.
#[derive(Debug, Deserialize)]
struct StoredMessage {
    text: String,
}

/// Paths of one group's IPC directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcDir {
    root: PathBuf,
}

impl IpcDir {
    pub fn new(data_dir: &Path, folder: &str) -> Self {
        Self {
            root: data_dir.join("ipc").join(folder),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    /// Create the directory tree.
    pub async fn ensure(&self) -> std::io::Result<()> {
        for sub in ["messages", "tasks", "input"] {
            fs::create_dir_all(self.root.join(sub)).await?;
        }
        Ok(())
    }

    /// Clean up input left by a previous run and return the text of any
    /// follow-up messages it never consumed, oldest first.
    ///
    /// The stale close sentinel and partial writes are removed. Message files
    /// are removed once read, so each text is handed out exactly once.
    pub async fn take_leftover_input(&self) -> std::io::Result<Vec<String>> {
        let dir = self.input_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut messages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                messages.push(path);
            } else {
                fs::remove_file(&path).await?;
            }
        }
        // Names start with the write timestamp in millis.
        messages.sort();

        let mut texts = Vec::with_capacity(messages.len());
        for path in messages {
            let raw = fs::read(&path).await?;
            match serde_json::from_slice::<StoredMessage>(&raw) {
                Ok(message) => texts.push(message.text),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Dropping unreadable input message"
                ),
            }
            fs::remove_file(&path).await?;
        }
        Ok(texts)
    }
}

/// Write a follow-up message for a running agent. Returns the file written.
///
/// The file is written under a temporary name and renamed into place so the
/// agent never observes a partial message.
pub async fn write_input_message(input_dir: &Path, text: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(input_dir).await?;
    let body = serde_json::to_vec(&InputMessage {
        kind: "message",
        text,
    })?;
    let name = format!("{}-{}.json", Utc::now().timestamp_millis(), random_suffix());
    let path = input_dir.join(&name);
    let tmp = input_dir.join(format!("{name}.tmp"));
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, &path).await?;
    Ok(path)
}

/// Signal end of input to a running agent.
pub async fn write_close_sentinel(input_dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(input_dir).await?;
    fs::write(input_dir.join(CLOSE_SENTINEL), b"").await
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
