//! Per-invocation run logs under `<group>/logs/`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use uuid::Uuid;

use super::mounts::VolumeMount;

/// Keeps the last `cap` bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&bytes[bytes.len() - self.cap..]);
            self.truncated = true;
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.truncated = true;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Buffered bytes as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// What one invocation did, as written to its log file.
#[derive(Debug)]
pub struct RunRecord<'a> {
    pub group: &'a str,
    pub run_id: Uuid,
    pub sandbox: &'a str,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub frames: u32,
    pub outcome: &'a str,
    pub mounts: &'a [VolumeMount],
    pub stderr: &'a TailBuffer,
    /// Only included when the run failed.
    pub stdout: Option<&'a TailBuffer>,
}

impl RunRecord<'_> {
    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Sandbox Run Log ===");
        let _ = writeln!(out, "Started: {}", self.started_at.to_rfc3339());
        let _ = writeln!(out, "Group: {}", self.group);
        let _ = writeln!(out, "Run: {}", self.run_id);
        let _ = writeln!(out, "Sandbox: {}", self.sandbox);
        let _ = writeln!(out, "Duration: {}ms", self.duration.as_millis());
        let exit = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".into());
        let _ = writeln!(out, "Exit Code: {exit}");
        let _ = writeln!(out, "Frames: {}", self.frames);
        let _ = writeln!(out, "Outcome: {}", self.outcome);
        let _ = writeln!(out, "\n=== Mounts ===");
        for m in self.mounts {
            let mode = if m.read_only { " (ro)" } else { "" };
            let _ = writeln!(out, "{} -> {}{mode}", m.host_path.display(), m.container_path);
        }
        section(&mut out, "Stderr", self.stderr);
        if let Some(stdout) = self.stdout {
            section(&mut out, "Stdout", stdout);
        }
        out
    }

    /// Write the record to `<logs_dir>/run-<timestamp>.log`.
    pub async fn write(&self, logs_dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(logs_dir).await?;
        let path = logs_dir.join(format!(
            "run-{}.log",
            self.started_at.format("%Y-%m-%dT%H-%M-%S%.3fZ")
        ));
        fs::write(&path, self.render()).await?;
        Ok(path)
    }
}

fn section(out: &mut String, title: &str, tail: &TailBuffer) {
    let marker = if tail.is_truncated() { " (truncated)" } else { "" };
    let _ = writeln!(out, "\n=== {title}{marker} ===");
    out.push_str(&tail.text());
    if !out.ends_with('\n') {
        out.push('\n');
    }
}
