//! Wire contract between the host and the sandboxed agent.
//!
//! The host writes one [`RunInput`] as JSON to the agent's stdin and closes
//! it. The agent writes free-form logs to stdout, with each structured result
//! framed between the two sentinel lines.

use serde::{Deserialize, Serialize};

/// Line that opens a structured output frame.
pub const OUTPUT_START_MARKER: &str = "---AGENT_OUTPUT_START---";

/// Line that closes a structured output frame.
pub const OUTPUT_END_MARKER: &str = "---AGENT_OUTPUT_END---";

/// The pair of marker lines delimiting frames in the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    pub start: String,
    pub end: String,
}

impl Sentinels {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Wrap a document in the markers, one per line.
    pub fn wrap(&self, document: &str) -> String {
        format!("{}\n{}\n{}\n", self.start, document, self.end)
    }
}

impl Default for Sentinels {
    fn default() -> Self {
        Self::new(OUTPUT_START_MARKER, OUTPUT_END_MARKER)
    }
}

/// Input payload for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled_task: bool,
}

/// Typed view of one output frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    /// `success` or `error` for well-behaved agents.
    #[serde(default)]
    pub status: String,
    /// Result payload; usually a string, `null` for a bare session update.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutput {
    pub fn is_error(&self) -> bool {
        self.status == "error"
    }

    /// The result rendered as text, if there is one.
    pub fn result_text(&self) -> Option<String> {
        match self.result.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// One structured frame emitted by a running agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The document exactly as parsed from between the markers.
    pub raw: serde_json::Value,
    pub output: RunOutput,
}

impl Frame {
    /// Decode a parsed document. Only JSON objects matching [`RunOutput`] qualify.
    pub fn from_document(raw: serde_json::Value) -> Result<Self, String> {
        if !raw.is_object() {
            return Err(format!("expected a JSON object, got {}", json_kind(&raw)));
        }
        let output = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
        Ok(Self { raw, output })
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
