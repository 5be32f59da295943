//! Streaming parser for sentinel-delimited frames.
//!
//! The agent's stdout is mostly free-form log text. Structured results sit
//! between a start line and an end line. The parser is fed chunks as they
//! arrive and moves through three states:
//!
//! - `Scanning`: bytes are log noise, discarded until a start marker line.
//! - `Accumulating`: bytes are collected until an end marker line, then the
//!   collected document is parsed and emitted, and the parser scans again.
//! - `Done`: the stream ended; further input is ignored.
//!
//! Framing is line based. A marker only counts when it is the whole line,
//! ignoring surrounding whitespace. Marker text embedded in a longer log line
//! never opens or closes a frame, including log output that lacks a trailing
//! newline and runs straight into the marker (`noise---AGENT_OUTPUT_START---`).
//! Agents must print each marker on its own line.

use serde_json::Value;

use super::protocol::Sentinels;

/// How much longer than the marker a scanned line may be and still match.
const SCAN_SLACK: usize = 256;

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Scanning,
    Accumulating,
    Done,
}

/// A frame that could not be turned into a document.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame exceeded {limit} bytes")]
    TooLarge { limit: usize },

    #[error("stream ended inside a frame ({bytes} bytes buffered)")]
    Unterminated { bytes: usize },
}

/// Incremental frame parser. See the module docs.
#[derive(Debug)]
pub struct FrameParser {
    sentinels: Sentinels,
    state: ParserState,
    max_frame_bytes: usize,
    /// Current line while scanning, or the marker-check tail of an oversized frame.
    line: Vec<u8>,
    line_overflowed: bool,
    /// Frame body collected so far.
    frame: Vec<u8>,
    /// Offset in `frame` where the current line starts.
    line_start: usize,
    oversized: bool,
    frames_emitted: u32,
}

impl FrameParser {
    pub fn new(sentinels: Sentinels, max_frame_bytes: usize) -> Self {
        Self {
            sentinels,
            state: ParserState::Scanning,
            max_frame_bytes,
            line: Vec::new(),
            line_overflowed: false,
            frame: Vec::new(),
            line_start: 0,
            oversized: false,
            frames_emitted: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Number of frames successfully parsed so far.
    pub fn frames_emitted(&self) -> u32 {
        self.frames_emitted
    }

    /// Feed a chunk of output. Returns every frame completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value, FrameError>> {
        let mut completed = Vec::new();
        if self.state == ParserState::Done {
            return completed;
        }

        for piece in chunk.split_inclusive(|b| *b == b'\n') {
            let (content, terminated) = match piece.split_last() {
                Some((b'\n', rest)) => (rest, true),
                _ => (piece, false),
            };
            self.append(content);
            if terminated && let Some(result) = self.end_line() {
                completed.push(result);
            }
        }
        completed
    }

    /// Signal end of stream. Flushes a final unterminated line.
    pub fn finish(&mut self) -> Vec<Result<Value, FrameError>> {
        let mut completed = Vec::new();
        if self.state == ParserState::Done {
            return completed;
        }
        if let Some(result) = self.end_line() {
            completed.push(result);
        }
        if self.state == ParserState::Accumulating {
            completed.push(Err(FrameError::Unterminated {
                bytes: self.frame.len(),
            }));
            self.frame.clear();
        }
        self.state = ParserState::Done;
        completed
    }

    fn append(&mut self, bytes: &[u8]) {
        match self.state {
            ParserState::Scanning => self.append_scan_line(bytes, self.sentinels.start.len()),
            ParserState::Accumulating if self.oversized => {
                self.append_scan_line(bytes, self.sentinels.end.len())
            }
            ParserState::Accumulating => {
                self.frame.extend_from_slice(bytes);
                if self.frame.len() > self.max_frame_bytes {
                    // Keep only the current line's tail for end-marker detection.
                    let tail = self.frame.split_off(self.line_start);
                    self.frame.clear();
                    self.oversized = true;
                    self.line.clear();
                    self.line_overflowed = false;
                    self.append_scan_line(&tail, self.sentinels.end.len());
                }
            }
            ParserState::Done => {}
        }
    }

    fn append_scan_line(&mut self, bytes: &[u8], marker_len: usize) {
        if self.line_overflowed {
            return;
        }
        if self.line.len() + bytes.len() > marker_len + SCAN_SLACK {
            self.line.clear();
            self.line_overflowed = true;
        } else {
            self.line.extend_from_slice(bytes);
        }
    }

    /// Handle a completed line. Returns a frame if this line closed one.
    fn end_line(&mut self) -> Option<Result<Value, FrameError>> {
        match self.state {
            ParserState::Scanning => {
                if !self.line_overflowed
                    && self.line.trim_ascii() == self.sentinels.start.as_bytes()
                {
                    self.state = ParserState::Accumulating;
                    self.frame.clear();
                    self.line_start = 0;
                    self.oversized = false;
                }
                self.reset_line();
                None
            }
            ParserState::Accumulating if self.oversized => {
                let closed =
                    !self.line_overflowed && self.line.trim_ascii() == self.sentinels.end.as_bytes();
                self.reset_line();
                if closed {
                    self.state = ParserState::Scanning;
                    self.oversized = false;
                    Some(Err(FrameError::TooLarge {
                        limit: self.max_frame_bytes,
                    }))
                } else {
                    None
                }
            }
            ParserState::Accumulating => {
                if self.frame[self.line_start..].trim_ascii() == self.sentinels.end.as_bytes() {
                    self.frame.truncate(self.line_start);
                    let body = std::mem::take(&mut self.frame);
                    self.line_start = 0;
                    self.state = ParserState::Scanning;
                    Some(self.parse(&body))
                } else {
                    self.frame.push(b'\n');
                    self.line_start = self.frame.len();
                    None
                }
            }
            ParserState::Done => None,
        }
    }

    fn parse(&mut self, body: &[u8]) -> Result<Value, FrameError> {
        let value: Value = serde_json::from_slice(body.trim_ascii())?;
        self.frames_emitted += 1;
        Ok(value)
    }

    fn reset_line(&mut self) {
        self.line.clear();
        self.line_overflowed = false;
    }
}
