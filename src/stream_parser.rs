//! Line protocol spoken by the CLI on stdout and stderr.
//!
//! Stdout is newline-delimited. Each complete line is one of:
//! - noise: debug/log chatter recognised by substring markers, dropped
//! - a structured response: a single-line JSON object tagged
//!   `{"type":"cli-response"}` (or the legacy `gemini-response`), forwarded verbatim
//! - anything else: counted as untagged or unparseable and dropped
//!
//! A structured response may carry `data.usage.total_token_count` (a running
//! total for the invocation) and `data.message.content`, either a string or a
//! list of `{type:"text", text}` parts.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Type tags accepted as structured responses
pub const RESPONSE_TAGS: &[&str] = &["cli-response", "gemini-response"];

/// Substrings marking CLI debug output on stdout
const STDOUT_NOISE: &[&str] = &[
    "[DEBUG]",
    "Flushing log events",
    "Clearcut response",
    "[MemoryDiscovery]",
    "[BfsFileSearch]",
];

/// Substrings marking benign stderr chatter (node deprecation and terminal warnings)
const STDERR_NOISE: &[&str] = &[
    "[DEP0040]",
    "DeprecationWarning",
    "--trace-deprecation",
    "does not support true color",
    "terminal does not support",
];

/// Longest stdout line kept in memory; longer lines are dropped whole
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Splits a byte stream into lines, holding back a trailing partial line
/// until the next chunk arrives.
#[derive(Debug)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    max_line: usize,
    /// Skipping the rest of an oversized line
    discarding: bool,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    /// Feed a chunk and return every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                lines.push(decode_line(&self.buffer[start..end]));
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            warn!(
                "Dropping stdout line longer than {} bytes",
                self.max_line
            );
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        lines
    }

    /// Flush the held-back partial line at end of stream
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Schema of a structured response, validated at the boundary
#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<ResponseData>,
}

#[derive(Debug, Deserialize)]
struct ResponseData {
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// A structured response extracted from one stdout line
#[derive(Debug, Clone)]
pub struct CliResponse {
    /// The line as parsed, forwarded to the client untouched
    pub raw: Value,
    /// Running token total reported by the CLI
    pub total_tokens: Option<u64>,
    /// Concatenated text content, if any
    pub text: Option<String>,
    /// Tagged correctly but the payload did not match the schema
    pub schema_mismatch: bool,
}

/// Classification of one stdout line
#[derive(Debug, Clone)]
pub enum StdoutLine {
    Blank,
    Noise,
    Response(CliResponse),
    /// Valid JSON without a recognised tag
    Untagged,
    Unparseable,
}

pub fn is_stdout_noise(line: &str) -> bool {
    STDOUT_NOISE.iter().any(|marker| line.contains(marker))
}

pub fn is_stderr_noise(line: &str) -> bool {
    STDERR_NOISE.iter().any(|marker| line.contains(marker))
}

/// Classify a single complete stdout line
pub fn classify_line(line: &str) -> StdoutLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return StdoutLine::Blank;
    }
    if is_stdout_noise(trimmed) {
        return StdoutLine::Noise;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return StdoutLine::Unparseable,
    };
    let tagged = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|tag| RESPONSE_TAGS.contains(&tag));
    if !value.is_object() || !tagged {
        return StdoutLine::Untagged;
    }

    match serde_json::from_value::<ResponseEnvelope>(value.clone()) {
        Ok(envelope) => {
            debug!("Structured response of type {}", envelope.kind);
            let data = envelope.data;
            let total_tokens = data
                .as_ref()
                .and_then(|d| d.usage.as_ref())
                .and_then(|u| u.total_token_count);
            let text = data
                .and_then(|d| d.message)
                .and_then(|m| m.content)
                .and_then(content_text);
            StdoutLine::Response(CliResponse {
                raw: value,
                total_tokens,
                text,
                schema_mismatch: false,
            })
        }
        Err(e) => {
            warn!("Structured response does not match schema: {}", e);
            StdoutLine::Response(CliResponse {
                raw: value,
                total_tokens: None,
                text: None,
                schema_mismatch: true,
            })
        }
    }
}

fn content_text(content: MessageContent) -> Option<String> {
    let text = match content {
        MessageContent::Text(text) => text,
        MessageContent::Parts(parts) => parts
            .into_iter()
            .filter(|part| part.kind.as_deref().map_or(true, |kind| kind == "text"))
            .filter_map(|part| part.text)
            .collect::<String>(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Per-invocation protocol counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    pub lines: u64,
    pub responses: u64,
    pub noise: u64,
    pub untagged: u64,
    pub unparseable: u64,
    pub schema_mismatch: u64,
}

impl ProtocolStats {
    pub fn record(&mut self, line: &StdoutLine) {
        self.lines += 1;
        match line {
            StdoutLine::Blank => {}
            StdoutLine::Noise => self.noise += 1,
            StdoutLine::Response(response) => {
                self.responses += 1;
                if response.schema_mismatch {
                    self.schema_mismatch += 1;
                }
            }
            StdoutLine::Untagged => self.untagged += 1,
            StdoutLine::Unparseable => self.unparseable += 1,
        }
    }
}

/// Accumulates assistant text across responses for persistence at exit
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    fragments: Vec<String>,
}

impl ResponseAccumulator {
    pub fn push(&mut self, fragment: String) {
        self.fragments.push(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Full response text; fragments from separate responses are newline-joined
    pub fn text(&self) -> String {
        self.fragments.join("\n").trim().to_string()
    }
}
