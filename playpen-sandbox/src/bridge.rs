//! Console bridge: the message contract across the isolation boundary.
//!
//! Wire shape (JSON):
//!
//! ```text
//! { "type": "console", "method": "log" | "info" | "warn" | "error", "args": [string, …] }
//! ```
//!
//! `type` is checked before any other field is read. Anything that does
//! not match the schema exactly is rejected, and rejected messages are
//! only ever logged at debug level.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ContextId, Envelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Log,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Log => "log",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "log" => Some(Severity::Log),
            "info" => Some(Severity::Info),
            "warn" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a console message")]
    NotConsole,

    #[error("unknown console method: {0}")]
    UnknownMethod(String),

    #[error("args must be an array of strings")]
    MalformedArgs,
}

/// A validated boundary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMessage {
    pub method: Severity,
    pub args: Vec<String>,
}

impl BridgeMessage {
    pub fn new(method: Severity, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            method,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The single error-severity message an uncaught runtime error becomes.
    pub fn runtime_error(message: &str, line: Option<u32>, column: Option<u32>) -> Self {
        let text = match (line, column) {
            (Some(line), Some(column)) => {
                format!("Error: {message} (line {line}, column {column})")
            }
            (Some(line), None) => format!("Error: {message} (line {line})"),
            _ => format!("Error: {message}"),
        };
        Self::new(Severity::Error, [text])
    }

    /// Validate a raw payload received from a context.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(raw)?;

        if value.get("type").and_then(Value::as_str) != Some("console") {
            return Err(BridgeError::NotConsole);
        }

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::UnknownMethod(String::from("<missing>")))?;
        let method = Severity::from_method(method)
            .ok_or_else(|| BridgeError::UnknownMethod(method.to_string()))?;

        let args = value
            .get("args")
            .and_then(Value::as_array)
            .ok_or(BridgeError::MalformedArgs)?
            .iter()
            .map(|arg| arg.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()
            .ok_or(BridgeError::MalformedArgs)?;

        Ok(Self { method, args })
    }

    /// Encode for posting across the boundary.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "type": "console",
            "method": self.method.as_str(),
            "args": self.args,
        })
        .to_string()
    }

    pub fn text(&self) -> String {
        self.args.join(" ")
    }
}

/// One line of the visible console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleMessage {
    pub severity: Severity,
    pub text: String,
    /// Position within the current sandbox lifetime, starting at 0.
    pub sequence: u64,
}

impl fmt::Display for ConsoleMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.text)
    }
}

/// Lines kept per sandbox lifetime unless configured otherwise.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Most recent console lines of one sandbox lifetime, in emission order.
///
/// Once full, the oldest line is dropped for each new one. Sequence
/// numbers keep counting, so a gap at the front shows how much was lost.
#[derive(Debug)]
pub struct ConsoleLog {
    messages: VecDeque<ConsoleMessage>,
    capacity: usize,
    next_sequence: u64,
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl ConsoleLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
            next_sequence: 0,
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.next_sequence = 0;
    }

    pub fn push(&mut self, severity: Severity, text: String) -> &ConsoleMessage {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.messages.push_back(ConsoleMessage {
            severity,
            text,
            sequence,
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &VecDeque<ConsoleMessage> {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Lines pushed this lifetime, including dropped ones.
    pub fn total(&self) -> u64 {
        self.next_sequence
    }
}

/// Host-side end of the boundary.
///
/// Only envelopes stamped with the current context id are accepted; a
/// torn-down or unrelated context cannot reach the log.
#[derive(Debug, Default)]
pub struct ConsoleBridge {
    current: Option<ContextId>,
    log: ConsoleLog,
}

impl ConsoleBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` lines of the current lifetime.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            current: None,
            log: ConsoleLog::with_capacity(capacity),
        }
    }

    /// Start a new sandbox lifetime: clear the log and trust only `context`.
    pub fn begin_cycle(&mut self, context: ContextId) {
        self.current = Some(context);
        self.log.clear();
    }

    /// Stop trusting the current context.
    pub fn end_cycle(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<ContextId> {
        self.current
    }

    /// Validate and append. Returns the appended line, or `None` if the
    /// envelope was dropped.
    pub fn accept(&mut self, envelope: &Envelope) -> Option<&ConsoleMessage> {
        if self.current != Some(envelope.context) {
            log::debug!(
                "Dropping message from inactive context {} (current: {:?})",
                envelope.context,
                self.current
            );
            return None;
        }

        match BridgeMessage::parse(&envelope.payload) {
            Ok(message) => Some(self.log.push(message.method, message.text())),
            Err(e) => {
                log::debug!("Dropping bridge message from {}: {e}", envelope.context);
                None
            }
        }
    }

    pub fn log(&self) -> &ConsoleLog {
        &self.log
    }
}
