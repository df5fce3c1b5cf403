//! Command and response envelopes.
//!
//! Both sides exchange flat JSON records:
//!
//! ```json
//! {"id": "…", "kind": "execute_code", "source": "result = 1 + 1", "submitted_at": 1700000000000}
//! {"command_id": "…", "outcome": "success", "value": 2, "produced_at": 1700000000042}
//! ```
//!
//! Fields are matched by presence only; there is no schema version.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{BridgeError, ErrorKind};

/// What a command asks the host to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// A named catalog operation with its parameters.
    Operation {
        name: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
    /// Arbitrary script source evaluated in the sandbox.
    ExecuteCode { source: String },
}

impl CommandKind {
    /// Short label for logs.
    pub fn label(&self) -> &str {
        match self {
            Self::Operation { name, .. } => name,
            Self::ExecuteCode { .. } => "execute_code",
        }
    }
}

/// Lifecycle of a command. Only the host advances it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Whether `self -> next` is a legal, forward-only step.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::TimedOut)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal status transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CommandStatus,
    pub to: CommandStatus,
}

/// One unit of requested host work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub submitted_at: u64,
    /// Host-local; never sent over the channel.
    #[serde(skip)]
    pub status: CommandStatus,
}

impl Command {
    /// Build a pending command with a fresh correlation id.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            submitted_at: now_ms(),
            status: CommandStatus::Pending,
        }
    }

    pub fn execute_code(source: impl Into<String>) -> Self {
        Self::new(CommandKind::ExecuteCode {
            source: source.into(),
        })
    }

    pub fn operation(name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self::new(CommandKind::Operation {
            name: name.into(),
            parameters,
        })
    }

    pub fn advance(&mut self, next: CommandStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Shape checks performed before a command may occupy the channel.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.id.trim().is_empty() {
            return Err(BridgeError::MalformedCommand("command id is empty".into()));
        }
        match &self.kind {
            CommandKind::ExecuteCode { source } if source.trim().is_empty() => Err(
                BridgeError::MalformedCommand("execute_code requires non-empty source".into()),
            ),
            CommandKind::Operation { name, .. } if name.trim().is_empty() => Err(
                BridgeError::MalformedCommand("operation name is empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Whether the host produced a value or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// The result correlated to exactly one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub command_id: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub produced_at: u64,
}

impl Response {
    pub fn success(command_id: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            command_id: command_id.into(),
            outcome: Outcome::Success,
            value,
            error: None,
            produced_at: now_ms(),
        }
    }

    pub fn error(command_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            outcome: Outcome::Error,
            value: None,
            error: Some(ErrorInfo {
                kind,
                message: message.into(),
            }),
            produced_at: now_ms(),
        }
    }

    pub fn from_error(command_id: impl Into<String>, err: &BridgeError) -> Self {
        Self::error(command_id, err.kind(), err.message())
    }

    /// Synthetic response for a caller that gave up waiting.
    pub fn timeout(command_id: impl Into<String>, waited: Duration) -> Self {
        let command_id = command_id.into();
        let err = BridgeError::Timeout {
            command_id: command_id.clone(),
            timeout_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        };
        Self::from_error(command_id, &err)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// A command envelope that could not be accepted.
///
/// `id` is recovered when the record was at least readable, so the
/// host can still answer instead of leaving the caller waiting.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct DecodeError {
    pub id: Option<String>,
    pub reason: String,
}

pub fn encode_command(command: &Command) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(command)
        .map_err(|e| BridgeError::MalformedCommand(format!("failed to encode command: {e}")))
}

pub fn decode_command(bytes: &[u8]) -> Result<Command, DecodeError> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| DecodeError {
        id: None,
        reason: format!("command is not valid JSON: {e}"),
    })?;
    command_from_value(raw)
}

/// Same as `decode_command`, for a record already parsed as JSON.
pub fn command_from_value(raw: Value) -> Result<Command, DecodeError> {
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_owned);

    let command: Command = serde_json::from_value(raw).map_err(|e| DecodeError {
        id: id.clone(),
        reason: format!("command has an invalid shape: {e}"),
    })?;
    command.validate().map_err(|e| DecodeError {
        id,
        reason: e.message(),
    })?;
    Ok(command)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(response)
        .map_err(|e| BridgeError::channel("failed to encode response", e))
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, BridgeError> {
    serde_json::from_slice(bytes).map_err(|e| BridgeError::channel("undecodable response", e))
}

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
