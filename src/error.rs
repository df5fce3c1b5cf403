//! Error taxonomy shared by the gateway, the channel and the host.
//!
//! `BridgeError` is what Rust code propagates; `ErrorKind` is the
//! stable name that travels inside a `Response` envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Payload failed shape validation; never reached the host.
    MalformedCommand,
    /// No matching response arrived within the caller's bound.
    Timeout,
    /// The host faulted while running an operation or a script.
    HostExecutionFailure,
    /// The channel itself could not be written or read.
    ChannelUnavailable,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedCommand => "MalformedCommand",
            Self::Timeout => "Timeout",
            Self::HostExecutionFailure => "HostExecutionFailure",
            Self::ChannelUnavailable => "ChannelUnavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised inside the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("no response within {timeout_ms}ms for command {command_id}")]
    Timeout { command_id: String, timeout_ms: u64 },

    #[error("host execution failed: {0}")]
    HostExecutionFailure(String),

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),
}

impl BridgeError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedCommand(_) => ErrorKind::MalformedCommand,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::HostExecutionFailure(_) => ErrorKind::HostExecutionFailure,
            Self::ChannelUnavailable(_) => ErrorKind::ChannelUnavailable,
        }
    }

    /// The bare message, without the kind prefix that `Display` adds.
    pub fn message(&self) -> String {
        match self {
            Self::MalformedCommand(msg)
            | Self::HostExecutionFailure(msg)
            | Self::ChannelUnavailable(msg) => msg.clone(),
            Self::Timeout { .. } => self.to_string(),
        }
    }

    pub(crate) fn channel(context: &str, err: impl std::fmt::Display) -> Self {
        Self::ChannelUnavailable(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_variant_name() {
        let json = serde_json::to_string(&ErrorKind::HostExecutionFailure).unwrap();
        assert_eq!(json, "\"HostExecutionFailure\"");
        let back: ErrorKind = serde_json::from_str("\"Timeout\"").unwrap();
        assert_eq!(back, ErrorKind::Timeout);
    }

    #[test]
    fn message_drops_kind_prefix() {
        let err = BridgeError::HostExecutionFailure("boom".into());
        assert_eq!(err.kind(), ErrorKind::HostExecutionFailure);
        assert_eq!(err.message(), "boom");
        assert_eq!(err.to_string(), "host execution failed: boom");
    }

    #[test]
    fn channel_helper_keeps_context() {
        let err = BridgeError::channel("failed writing command", "disk full");
        assert_eq!(err.kind(), ErrorKind::ChannelUnavailable);
        assert_eq!(err.message(), "failed writing command: disk full");
    }
}
