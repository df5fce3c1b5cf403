//! Channel transport between the gateway process and the host process.
//!
//! The caller side (`GatewayChannel`) writes commands and polls for
//! responses; the host side (`HostChannel`) is polled from the host
//! thread on every scheduler tick. Two realizations:
//!
//! - `file`: a command file and a response file, both replaced atomically.
//! - `http`: one synchronous request/response round trip per command.

pub mod file;
pub mod http;

pub use file::{FileGatewayChannel, FileHostChannel, FilePaths};
pub use http::{HttpGatewayChannel, HttpHostChannel, HttpHostServer};

use async_trait::async_trait;
use serde::Serialize;

use crate::envelope::{Command, DecodeError, Response};
use crate::error::BridgeError;

/// Maximum envelope size (16 MB). Safety valve against runaway payloads.
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// What the caller can learn about the host without submitting work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub transport: &'static str,
    pub available: bool,
    /// `Some(true)` while a command occupies the channel slot, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy: Option<bool>,
    pub detail: String,
}

/// Caller side of the channel slot.
///
/// Implementations do not serialize callers themselves; the gateway holds
/// the slot lock around `write_command` and the polls that follow.
#[async_trait]
pub trait GatewayChannel: Send + Sync {
    /// Place a command in the slot.
    ///
    /// Returns `false` without writing while an earlier command still
    /// occupies the slot; the caller may retry once the host has moved on.
    async fn write_command(&self, command: &Command) -> Result<bool, BridgeError>;

    /// Take the response currently in the slot, if any.
    ///
    /// The response is consumed: a second call will not return it again.
    async fn try_read_response(&self) -> Result<Option<Response>, BridgeError>;

    /// Take back a command the host has not picked up yet.
    ///
    /// Returns `true` if the command was removed before the host saw it.
    async fn withdraw_command(&self) -> Result<bool, BridgeError> {
        Ok(false)
    }

    /// Liveness check.
    async fn probe(&self) -> HostStatus;
}

/// An item picked up by the host side.
#[derive(Debug)]
pub enum Incoming {
    Command(Command),
    /// Readable but invalid envelope. Answered when it carries an id.
    Malformed(DecodeError),
}

/// Host side of the channel slot. Used only from the host thread.
pub trait HostChannel {
    fn try_read_command(&mut self) -> Result<Option<Incoming>, BridgeError>;

    fn write_response(&mut self, response: &Response) -> Result<(), BridgeError>;
}

impl<T: HostChannel + ?Sized> HostChannel for Box<T> {
    fn try_read_command(&mut self) -> Result<Option<Incoming>, BridgeError> {
        (**self).try_read_command()
    }

    fn write_response(&mut self, response: &Response) -> Result<(), BridgeError> {
        (**self).write_response(response)
    }
}
