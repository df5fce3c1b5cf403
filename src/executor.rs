//! Host executor loop.
//!
//! Runs on the host thread. Each `tick` moves through
//! `Idle -> Dispatching -> Executing -> Publishing -> Idle` for at most one
//! command. Ticks are not re-entrant: a tick that arrives while another is
//! in progress returns `TickOutcome::Busy` without touching the channel.

use std::cell::Cell;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog;
use crate::envelope::{Command, CommandKind, CommandStatus, DecodeError, Outcome, Response};
use crate::error::{BridgeError, ErrorKind};
use crate::host::HostContext;
use crate::sandbox::Sandbox;
use crate::transport::{HostChannel, Incoming};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Dispatching,
    Executing,
    Publishing,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was pending.
    Idle,
    /// Another tick is still running; this one did nothing.
    Busy,
    /// A command ran and its response was handed to the channel.
    Completed {
        command_id: String,
        outcome: Outcome,
    },
    /// An unreadable envelope was answered (or dropped, without an id).
    Rejected { command_id: Option<String> },
    /// The channel itself failed; nothing ran.
    ChannelError(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Puts the executor back to `Idle` however the tick ends.
struct IdleOnDrop<'a>(&'a Cell<ExecutorState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(ExecutorState::Idle);
    }
}

pub struct HostExecutor<C: HostChannel> {
    channel: RefCell<C>,
    sandbox: Sandbox,
    state: Cell<ExecutorState>,
    stats: Cell<ExecutorStats>,
    last_status: RefCell<Option<(String, CommandStatus)>>,
}

impl<C: HostChannel> HostExecutor<C> {
    pub fn new(channel: C, sandbox: Sandbox) -> Self {
        Self {
            channel: RefCell::new(channel),
            sandbox,
            state: Cell::new(ExecutorState::Idle),
            stats: Cell::new(ExecutorStats::default()),
            last_status: RefCell::new(None),
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state.get()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.get()
    }

    /// Id and final status of the most recent command.
    pub fn last_status(&self) -> Option<(String, CommandStatus)> {
        self.last_status.borrow().clone()
    }

    /// Handle at most one pending command.
    pub fn tick(&self, host: &HostContext) -> TickOutcome {
        if self.state.get() != ExecutorState::Idle {
            debug!(state = ?self.state.get(), "Tick re-entered, skipping");
            return TickOutcome::Busy;
        }
        let _idle = IdleOnDrop(&self.state);
        self.state.set(ExecutorState::Dispatching);

        let incoming = self.channel.borrow_mut().try_read_command();
        match incoming {
            Ok(None) => TickOutcome::Idle,
            Ok(Some(Incoming::Command(command))) => self.dispatch(host, command),
            Ok(Some(Incoming::Malformed(err))) => self.reject(err),
            Err(e) => {
                warn!(error = %e, "Failed to read from channel");
                TickOutcome::ChannelError(e.to_string())
            }
        }
    }

    #[instrument(skip_all, fields(command_id = %command.id, kind = %command.kind.label()))]
    fn dispatch(&self, host: &HostContext, mut command: Command) -> TickOutcome {
        // Pending -> Running cannot fail for a freshly decoded command.
        let _ = command.advance(CommandStatus::Running);
        self.state.set(ExecutorState::Executing);
        debug!("Executing command");

        let result = catch_unwind(AssertUnwindSafe(|| self.execute(host, &command)))
            .unwrap_or_else(|panic| {
                Err(BridgeError::HostExecutionFailure(format!(
                    "host panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let response = match result {
            Ok(value) => {
                let _ = command.advance(CommandStatus::Completed);
                Response::success(&command.id, value)
            }
            Err(e) => {
                let _ = command.advance(CommandStatus::Failed);
                info!(error = %e, "Command failed");
                Response::from_error(&command.id, &e)
            }
        };

        self.state.set(ExecutorState::Publishing);
        self.publish(&response);
        self.bump(|s| {
            if response.is_success() {
                s.completed += 1;
            } else {
                s.failed += 1;
            }
        });
        *self.last_status.borrow_mut() = Some((command.id.clone(), command.status));

        TickOutcome::Completed {
            command_id: command.id,
            outcome: response.outcome,
        }
    }

    fn execute(&self, host: &HostContext, command: &Command) -> Result<Option<Value>, BridgeError> {
        match &command.kind {
            CommandKind::ExecuteCode { source } => self.sandbox.run(host, source),
            CommandKind::Operation { name, parameters } => {
                let source = catalog::expand(name, parameters)
                    .map_err(|e| BridgeError::HostExecutionFailure(e.message()))?;
                self.sandbox.run(host, &source)
            }
        }
    }

    fn reject(&self, err: DecodeError) -> TickOutcome {
        self.bump(|s| s.rejected += 1);
        let Some(id) = err.id else {
            warn!(reason = %err.reason, "Dropping unreadable command without an id");
            return TickOutcome::Rejected { command_id: None };
        };
        warn!(command_id = %id, reason = %err.reason, "Rejecting malformed command");
        self.state.set(ExecutorState::Publishing);
        self.publish(&Response::error(&id, ErrorKind::MalformedCommand, err.reason));
        TickOutcome::Rejected {
            command_id: Some(id),
        }
    }

    fn publish(&self, response: &Response) {
        if let Err(e) = self.channel.borrow_mut().write_response(response) {
            error!(command_id = %response.command_id, error = %e, "Failed to publish response");
        }
    }

    fn bump(&self, f: impl FnOnce(&mut ExecutorStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Tick every `interval` until `stop` fires or its sender is dropped.
    pub fn run_until(&self, host: &HostContext, interval: Duration, stop: &Receiver<()>) {
        info!(interval_ms = interval.as_millis(), "Host executor started");
        loop {
            self.tick(host);
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(stats = ?self.stats(), "Host executor stopped");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
