//! Request gateway and correlator.
//!
//! Callers hand `submit` a `CommandKind`; the gateway stamps it with a fresh
//! id, places it in the channel slot and polls for the response carrying that
//! id. One slot lock serializes every caller, so the channel never holds two
//! unconsumed commands. The timeout covers the whole call, including time
//! spent queued behind other callers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::catalog;
use crate::envelope::{Command, CommandKind, CommandStatus, Response};
use crate::error::BridgeError;
use crate::transport::{GatewayChannel, HostStatus};

pub struct Gateway {
    channel: Arc<dyn GatewayChannel>,
    slot: Mutex<()>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Gateway {
    pub fn new(channel: Arc<dyn GatewayChannel>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            channel,
            slot: Mutex::new(()),
            poll_interval,
            timeout,
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Shape checks that keep bad commands off the channel.
    fn validate(command: &Command) -> Result<(), BridgeError> {
        command.validate()?;
        if let CommandKind::Operation { name, parameters } = &command.kind {
            catalog::expand(name, parameters)?;
        }
        Ok(())
    }

    /// Submit one command and wait for its correlated response.
    ///
    /// `Err` means the command never occupied the channel (`MalformedCommand`)
    /// or the channel itself failed (`ChannelUnavailable`). Host-side failures
    /// and timeouts come back as `Ok` error responses.
    #[instrument(skip_all, fields(kind = %kind.label()))]
    pub async fn submit(&self, kind: CommandKind) -> Result<Response, BridgeError> {
        let mut command = Command::new(kind);
        Self::validate(&command)?;

        let started = Instant::now();
        let deadline = started + self.timeout;

        let Ok(_slot) = timeout_at(deadline, self.slot.lock()).await else {
            warn!(command_id = %command.id, "Timed out waiting for the channel slot");
            return Ok(self.timed_out(&mut command));
        };

        // A caller that timed out earlier can leave its command in the host's
        // slot; wait for the host to finish it rather than fail.
        loop {
            match timeout_at(deadline, self.channel.write_command(&command)).await {
                Ok(Ok(true)) => break,
                Ok(Ok(false)) => {
                    debug!(command_id = %command.id, "Channel slot still occupied; retrying");
                    if !self.pause_until(deadline).await {
                        warn!(command_id = %command.id, "Channel slot stayed occupied until the timeout");
                        return Ok(self.timed_out(&mut command));
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(command_id = %command.id, "Timed out writing command");
                    self.withdraw(&command).await;
                    return Ok(self.timed_out(&mut command));
                }
            }
        }
        debug!(command_id = %command.id, "Command submitted");

        loop {
            match timeout_at(deadline, self.channel.try_read_response()).await {
                Ok(Ok(Some(response))) if response.command_id == command.id => {
                    info!(
                        command_id = %command.id,
                        outcome = ?response.outcome,
                        elapsed_ms = started.elapsed().as_millis(),
                        "Response received"
                    );
                    return Ok(response);
                }
                Ok(Ok(Some(stale))) => {
                    debug!(stale_id = %stale.command_id, "Dropping response for an earlier command");
                    continue;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(command_id = %command.id, error = %e, "Failed reading response");
                    return Err(e);
                }
                Err(_) => break,
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }

        self.withdraw(&command).await;
        warn!(
            command_id = %command.id,
            timeout_ms = self.timeout.as_millis(),
            "No response before timeout"
        );
        Ok(self.timed_out(&mut command))
    }

    /// Sleep one poll interval, clipped to `deadline`. `false` once it has passed.
    async fn pause_until(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(self.poll_interval.min(deadline - now)).await;
        Instant::now() < deadline
    }

    /// Take back an abandoned command so the host does not run it later.
    async fn withdraw(&self, command: &Command) {
        match self.channel.withdraw_command().await {
            Ok(true) => info!(command_id = %command.id, "Host never picked up command; withdrawn"),
            Ok(false) => {}
            Err(e) => warn!(command_id = %command.id, error = %e, "Failed to withdraw command"),
        }
    }

    fn timed_out(&self, command: &mut Command) -> Response {
        let _ = command.advance(CommandStatus::TimedOut);
        Response::timeout(&command.id, self.timeout)
    }

    pub async fn execute_code(&self, source: impl Into<String>) -> Result<Response, BridgeError> {
        self.submit(CommandKind::ExecuteCode {
            source: source.into(),
        })
        .await
    }

    pub async fn run_operation(
        &self,
        name: impl Into<String>,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Response, BridgeError> {
        self.submit(CommandKind::Operation {
            name: name.into(),
            parameters,
        })
        .await
    }

    pub async fn status(&self) -> HostStatus {
        self.channel.probe().await
    }
}
