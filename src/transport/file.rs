//! File-pair transport.
//!
//! Writers stage the envelope in `<path>.tmp` and rename it into place,
//! so a reader either sees nothing or a complete envelope. Readers claim
//! an envelope by renaming it to `<path>.claimed` before reading, which
//! keeps a concurrent replace from being deleted unread. A missing or
//! empty file means "nothing pending", never an error.

use std::ffi::OsString;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{GatewayChannel, HostChannel, HostStatus, Incoming, MAX_ENVELOPE_SIZE};
use crate::envelope::{self, Command, Response};
use crate::error::BridgeError;

/// Locations of the two slot files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePaths {
    pub command: PathBuf,
    pub response: PathBuf,
}

impl FilePaths {
    pub fn new(command: impl Into<PathBuf>, response: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            response: response.into(),
        }
    }

    /// Both files inside `dir` with their default names.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(
            dir.join("cad_bridge_command.json"),
            dir.join("cad_bridge_response.json"),
        )
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn staging_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn claim_path(path: &Path) -> PathBuf {
    with_suffix(path, ".claimed")
}

fn check_size(path: &Path, len: usize) -> Result<(), BridgeError> {
    if len > MAX_ENVELOPE_SIZE {
        return Err(BridgeError::ChannelUnavailable(format!(
            "{} exceeds max envelope size: {len} > {MAX_ENVELOPE_SIZE}",
            path.display()
        )));
    }
    Ok(())
}

/// Caller side of the file slot.
#[derive(Debug, Clone)]
pub struct FileGatewayChannel {
    paths: FilePaths,
}

impl FileGatewayChannel {
    pub const fn new(paths: FilePaths) -> Self {
        Self { paths }
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BridgeError> {
        let staging = staging_path(path);
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| BridgeError::channel(&format!("failed writing {}", staging.display()), e))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|e| BridgeError::channel(&format!("failed publishing {}", path.display()), e))
    }

    async fn remove_if_present(path: &Path) -> Result<(), BridgeError> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != IoErrorKind::NotFound => Err(BridgeError::channel(
                &format!("failed removing {}", path.display()),
                e,
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl GatewayChannel for FileGatewayChannel {
    async fn write_command(&self, command: &Command) -> Result<bool, BridgeError> {
        let occupied = tokio::fs::try_exists(&self.paths.command)
            .await
            .map_err(|e| BridgeError::channel("failed checking command slot", e))?;
        if occupied {
            debug!(command_id = %command.id, "Previous command not yet picked up by the host");
            return Ok(false);
        }

        // Anything still sitting in the response slot belongs to an earlier command.
        Self::remove_if_present(&self.paths.response).await?;

        let bytes = envelope::encode_command(command)?;
        check_size(&self.paths.command, bytes.len())?;
        Self::write_atomic(&self.paths.command, &bytes).await?;
        debug!(command_id = %command.id, path = %self.paths.command.display(), "Command written");
        Ok(true)
    }

    async fn try_read_response(&self) -> Result<Option<Response>, BridgeError> {
        let claimed = claim_path(&self.paths.response);
        match tokio::fs::rename(&self.paths.response, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BridgeError::channel("failed claiming response", e)),
        }

        let bytes = tokio::fs::read(&claimed)
            .await
            .map_err(|e| BridgeError::channel("failed reading response", e))?;
        Self::remove_if_present(&claimed).await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        check_size(&claimed, bytes.len())?;
        envelope::decode_response(&bytes).map(Some)
    }

    async fn withdraw_command(&self) -> Result<bool, BridgeError> {
        // The host claims by rename, so a successful remove means it never saw the command.
        match tokio::fs::remove_file(&self.paths.command).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(BridgeError::channel("failed withdrawing command", e)),
        }
    }

    async fn probe(&self) -> HostStatus {
        let dir = self
            .paths
            .command
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let available = tokio::fs::metadata(dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let busy = tokio::fs::try_exists(&self.paths.command)
            .await
            .unwrap_or(false);
        let detail = if available {
            format!("command file {}", self.paths.command.display())
        } else {
            format!("directory {} does not exist", dir.display())
        };
        HostStatus {
            transport: "file",
            available,
            busy: Some(busy),
            detail,
        }
    }
}

/// Host side of the file slot.
#[derive(Debug, Clone)]
pub struct FileHostChannel {
    paths: FilePaths,
}

impl FileHostChannel {
    pub const fn new(paths: FilePaths) -> Self {
        Self { paths }
    }
}

impl HostChannel for FileHostChannel {
    fn try_read_command(&mut self) -> Result<Option<Incoming>, BridgeError> {
        let claimed = claim_path(&self.paths.command);
        match std::fs::rename(&self.paths.command, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BridgeError::channel("failed claiming command", e)),
        }

        let bytes = std::fs::read(&claimed).map_err(|e| BridgeError::channel("failed reading command", e));
        if let Err(e) = std::fs::remove_file(&claimed) {
            warn!(path = %claimed.display(), error = %e, "Failed to remove claimed command");
        }
        let bytes = bytes?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        check_size(&claimed, bytes.len())?;

        Ok(Some(match envelope::decode_command(&bytes) {
            Ok(command) => Incoming::Command(command),
            Err(e) => Incoming::Malformed(e),
        }))
    }

    fn write_response(&mut self, response: &Response) -> Result<(), BridgeError> {
        let bytes = envelope::encode_response(response)?;
        let staging = staging_path(&self.paths.response);
        std::fs::write(&staging, &bytes)
            .map_err(|e| BridgeError::channel(&format!("failed writing {}", staging.display()), e))?;
        std::fs::rename(&staging, &self.paths.response).map_err(|e| {
            BridgeError::channel(&format!("failed publishing {}", self.paths.response.display()), e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn channels(dir: &Path) -> (FileGatewayChannel, FileHostChannel) {
        let paths = FilePaths::in_dir(dir);
        (
            FileGatewayChannel::new(paths.clone()),
            FileHostChannel::new(paths),
        )
    }

    #[tokio::test]
    async fn absent_files_mean_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, mut host) = channels(dir.path());
        assert!(gateway.try_read_response().await.unwrap().is_none());
        assert!(host.try_read_command().unwrap().is_none());
    }

    #[tokio::test]
    async fn command_and_response_hand_off_once() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, mut host) = channels(dir.path());

        let command = Command::execute_code("result = 1 + 1");
        gateway.write_command(&command).await.unwrap();
        assert!(!staging_path(&FilePaths::in_dir(dir.path()).command).exists());

        let Some(Incoming::Command(received)) = host.try_read_command().unwrap() else {
            panic!("expected a command");
        };
        assert_eq!(received, command);
        assert!(host.try_read_command().unwrap().is_none());

        host.write_response(&Response::success(&command.id, Some(json!(2))))
            .unwrap();
        let response = gateway.try_read_response().await.unwrap().unwrap();
        assert_eq!(response.command_id, command.id);
        assert!(gateway.try_read_response().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unconsumed_command_blocks_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, _host) = channels(dir.path());

        assert!(gateway.write_command(&Command::execute_code("1")).await.unwrap());
        let second = Command::execute_code("2");
        assert!(!gateway.write_command(&second).await.unwrap());
        assert!(gateway.probe().await.busy.unwrap());

        let written = std::fs::read(&FilePaths::in_dir(dir.path()).command).unwrap();
        assert!(!String::from_utf8_lossy(&written).contains(&second.id));
    }

    #[tokio::test]
    async fn stale_response_is_cleared_before_a_new_command() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, mut host) = channels(dir.path());

        host.write_response(&Response::success("old", None)).unwrap();
        gateway.write_command(&Command::execute_code("1")).await.unwrap();
        assert!(gateway.try_read_response().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn withdraw_only_removes_unclaimed_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, mut host) = channels(dir.path());

        gateway.write_command(&Command::execute_code("1")).await.unwrap();
        assert!(gateway.withdraw_command().await.unwrap());
        assert!(host.try_read_command().unwrap().is_none());

        gateway.write_command(&Command::execute_code("2")).await.unwrap();
        assert!(host.try_read_command().unwrap().is_some());
        assert!(!gateway.withdraw_command().await.unwrap());
    }

    #[test]
    fn empty_and_malformed_command_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::in_dir(dir.path());
        let mut host = FileHostChannel::new(paths.clone());

        std::fs::write(&paths.command, "").unwrap();
        assert!(host.try_read_command().unwrap().is_none());

        std::fs::write(
            &paths.command,
            r#"{"id":"bad","kind":"execute_code","source":"","submitted_at":1}"#,
        )
        .unwrap();
        match host.try_read_command().unwrap() {
            Some(Incoming::Malformed(e)) => assert_eq!(e.id.as_deref(), Some("bad")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!paths.command.exists());
    }

    #[tokio::test]
    async fn probe_reports_missing_directory() {
        let gateway = FileGatewayChannel::new(FilePaths::in_dir(Path::new("/nonexistent/bridge")));
        let status = gateway.probe().await;
        assert!(!status.available);
        assert_eq!(status.transport, "file");
    }

    #[tokio::test]
    async fn write_fails_when_directory_is_missing() {
        let gateway = FileGatewayChannel::new(FilePaths::in_dir(Path::new("/nonexistent/bridge")));
        let err = gateway
            .write_command(&Command::execute_code("1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelUnavailable);
    }
}
