//! Bridge configuration.
//!
//! An optional JSON document in `CAD_BRIDGE_CONFIG` supplies the base values;
//! individual `CAD_BRIDGE_*` variables override it. Both the gateway and the
//! host process read the same configuration so they agree on the channel.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::FilePaths;

pub const CONFIG_VAR: &str = "CAD_BRIDGE_CONFIG";

/// Which channel realization carries commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    File,
    Http,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "http" => Ok(Self::Http),
            other => bail!("unknown transport '{other}', expected 'file' or 'http'"),
        }
    }
}

/// Top-level configuration shared by the gateway and the host.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// How often the gateway polls for a response.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a caller waits for a response, queueing included.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Base URL of the host's HTTP endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_command_file")]
    pub command_file: PathBuf,

    #[serde(default = "default_response_file")]
    pub response_file: PathBuf,

    /// Host scheduler tick.
    #[serde(default = "default_tick")]
    pub tick_ms: u64,

    /// Script operation budget per command. 0 disables the watchdog.
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Application name the host reports.
    #[serde(default = "default_host_name")]
    pub host_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            poll_interval_ms: default_poll_interval(),
            timeout_ms: default_timeout(),
            endpoint: default_endpoint(),
            command_file: default_command_file(),
            response_file: default_response_file(),
            tick_ms: default_tick(),
            max_operations: default_max_operations(),
            host_name: default_host_name(),
        }
    }
}

const fn default_transport() -> TransportKind {
    TransportKind::File
}

const fn default_poll_interval() -> u64 {
    100
}

const fn default_timeout() -> u64 {
    10_000
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8765".into()
}

fn default_command_file() -> PathBuf {
    std::env::temp_dir().join("cad_bridge_command.json")
}

fn default_response_file() -> PathBuf {
    std::env::temp_dir().join("cad_bridge_response.json")
}

const fn default_tick() -> u64 {
    50
}

const fn default_max_operations() -> u64 {
    5_000_000
}

fn default_host_name() -> String {
    "cad-host".into()
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid {name}: '{raw}'"))
}

impl Config {
    /// Load from `CAD_BRIDGE_CONFIG` and the individual `CAD_BRIDGE_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_VAR) {
            Some(json) if !json.trim().is_empty() => {
                serde_json::from_str(&json).with_context(|| format!("Failed to parse {CONFIG_VAR}"))?
            }
            _ => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        debug!(config = ?config, "Configuration loaded");
        Ok(config)
    }

    /// Env vars take priority over the JSON document.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("CAD_BRIDGE_TRANSPORT") {
            self.transport = parse_var("CAD_BRIDGE_TRANSPORT", &v)?;
        }
        if let Some(v) = lookup("CAD_BRIDGE_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_var("CAD_BRIDGE_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("CAD_BRIDGE_TIMEOUT_MS") {
            self.timeout_ms = parse_var("CAD_BRIDGE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("CAD_BRIDGE_ENDPOINT") {
            self.endpoint = v.trim().to_string();
        }
        if let Some(v) = lookup("CAD_BRIDGE_COMMAND_FILE") {
            self.command_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAD_BRIDGE_RESPONSE_FILE") {
            self.response_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAD_BRIDGE_TICK_MS") {
            self.tick_ms = parse_var("CAD_BRIDGE_TICK_MS", &v)?;
        }
        if let Some(v) = lookup("CAD_BRIDGE_MAX_OPERATIONS") {
            self.max_operations = parse_var("CAD_BRIDGE_MAX_OPERATIONS", &v)?;
        }
        if let Some(v) = lookup("CAD_BRIDGE_HOST_NAME") {
            self.host_name = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be greater than zero");
        }
        if self.tick_ms == 0 {
            bail!("tick_ms must be greater than zero");
        }
        if self.command_file == self.response_file {
            bail!(
                "command and response files must differ (both are {})",
                self.command_file.display()
            );
        }
        let url = self.endpoint_url()?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("endpoint must be an http(s) URL, got '{}'", self.endpoint);
        }
        Ok(())
    }

    fn endpoint_url(&self) -> Result<reqwest::Url> {
        reqwest::Url::parse(&self.endpoint)
            .with_context(|| format!("invalid endpoint '{}'", self.endpoint))
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn file_paths(&self) -> FilePaths {
        FilePaths::new(&self.command_file, &self.response_file)
    }

    /// Socket address the host should listen on for the HTTP transport.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let url = self.endpoint_url()?;
        let host = url
            .host_str()
            .with_context(|| format!("endpoint '{}' has no host", self.endpoint))?;
        let port = url
            .port_or_known_default()
            .with_context(|| format!("endpoint '{}' has no port", self.endpoint))?;
        (host.trim_matches(|c| c == '[' || c == ']'), port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve '{host}'"))?
            .next()
            .with_context(|| format!("'{host}' resolved to no addresses"))
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_any_configuration() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.transport, TransportKind::File);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.tick(), Duration::from_millis(50));
        assert_eq!(config.max_operations, 5_000_000);
        assert_eq!(config.endpoint, "http://127.0.0.1:8765");
        assert!(config.command_file.ends_with("cad_bridge_command.json"));
        assert!(config.response_file.ends_with("cad_bridge_response.json"));
    }

    #[test]
    fn parse_config_json() {
        let json = r#"{
            "transport": "http",
            "endpoint": "http://localhost:9000",
            "timeout_ms": 2500
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.transport, TransportKind::Http);
        assert_eq!(config.timeout_ms, 2500);
        // Unset fields keep their defaults
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.host_name, "cad-host");
    }

    #[test]
    fn env_overrides_json() {
        let config = Config::from_lookup(lookup(&[
            (CONFIG_VAR, r#"{"transport": "http", "timeout_ms": 2500}"#),
            ("CAD_BRIDGE_TRANSPORT", "FILE"),
            ("CAD_BRIDGE_TIMEOUT_MS", "750"),
            ("CAD_BRIDGE_COMMAND_FILE", "/tmp/x/cmd.json"),
            ("CAD_BRIDGE_MAX_OPERATIONS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.transport, TransportKind::File);
        assert_eq!(config.timeout_ms, 750);
        assert_eq!(config.file_paths().command, PathBuf::from("/tmp/x/cmd.json"));
        assert_eq!(config.max_operations, 0);
    }

    #[test]
    fn invalid_values_are_errors() {
        for vars in [
            vec![("CAD_BRIDGE_TRANSPORT", "carrier-pigeon")],
            vec![("CAD_BRIDGE_TIMEOUT_MS", "soon")],
            vec![("CAD_BRIDGE_POLL_INTERVAL_MS", "0")],
            vec![("CAD_BRIDGE_ENDPOINT", "not a url")],
            vec![("CAD_BRIDGE_ENDPOINT", "ftp://127.0.0.1:21")],
            vec![(CONFIG_VAR, "{ nope")],
            vec![
                ("CAD_BRIDGE_COMMAND_FILE", "/tmp/same.json"),
                ("CAD_BRIDGE_RESPONSE_FILE", "/tmp/same.json"),
            ],
        ] {
            assert!(Config::from_lookup(lookup(&vars)).is_err(), "{vars:?}");
        }
    }

    #[test]
    fn error_names_the_variable() {
        let err = Config::from_lookup(lookup(&[("CAD_BRIDGE_TICK_MS", "fast")])).unwrap_err();
        assert!(format!("{err:#}").contains("CAD_BRIDGE_TICK_MS"));
    }

    #[test]
    fn listen_addr_from_endpoint() {
        let config = Config::from_json(r#"{"endpoint": "http://127.0.0.1:9123"}"#).unwrap();
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:9123".parse::<SocketAddr>().unwrap()
        );

        let config = Config::from_json(r#"{"endpoint": "http://127.0.0.1"}"#).unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 80);
    }
}
