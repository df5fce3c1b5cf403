//! cad-mcp-bridge
//!
//! `gateway --stdio` serves MCP tools and forwards each call to the host.
//! `host` runs the reference CAD host: one dedicated thread owns the document
//! and executes commands as they arrive on the configured channel.
//! Both read their settings from `CAD_BRIDGE_*` environment variables.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cad_mcp_bridge::config::{Config, TransportKind};
use cad_mcp_bridge::executor::HostExecutor;
use cad_mcp_bridge::host::HostContext;
use cad_mcp_bridge::mcp;
use cad_mcp_bridge::sandbox::Sandbox;
use cad_mcp_bridge::transport::{FileHostChannel, HostChannel, HttpHostServer};

#[derive(Parser, Debug)]
#[command(name = "cad-mcp-bridge")]
#[command(about = "MCP bridge into a single-threaded CAD host")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve MCP tools and forward commands to the host
    Gateway {
        /// Run in stdio mode (for MCP clients)
        #[arg(long)]
        stdio: bool,
    },
    /// Run the reference CAD host
    Host {
        /// Name of the document the host opens
        #[arg(long, default_value = "Untitled")]
        document: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        transport = ?config.transport,
        timeout_ms = config.timeout_ms,
        poll_interval_ms = config.poll_interval_ms,
        "Loaded configuration"
    );

    match args.mode {
        Mode::Gateway { stdio: true } => mcp::serve_stdio(config).await,
        Mode::Gateway { stdio: false } => {
            anyhow::bail!("Only --stdio mode is currently supported")
        }
        Mode::Host { document } => run_host(config, document).await,
    }
}

async fn run_host(config: Config, document: String) -> Result<()> {
    let mut http_server = None;
    let channel: Box<dyn HostChannel + Send> = match config.transport {
        TransportKind::File => {
            let paths = config.file_paths();
            info!(
                command = %paths.command.display(),
                response = %paths.response.display(),
                "Host watching command file"
            );
            Box::new(FileHostChannel::new(paths))
        }
        TransportKind::Http => {
            let addr = config.listen_addr()?;
            let (server, channel) = HttpHostServer::bind(&addr.to_string(), &config.host_name)
                .await
                .with_context(|| format!("Failed to bind host endpoint {addr}"))?;
            info!(addr = %server.local_addr()?, "Host listening");
            let (stop_server, stopped) = tokio::sync::oneshot::channel::<()>();
            let task = tokio::spawn(server.run_until(async move {
                let _ = stopped.await;
            }));
            http_server = Some((stop_server, task));
            Box::new(channel)
        }
    };

    let (stop_host, stop_rx) = std::sync::mpsc::channel::<()>();
    let host_name = config.host_name.clone();
    let tick = config.tick();
    let max_operations = config.max_operations;
    let host_thread = std::thread::Builder::new()
        .name("cad-host".into())
        .spawn(move || {
            let host = HostContext::new(&host_name, &document);
            let executor = HostExecutor::new(channel, Sandbox::new(max_operations));
            executor.run_until(&host, tick, &stop_rx);
        })
        .context("Failed to spawn host thread")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down host");

    let _ = stop_host.send(());
    tokio::task::spawn_blocking(move || host_thread.join())
        .await
        .context("Failed to join host thread")?
        .map_err(|_| anyhow!("Host thread panicked"))?;

    if let Some((stop_server, task)) = http_server {
        let _ = stop_server.send(());
        task.await.context("HTTP server task failed")??;
    }
    Ok(())
}
